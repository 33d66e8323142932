//! Input snapshots and the USB HID report decoder.
//!
//! A report is validated (report id, then mode byte) before anything else is
//! read. Offsets come from [`LAYOUT`]; see `usb::protocol` for the byte map.

use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use thiserror::Error;

use crate::calibration::Calibration;
use crate::usb::protocol::{LAYOUT, MODE_DEGRADED, MODE_FULL, REPORT_ID};
use crate::usb::HidReport;

/// Physical buttons, in USB report bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    B,
    A,
    Y,
    X,
    R,
    ZR,
    /// (+)
    Start,
    R3,
    DpadDown,
    DpadRight,
    DpadLeft,
    DpadUp,
    L,
    ZL,
    /// (−)
    Select,
    L3,
    Home,
    Capture,
}

impl Button {
    pub const ALL: [Button; 18] = [
        Button::B,
        Button::A,
        Button::Y,
        Button::X,
        Button::R,
        Button::ZR,
        Button::Start,
        Button::R3,
        Button::DpadDown,
        Button::DpadRight,
        Button::DpadLeft,
        Button::DpadUp,
        Button::L,
        Button::ZL,
        Button::Select,
        Button::L3,
        Button::Home,
        Button::Capture,
    ];

    /// (byte_index_in_button_field, bitmask)
    pub const fn position(self) -> (usize, u8) {
        match self {
            Button::B => (0, 0x01),
            Button::A => (0, 0x02),
            Button::Y => (0, 0x04),
            Button::X => (0, 0x08),
            Button::R => (0, 0x10),
            Button::ZR => (0, 0x20),
            Button::Start => (0, 0x40),
            Button::R3 => (0, 0x80),
            Button::DpadDown => (1, 0x01),
            Button::DpadRight => (1, 0x02),
            Button::DpadLeft => (1, 0x04),
            Button::DpadUp => (1, 0x08),
            Button::L => (1, 0x10),
            Button::ZL => (1, 0x20),
            Button::Select => (1, 0x40),
            Button::L3 => (1, 0x80),
            Button::Home => (2, 0x01),
            Button::Capture => (2, 0x02),
        }
    }

    const fn bit(self) -> u32 {
        let (byte, mask) = self.position();
        (mask as u32) << (byte * 8)
    }
}

/// Button bitset. Bit `n` is bit `n % 8` of report button byte `n / 8`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Buttons(u32);

const KNOWN_BITS: u32 = 0x03_FF_FF;

impl Buttons {
    pub const NONE: Buttons = Buttons(0);

    /// Chord helper for `const` contexts.
    pub const fn of(buttons: &[Button]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < buttons.len() {
            bits |= buttons[i].bit();
            i += 1;
        }
        Buttons(bits)
    }

    pub const fn from_report_bytes(bytes: [u8; 3]) -> Self {
        Buttons((bytes[0] as u32 | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16) & KNOWN_BITS)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Buttons(bits & KNOWN_BITS)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, btn: Button) -> bool {
        self.0 & btn.bit() != 0
    }

    pub const fn contains_all(self, other: Buttons) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Buttons) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: Buttons) -> Buttons {
        Buttons(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = Button> {
        Button::ALL.into_iter().filter(move |b| self.contains(*b))
    }
}

impl From<Button> for Buttons {
    fn from(btn: Button) -> Self {
        Buttons(btn.bit())
    }
}

impl BitOr for Buttons {
    type Output = Buttons;

    fn bitor(self, rhs: Buttons) -> Buttons {
        Buttons(self.0 | rhs.0)
    }
}

impl BitOrAssign for Buttons {
    fn bitor_assign(&mut self, rhs: Buttons) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<Button> for Buttons {
    fn from_iter<I: IntoIterator<Item = Button>>(iter: I) -> Self {
        iter.into_iter().fold(Buttons::NONE, |acc, b| acc | b.into())
    }
}

/// Normalized stick position, both axes in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stick {
    pub x: f32,
    pub y: f32,
}

impl Stick {
    pub const CENTER: Stick = Stick { x: 0.0, y: 0.0 };
}

/// One decoded, calibrated instant of controller state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSnapshot {
    pub buttons: Buttons,
    pub left: Stick,
    pub right: Stick,
    /// [0, 1]
    pub left_trigger: f32,
    /// [0, 1]
    pub right_trigger: f32,
    /// Monotonic time since session start. For recorded frames, the offset
    /// since recording start.
    pub timestamp: Duration,
}

impl Default for InputSnapshot {
    fn default() -> Self {
        Self::neutral()
    }
}

impl InputSnapshot {
    /// Nothing pressed, sticks centred.
    pub const fn neutral() -> Self {
        Self {
            buttons: Buttons::NONE,
            left: Stick::CENTER,
            right: Stick::CENTER,
            left_trigger: 0.0,
            right_trigger: 0.0,
            timestamp: Duration::ZERO,
        }
    }

    pub fn at(self, timestamp: Duration) -> Self {
        Self { timestamp, ..self }
    }

    /// Copy with `mask` buttons released.
    pub fn masked(self, mask: Buttons) -> Self {
        Self {
            buttons: self.buttons.without(mask),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected report id 0x{0:02X}")]
    WrongReportId(u8),

    /// The handshake has not completed; buttons and triggers read as zero.
    #[error("controller is in degraded mode 0x20")]
    DegradedMode,

    #[error("unknown mode byte 0x{0:02X}")]
    UnexpectedMode(u8),
}

/// Unpack two 12-bit values from 3 bytes (little-endian nibble packing).
/// Byte layout: [lo8_a] [hi4_a | lo4_b] [hi8_b]
pub fn unpack_12bit_triplet(data: [u8; 3]) -> (u16, u16) {
    let a = (data[0] as u16) | (((data[1] & 0x0F) as u16) << 8);
    let b = ((data[1] >> 4) as u16) | ((data[2] as u16) << 4);
    (a, b)
}

fn triplet(report: &HidReport, at: usize) -> [u8; 3] {
    [report[at], report[at + 1], report[at + 2]]
}

/// Raw 12-bit stick readings, before calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSticks {
    pub left: (u16, u16),
    pub right: (u16, u16),
}

impl RawSticks {
    pub fn from_report(report: &HidReport) -> Self {
        Self {
            left: unpack_12bit_triplet(triplet(report, LAYOUT.left_stick)),
            right: unpack_12bit_triplet(triplet(report, LAYOUT.right_stick)),
        }
    }
}

/// Decode a full-mode report. The caller stamps the time with
/// [`InputSnapshot::at`].
pub fn decode(raw: &HidReport, calibration: &Calibration) -> Result<InputSnapshot, DecodeError> {
    match raw[LAYOUT.report_id] {
        REPORT_ID => {}
        other => return Err(DecodeError::WrongReportId(other)),
    }
    match raw[LAYOUT.mode] {
        MODE_FULL => {}
        MODE_DEGRADED => return Err(DecodeError::DegradedMode),
        other => return Err(DecodeError::UnexpectedMode(other)),
    }

    let buttons = Buttons::from_report_bytes(triplet(raw, LAYOUT.buttons));
    let (left, right) = calibration.sticks(&RawSticks::from_report(raw));

    Ok(InputSnapshot {
        buttons,
        left,
        right,
        left_trigger: calibration.trigger(raw[LAYOUT.left_trigger]),
        right_trigger: calibration.trigger(raw[LAYOUT.right_trigger]),
        timestamp: Duration::ZERO,
    })
}
