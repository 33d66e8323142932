//! Switch-facing wire format of an emulated Pro Controller: 0x30 input
//! reports, 0x21 subcommand replies and the SPI flash reads the console
//! makes while pairing.
//!
//! Constant data follows the layout documented by the NXBT/joycontrol
//! projects.

use tracing::debug;

use crate::input::{Button, Buttons, InputSnapshot, Stick};

/// HID transaction header for input reports (DATA | Input).
pub const HID_INPUT: u8 = 0xA1;
/// HID transaction header for output reports from the console.
pub const HID_OUTPUT: u8 = 0xA2;

pub const REPORT_STANDARD: u8 = 0x30;
pub const REPORT_SUBCOMMAND_REPLY: u8 = 0x21;
/// Output report carrying rumble + subcommand.
pub const REPORT_RUMBLE_SUBCOMMAND: u8 = 0x01;
pub const REPORT_RUMBLE_ONLY: u8 = 0x10;
/// Output report with no rumble, used on the wired link.
pub const REPORT_USB_COMMAND: u8 = 0x80;

pub const SUBCMD_SET_INPUT_MODE: u8 = 0x03;

/// Report length including the 0xA1 header.
pub const REPORT_LEN: usize = 50;

const BATTERY_FULL: u8 = 0x90;
const VIBRATOR: u8 = 0xB0;
const STICK_CENTER: u16 = 0x800;
const STICK_MAX: u16 = 0xFFF;

/// Offset of the subcommand id within a 0x01 output report (after the
/// counter and 8 bytes of rumble data).
const SUBCMD_OFFSET: usize = 10;

/// Switch report bit for each button: (button, byte, mask).
///
/// byte 0 (right):  Y X B A _ _ R ZR
/// byte 1 (shared): - + RS LS HOME CAP _ _
/// byte 2 (left):   DD DU DR DL _ _ L ZL
const BUTTON_MAP: [(Button, usize, u8); 18] = [
    (Button::Y, 0, 0x01),
    (Button::X, 0, 0x02),
    (Button::B, 0, 0x04),
    (Button::A, 0, 0x08),
    (Button::R, 0, 0x40),
    (Button::ZR, 0, 0x80),
    (Button::Select, 1, 0x01),
    (Button::Start, 1, 0x02),
    (Button::R3, 1, 0x04),
    (Button::L3, 1, 0x08),
    (Button::Home, 1, 0x10),
    (Button::Capture, 1, 0x20),
    (Button::DpadDown, 2, 0x01),
    (Button::DpadUp, 2, 0x02),
    (Button::DpadRight, 2, 0x04),
    (Button::DpadLeft, 2, 0x08),
    (Button::L, 2, 0x40),
    (Button::ZL, 2, 0x80),
];

pub fn encode_buttons(buttons: Buttons) -> [u8; 3] {
    let mut out = [0u8; 3];
    for &(btn, byte, mask) in &BUTTON_MAP {
        if buttons.contains(btn) {
            out[byte] |= mask;
        }
    }
    out
}

fn stick_axis(v: f32) -> u16 {
    let scaled = v * (STICK_CENTER - 1) as f32 + STICK_CENTER as f32;
    scaled.round().clamp(0.0, STICK_MAX as f32) as u16
}

/// Two 12-bit axes, packed low nibble first.
pub fn pack_stick(stick: Stick) -> [u8; 3] {
    let x = stick_axis(stick.x);
    let y = stick_axis(stick.y);
    [
        (x & 0xFF) as u8,
        ((x >> 8) & 0x0F) as u8 | (((y & 0x0F) as u8) << 4),
        ((y >> 4) & 0xFF) as u8,
    ]
}

/// Common prefix of 0x30 and 0x21 reports: header, id, timer, battery,
/// buttons, sticks, vibrator.
fn report_header(id: u8, timer: u8, snapshot: &InputSnapshot) -> [u8; REPORT_LEN] {
    let mut report = [0u8; REPORT_LEN];
    report[0] = HID_INPUT;
    report[1] = id;
    report[2] = timer;
    report[3] = BATTERY_FULL;
    report[4..7].copy_from_slice(&encode_buttons(snapshot.buttons));
    report[7..10].copy_from_slice(&pack_stick(snapshot.left));
    report[10..13].copy_from_slice(&pack_stick(snapshot.right));
    report[13] = VIBRATOR;
    report
}

/// Standard full input report.
pub fn input_report(snapshot: &InputSnapshot, timer: u8) -> [u8; REPORT_LEN] {
    report_header(REPORT_STANDARD, timer, snapshot)
}

/// Subcommand reply, with neutral input.
pub fn subcommand_reply(timer: u8, subcmd: u8, ack: u8, data: &[u8]) -> [u8; REPORT_LEN] {
    let mut reply = report_header(REPORT_SUBCOMMAND_REPLY, timer, &InputSnapshot::neutral());
    reply[14] = ack;
    reply[15] = subcmd;
    let n = data.len().min(REPORT_LEN - 16);
    reply[16..16 + n].copy_from_slice(&data[..n]);
    reply
}

/// A parsed output report from the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleRequest<'a> {
    Subcommand { id: u8, args: &'a [u8] },
    Rumble,
    /// Wired-link command (0x80 xx).
    UsbCommand(u8),
    Unknown(u8),
}

pub fn parse_request(data: &[u8]) -> Option<ConsoleRequest<'_>> {
    let data = match data.first() {
        Some(&HID_OUTPUT) => &data[1..],
        _ => data,
    };
    let kind = *data.first()?;
    let request = match kind {
        REPORT_RUMBLE_SUBCOMMAND | 0x11 if data.len() > SUBCMD_OFFSET => ConsoleRequest::Subcommand {
            id: data[SUBCMD_OFFSET],
            args: &data[SUBCMD_OFFSET + 1..],
        },
        REPORT_RUMBLE_ONLY => ConsoleRequest::Rumble,
        REPORT_USB_COMMAND => ConsoleRequest::UsbCommand(*data.get(1)?),
        other => ConsoleRequest::Unknown(other),
    };
    Some(request)
}

/// Reply to a wired-link command, if it wants one.
pub fn usb_command_reply(cmd: u8) -> Option<Vec<u8>> {
    match cmd {
        // Connection status: Pro Controller, wired
        0x01 => Some(vec![0x81, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00]),
        // Handshake, baudrate, disable USB timeout
        0x02 | 0x03 | 0x05 => Some(vec![0x81, cmd]),
        _ => None,
    }
}

/// Device info: firmware 3.72, Pro Controller, MAC, colours in SPI.
const DEVICE_INFO: [u8; 12] = [0x03, 0x48, 0x03, 0x02, 0x98, 0xB6, 0xE9, 0x46, 0x50, 0x6A, 0x01, 0x01];

/// ACK byte and reply payload for a subcommand.
pub fn answer_subcommand(id: u8, args: &[u8]) -> (u8, Vec<u8>) {
    match id {
        0x02 => (0x82, DEVICE_INFO.to_vec()),
        0x04 => (0x83, Vec::new()),
        0x10 => match args {
            [a0, a1, a2, a3, len, ..] => {
                let addr = u32::from_le_bytes([*a0, *a1, *a2, *a3]);
                let mut data = vec![*a0, *a1, *a2, *a3, *len];
                data.extend(spi_read(addr, *len));
                (0x90, data)
            }
            _ => (0x80, Vec::new()),
        },
        // NFC/IR MCU configuration
        0x21 => (0xA0, vec![0x01, 0x00, 0xFF, 0x00, 0x03, 0x00, 0x05, 0x01]),
        // Input mode, shipment state, player lights, HOME light, IMU, vibration
        SUBCMD_SET_INPUT_MODE | 0x08 | 0x30 | 0x38 | 0x40 | 0x41 | 0x48 => (0x80, Vec::new()),
        other => {
            debug!("[BT] Unknown subcommand 0x{other:02X}, generic ACK");
            (0x80, Vec::new())
        }
    }
}

/// Contents of the emulated SPI flash.
pub fn spi_read(addr: u32, len: u8) -> Vec<u8> {
    let len = len as usize;
    let mut data = match addr {
        // Serial number: none
        0x6000 => vec![0xFF; len],
        // Body, buttons, left grip, right grip
        0x6050 => vec![0x32, 0x32, 0x32, 0xFF, 0xFF, 0xFF, 0x32, 0x32, 0x32, 0xFF, 0xFF, 0xFF, 0x03],
        // IMU factory calibration
        0x6020 => vec![
            0xBE, 0xFF, 0x3E, 0x00, 0xF0, 0x01, 0x00, 0x40, 0x00, 0x40, 0x00, 0x40, 0xFE, 0xFF, 0xFE, 0xFF,
            0x08, 0x00, 0xE7, 0x3B, 0xE7, 0x3B, 0xE7, 0x3B,
        ],
        // Factory stick calibration, left then right: centre 0x800, range 0x700
        0x603D => [0x00, 0x07, 0x70, 0x00, 0x08, 0x80, 0x00, 0x07, 0x70].repeat(2),
        0x6080 => vec![0x50, 0xFD, 0x00, 0x00, 0xC6, 0x0F],
        // Stick deadzone and range ratio
        0x6086 => vec![
            0x0F, 0x30, 0x61, 0x96, 0x30, 0xF3, 0xD4, 0x14, 0x54, 0x41, 0x15, 0x54, 0xC7, 0x79, 0x9C, 0x33,
            0x36, 0x63,
        ],
        // No user calibration (stick, IMU)
        0x8010 | 0x8026 => vec![0xFF; len],
        _ => Vec::new(),
    };
    data.resize(len, 0x00);
    data
}
