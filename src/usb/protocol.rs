//! Switch 2 Pro Controller (057E:2069) wire protocol tables.
//!
//! Everything reverse-engineered about the device lives here: the ordered
//! handshake command list, the input report byte-offset table, and the
//! player-LED command patterns. A protocol revision should only touch this
//! file.

pub const VENDOR_ID: u16 = 0x057E;
pub const PRODUCT_ID: u16 = 0x2069;

/// Interface carrying the vendor bulk endpoints used by the handshake.
pub const VENDOR_INTERFACE: u8 = 1;

pub const REPORT_LEN: usize = 64;
pub const REPORT_ID: u8 = 0x09;

/// Partial-init state: sticks report, buttons and triggers stay zero.
pub const MODE_DEGRADED: u8 = 0x20;
/// Full input reporting, reached after the complete handshake.
pub const MODE_FULL: u8 = 0x23;

/// Byte offsets inside a 64-byte input report.
#[derive(Debug, Clone, Copy)]
pub struct ReportLayout {
    pub report_id: usize,
    pub counter: usize,
    pub mode: usize,
    /// First of three button bytes.
    pub buttons: usize,
    /// First byte of the 12-bit packed X/Y triplet.
    pub left_stick: usize,
    pub right_stick: usize,
    pub left_trigger: usize,
    pub right_trigger: usize,
}

/// ```text
///   [0]     report id (0x09)
///   [1]     counter
///   [2]     mode (0x20 degraded / 0x23 full)
///   [3..6]  button bitfields
///   [6..9]  left stick, 12-bit packed X/Y
///   [9..12] right stick
///   [12]    unknown
///   [13]    left trigger
///   [14]    right trigger
/// ```
pub const LAYOUT: ReportLayout = ReportLayout {
    report_id: 0,
    counter: 1,
    mode: 2,
    buttons: 3,
    left_stick: 6,
    right_stick: 9,
    left_trigger: 13,
    right_trigger: 14,
};

/// One command of the bring-up sequence.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeStep {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

/// How many leading steps bring the device only as far as [`MODE_DEGRADED`].
pub const DEGRADED_PREFIX: usize = 3;

/// The 17-command bring-up sequence, sent in order over the bulk OUT endpoint.
pub const HANDSHAKE: [HandshakeStep; 17] = [
    HandshakeStep {
        name: "INIT_COMMAND_0x03",
        bytes: &[0x03, 0x91, 0x00, 0x0D, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    },
    HandshakeStep {
        name: "UNKNOWN_COMMAND_0x07",
        bytes: &[0x07, 0x91, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "UNKNOWN_COMMAND_0x16",
        bytes: &[0x16, 0x91, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "REQUEST_CONTROLLER_MAC",
        bytes: &[
            0x15, 0x91, 0x00, 0x01, 0x00, 0x0E, 0x00, 0x00, 0x00, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        ],
    },
    HandshakeStep {
        name: "LTK_REQUEST",
        bytes: &[
            0x15, 0x91, 0x00, 0x02, 0x00, 0x11, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        ],
    },
    HandshakeStep {
        name: "UNKNOWN_COMMAND_0x15_ARG_0x03",
        bytes: &[0x15, 0x91, 0x00, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "UNKNOWN_COMMAND_0x09",
        bytes: &[0x09, 0x91, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "IMU_COMMAND_0x02",
        bytes: &[0x0C, 0x91, 0x00, 0x02, 0x00, 0x04, 0x00, 0x00, 0x27, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "OUT_UNKNOWN_COMMAND_0x11",
        bytes: &[0x11, 0x91, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "UNKNOWN_COMMAND_0x0A",
        bytes: &[
            0x0A, 0x91, 0x00, 0x08, 0x00, 0x14, 0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0x35, 0x00, 0x46, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ],
    },
    HandshakeStep {
        name: "IMU_COMMAND_0x04",
        bytes: &[0x0C, 0x91, 0x00, 0x04, 0x00, 0x04, 0x00, 0x00, 0x27, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "ENABLE_HAPTICS",
        bytes: &[0x03, 0x91, 0x00, 0x0A, 0x00, 0x04, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "OUT_UNKNOWN_COMMAND_0x10",
        bytes: &[0x10, 0x91, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "OUT_UNKNOWN_COMMAND_0x01",
        bytes: &[0x01, 0x91, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "OUT_UNKNOWN_COMMAND_0x03",
        bytes: &[0x03, 0x91, 0x00, 0x01, 0x00, 0x00, 0x00],
    },
    HandshakeStep {
        name: "OUT_UNKNOWN_COMMAND_0x0A_ALT",
        bytes: &[0x0A, 0x91, 0x00, 0x02, 0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0x00],
    },
    HandshakeStep {
        name: "SET_PLAYER_LED",
        bytes: &[0x09, 0x91, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    },
];

/// Player-LED command: the SET_PLAYER_LED frame with its pattern bytes at [8..10].
const fn led_command(pattern: u8, blink: u8) -> [u8; 16] {
    [0x09, 0x91, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, pattern, blink, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
}

/// LED 1 on.
pub const LED_NORMAL: [u8; 16] = led_command(0x01, 0x00);
/// LEDs 2+3 on.
pub const LED_MACRO_MODE: [u8; 16] = led_command(0x06, 0x00);
/// All four blinking.
pub const LED_RECORDING: [u8; 16] = led_command(0x0F, 0xF0);
/// LEDs 1+3 on.
pub const LED_PLAYBACK: [u8; 16] = led_command(0x05, 0x00);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_ends_with_player_led_one() {
        let last = HANDSHAKE[HANDSHAKE.len() - 1];
        assert_eq!(last.name, "SET_PLAYER_LED");
        assert_eq!(last.bytes, &LED_NORMAL[..]);
    }

    #[test]
    fn test_every_step_is_a_vendor_frame() {
        for step in &HANDSHAKE {
            assert_eq!(step.bytes[1], 0x91, "{} is missing the 0x91 marker", step.name);
        }
    }

    #[test]
    fn test_layout_fits_in_a_report() {
        assert!(LAYOUT.right_trigger < REPORT_LEN);
        assert!(LAYOUT.right_stick + 3 <= REPORT_LEN);
        assert_eq!(LAYOUT.buttons + 3, LAYOUT.left_stick);
    }
}
