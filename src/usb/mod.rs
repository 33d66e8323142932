//! Physical controller side: protocol tables, the bring-up handshake, the
//! nusb/hidapi device backend and the HID report stream.

pub mod device;
pub mod handshake;
pub mod hid;
pub mod protocol;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use self::hid::ReportStream;

/// Raw 64-byte HID input report.
pub type HidReport = [u8; protocol::REPORT_LEN];

/// Where in the bring-up a deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 1-based index into [`protocol::HANDSHAKE`].
    Command(usize),
    /// Reading the mode byte back after the last command.
    ModeReadback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Command(n) => write!(f, "command {n}/{}", protocol::HANDSHAKE.len()),
            Stage::ModeReadback => f.write_str("mode read-back"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("USB device {:04X}:{:04X} not found", protocol::VENDOR_ID, protocol::PRODUCT_ID)]
    NotFound,

    #[error("interface {} is held by another process", protocol::VENDOR_INTERFACE)]
    DeviceBusy,

    #[error("no acknowledgement at {stage}")]
    Timeout { stage: Stage },

    #[error("device reports mode 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedMode { expected: u8, actual: u8 },

    #[error("USB I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Failures where the device could not be reached or claimed at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::NotFound | TransportError::DeviceBusy)
    }
}

/// A physical controller that can be brought up and read from.
///
/// Implemented by [`device::ProController`] for real hardware and by
/// scripted doubles in tests.
pub trait UsbDevice {
    type Interface: VendorInterface;

    /// Claim the vendor interface. The claim is released when the returned
    /// value is dropped.
    fn claim(&self) -> impl Future<Output = Result<Self::Interface, TransportError>>;

    /// Read the mode byte of the next input report.
    fn read_mode(&self, deadline: Duration) -> impl Future<Output = Result<u8, TransportError>>;

    /// Start streaming input reports. Stream closure means the device went away.
    fn open_reports(&self) -> Result<ReportStream, TransportError>;
}

/// A claimed vendor interface.
pub trait VendorInterface {
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>>;

    /// Wait for the acknowledgement of the last write. `Ok(false)` means the
    /// deadline passed without one.
    fn read_ack(&mut self, deadline: Duration) -> impl Future<Output = Result<bool, TransportError>>;
}
