//! Real hardware backend: nusb for the vendor bulk interface, hidapi for
//! the report stream.

use std::time::{Duration, Instant};

use nusb::transfer::{Direction, RequestBuffer};
use tracing::{debug, warn};

use super::hid::{self, ReportStream};
use super::protocol::{LAYOUT, PRODUCT_ID, REPORT_ID, REPORT_LEN, VENDOR_ID, VENDOR_INTERFACE};
use super::{Stage, TransportError, UsbDevice, VendorInterface};

/// Reports buffered between the reader thread and the hardware loop.
const REPORT_CHANNEL_CAP: usize = 2;
const LED_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// The Switch 2 Pro Controller on the local USB bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProController;

fn find_device() -> Result<nusb::Device, TransportError> {
    let devices = nusb::list_devices().map_err(|e| TransportError::Io(e.to_string()))?;
    let info = devices
        .into_iter()
        .find(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
        .ok_or(TransportError::NotFound)?;
    info.open().map_err(|e| map_claim_error(&e))
}

fn map_claim_error(e: &std::io::Error) -> TransportError {
    match e.raw_os_error() {
        Some(libc::EBUSY) => TransportError::DeviceBusy,
        Some(libc::ENODEV) | Some(libc::ENOENT) => TransportError::NotFound,
        _ => TransportError::Io(e.to_string()),
    }
}

/// Claimed vendor interface. Dropping it releases the claim and hands the
/// interface back to the kernel driver.
pub struct ClaimedInterface {
    device: nusb::Device,
    interface: Option<nusb::Interface>,
    ep_out: u8,
    ep_in: Option<u8>,
}

impl UsbDevice for ProController {
    type Interface = ClaimedInterface;

    async fn claim(&self) -> Result<ClaimedInterface, TransportError> {
        let device = find_device()?;

        // Kernel driver may not be bound; either way we try to claim.
        let _ = device.detach_kernel_driver(VENDOR_INTERFACE);

        let interface = match device.claim_interface(VENDOR_INTERFACE) {
            Ok(i) => i,
            Err(e) => {
                let _ = device.attach_kernel_driver(VENDOR_INTERFACE);
                return Err(map_claim_error(&e));
            }
        };

        let mut claimed = ClaimedInterface {
            device,
            interface: Some(interface),
            ep_out: 0,
            ep_in: None,
        };

        let config = claimed
            .device
            .active_configuration()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let alt = config
            .interface_alt_settings()
            .find(|i| i.interface_number() == VENDOR_INTERFACE)
            .ok_or_else(|| TransportError::Io(format!("interface {VENDOR_INTERFACE} not found")))?;

        let mut ep_out = None;
        for ep in alt.endpoints() {
            match ep.direction() {
                Direction::Out => ep_out = Some(ep.address()),
                Direction::In => claimed.ep_in = Some(ep.address()),
            }
        }
        claimed.ep_out = ep_out.ok_or_else(|| TransportError::Io("no bulk OUT endpoint".into()))?;

        debug!(
            "[USB] Claimed interface {VENDOR_INTERFACE} (out 0x{:02X}, in {:?})",
            claimed.ep_out, claimed.ep_in
        );
        Ok(claimed)
    }

    async fn read_mode(&self, deadline: Duration) -> Result<u8, TransportError> {
        tokio::task::spawn_blocking(move || read_mode_blocking(deadline))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
    }

    fn open_reports(&self) -> Result<ReportStream, TransportError> {
        hid::spawn_reader(REPORT_CHANNEL_CAP)
    }
}

fn read_mode_blocking(deadline: Duration) -> Result<u8, TransportError> {
    let started = Instant::now();
    let api = hidapi::HidApi::new().map_err(|e| TransportError::Io(e.to_string()))?;
    // The node may still be coming back; that wait counts against the deadline
    let device = hid::open_device(&api, deadline.saturating_sub(started.elapsed()))?;

    let mut buf = [0u8; REPORT_LEN];
    while started.elapsed() < deadline {
        let remaining = deadline.saturating_sub(started.elapsed());
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
        match device.read_timeout(&mut buf, timeout_ms) {
            Ok(n) if n >= REPORT_LEN && buf[LAYOUT.report_id] == REPORT_ID => {
                return Ok(buf[LAYOUT.mode]);
            }
            Ok(_) => continue,
            Err(e) => return Err(TransportError::Io(format!("HID read error: {e}"))),
        }
    }
    Err(TransportError::Timeout {
        stage: Stage::ModeReadback,
    })
}

impl ClaimedInterface {
    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or_else(|| TransportError::Io("interface already released".into()))
    }
}

impl VendorInterface for ClaimedInterface {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let completion = self.interface()?.bulk_out(self.ep_out, bytes.to_vec()).await;
        completion
            .status
            .map_err(|e| TransportError::Io(format!("bulk write failed: {e}")))
    }

    async fn read_ack(&mut self, deadline: Duration) -> Result<bool, TransportError> {
        let Some(ep_in) = self.ep_in else {
            // Nothing to read acks from; the write completing is all we get.
            return Ok(true);
        };
        let read = self.interface()?.bulk_in(ep_in, RequestBuffer::new(REPORT_LEN));
        match tokio::time::timeout(deadline, read).await {
            Ok(completion) => completion
                .status
                .map(|_| true)
                .map_err(|e| TransportError::Io(format!("bulk read failed: {e}"))),
            Err(_) => Ok(false),
        }
    }
}

impl Drop for ClaimedInterface {
    fn drop(&mut self) {
        drop(self.interface.take());
        if let Err(e) = self.device.attach_kernel_driver(VENDOR_INTERFACE) {
            debug!("[USB] Kernel driver reattach: {e}");
        }
    }
}

/// Write a player-LED pattern to the physical controller.
///
/// Opens a fresh claim, sends the pattern and releases. Best-effort: the LEDs
/// are cosmetic, so failures are logged and swallowed.
pub async fn write_led_pattern(pattern: &'static [u8]) {
    let device = match find_device() {
        Ok(d) => d,
        Err(e) => {
            debug!("[LED] Device unavailable for LED write: {e}");
            return;
        }
    };

    let _ = device.detach_kernel_driver(VENDOR_INTERFACE);
    match device.claim_interface(VENDOR_INTERFACE) {
        Ok(interface) => {
            let ep_out = device.active_configuration().ok().and_then(|config| {
                config
                    .interface_alt_settings()
                    .find(|i| i.interface_number() == VENDOR_INTERFACE)
                    .and_then(|alt| {
                        alt.endpoints()
                            .find(|ep| ep.direction() == Direction::Out)
                            .map(|ep| ep.address())
                    })
            });
            match ep_out {
                Some(ep) => {
                    let write = interface.bulk_out(ep, pattern.to_vec());
                    match tokio::time::timeout(LED_WRITE_TIMEOUT, write).await {
                        Ok(completion) => {
                            if let Err(e) = completion.status {
                                debug!("[LED] Write failed: {e}");
                            }
                        }
                        Err(_) => debug!("[LED] Write timed out"),
                    }
                }
                None => warn!("[LED] No bulk OUT endpoint for LED write"),
            }
        }
        Err(e) => debug!("[LED] Could not claim interface for LED write: {e}"),
    }
    let _ = device.attach_kernel_driver(VENDOR_INTERFACE);
}
