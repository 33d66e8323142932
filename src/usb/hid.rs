//! HID report stream.
//!
//! hidapi reads block, so reports are pulled on a dedicated OS thread and
//! handed to the async side through a small bounded channel. The stream
//! ends when the device disconnects; closing it from our side makes the
//! reader thread exit and release the device.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::protocol::{PRODUCT_ID, REPORT_LEN, VENDOR_ID};
use super::{HidReport, TransportError};

/// How long the reader waits for the HID node after a handshake.
const OPEN_BUDGET: Duration = Duration::from_secs(5);
const OPEN_RETRY: Duration = Duration::from_millis(500);
const READ_TIMEOUT_MS: i32 = 100;

pub struct ReportStream {
    rx: mpsc::Receiver<HidReport>,
    reader: Option<JoinHandle<()>>,
}

impl ReportStream {
    /// Stream fed by a test instead of a reader thread.
    #[cfg(test)]
    pub fn from_channel(rx: mpsc::Receiver<HidReport>) -> Self {
        Self { rx, reader: None }
    }

    /// Next report, or `None` once the device is gone.
    pub async fn recv(&mut self) -> Option<HidReport> {
        self.rx.recv().await
    }

    /// Stop the reader and wait for it to let go of the device.
    pub async fn close(mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        if let Some(reader) = self.reader.take() {
            if tokio::task::spawn_blocking(move || reader.join()).await.is_err() {
                warn!("[HID] Reader thread did not shut down cleanly");
            }
        }
        debug!("[HID] Report stream closed");
    }
}

/// Spawn the HID reader thread.
pub fn spawn_reader(channel_cap: usize) -> Result<ReportStream, TransportError> {
    let (tx, rx) = mpsc::channel::<HidReport>(channel_cap);

    let reader = std::thread::Builder::new()
        .name("hid-reader".into())
        .spawn(move || {
            if let Err(e) = reader_loop(&tx) {
                error!("[HID] Reader thread exited with error: {e}");
            }
        })
        .map_err(|e| TransportError::Io(format!("failed to spawn HID reader thread: {e}")))?;

    Ok(ReportStream {
        rx,
        reader: Some(reader),
    })
}

/// Call `attempt` until it succeeds, sleeping `interval` in between, but
/// never start a sleep that would end past `budget`. Always tries once.
fn retry_within<T, E>(
    budget: Duration,
    interval: Duration,
    mut attempt: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let started = Instant::now();
    let mut n = 1;
    loop {
        match attempt(n) {
            Ok(v) => return Ok(v),
            Err(e) if started.elapsed() + interval >= budget => return Err(e),
            Err(_) => {
                std::thread::sleep(interval);
                n += 1;
            }
        }
    }
}

/// Open the controller's HID node, waiting up to `budget` for it to
/// reappear after the kernel driver is reattached.
pub(crate) fn open_device(api: &hidapi::HidApi, budget: Duration) -> Result<hidapi::HidDevice, TransportError> {
    retry_within(budget, OPEN_RETRY, |attempt| {
        api.open(VENDOR_ID, PRODUCT_ID).map_err(|e| {
            debug!("[HID] Open attempt {attempt} failed: {e}");
            e
        })
    })
    .map_err(|e| TransportError::Io(format!("could not open HID device within {budget:?}: {e}")))
}

fn reader_loop(tx: &mpsc::Sender<HidReport>) -> Result<(), TransportError> {
    info!("[HID] Opening HID device {VENDOR_ID:04X}:{PRODUCT_ID:04X}...");

    let api = hidapi::HidApi::new().map_err(|e| TransportError::Io(e.to_string()))?;
    let device = open_device(&api, OPEN_BUDGET)?;
    device
        .set_blocking_mode(true)
        .map_err(|e| TransportError::Io(e.to_string()))?;

    info!("[HID] HID device connected. Reading reports...");

    let mut buf = [0u8; REPORT_LEN];
    loop {
        match device.read_timeout(&mut buf, READ_TIMEOUT_MS) {
            Ok(0) => {
                if tx.is_closed() {
                    return Ok(());
                }
            }
            Ok(n) if n < REPORT_LEN => warn!("[HID] Short read: {n} bytes"),
            Ok(_) => {
                if tx.blocking_send(buf).is_err() {
                    info!("[HID] Stream closed, exiting reader thread.");
                    return Ok(());
                }
            }
            Err(e) => return Err(TransportError::Io(format!("HID read error: {e}"))),
        }
    }
}
