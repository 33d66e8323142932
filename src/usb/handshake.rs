//! Bring-up handshake: switches the controller from degraded mode 0x20 into
//! full-report mode 0x23.
//!
//! Sends every [`HANDSHAKE`] step over the claimed vendor interface, waits for
//! each acknowledgement, releases the claim, then reads the mode byte back
//! from the HID report stream. Running it on an already-initialized device is
//! harmless and ends in the same mode.

use std::time::Duration;

use tracing::{debug, info};

use super::protocol::{DEGRADED_PREFIX, HANDSHAKE, MODE_DEGRADED, MODE_FULL};
use super::{Stage, TransportError, UsbDevice, VendorInterface};

/// Per-step timing.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub ack_deadline: Duration,
    /// Pause after each acknowledged step.
    pub settle: Duration,
    /// The HID node reappears only after the kernel driver is reattached.
    pub mode_deadline: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_millis(300),
            settle: Duration::from_millis(50),
            mode_deadline: Duration::from_secs(3),
        }
    }
}

/// Proof that the device answered with full-report mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullReportMode;

pub async fn initialize<D: UsbDevice>(
    device: &D,
    config: &HandshakeConfig,
) -> Result<FullReportMode, TransportError> {
    info!("[USB] Sending initialization sequence ({} commands)...", HANDSHAKE.len());

    {
        let mut interface = device.claim().await?;
        for (i, step) in HANDSHAKE.iter().enumerate() {
            let n = i + 1;
            debug!("[USB] Command {n}/{}: {}", HANDSHAKE.len(), step.name);
            interface.write(step.bytes).await?;
            if !interface.read_ack(config.ack_deadline).await? {
                return Err(TransportError::Timeout { stage: Stage::Command(n) });
            }
            tokio::time::sleep(config.settle).await;
            if n == DEGRADED_PREFIX {
                debug!("[USB] Basic init done (mode 0x{MODE_DEGRADED:02X}), enabling full reports...");
            }
        }
        // interface dropped here: claim released, kernel driver back
    }

    let mode = device.read_mode(config.mode_deadline).await?;
    if mode != MODE_FULL {
        return Err(TransportError::UnexpectedMode {
            expected: MODE_FULL,
            actual: mode,
        });
    }

    info!("[USB] Initialization sequence complete, mode 0x{mode:02X}");
    Ok(FullReportMode)
}
