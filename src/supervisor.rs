//! The hardware loop.
//!
//! Brings the controller up, captures calibration, then runs one engine tick
//! per report: drain commands, decode, classify, multiplex, present,
//! publish. A closed report stream is a disconnect and goes back to waiting
//! for the device; a report in degraded mode re-runs the handshake. The loop
//! only ends on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::calibration::{Calibration, CalibrationCapture};
use crate::control::{CommandQueue, LinkStatus, Published, QueuedCommand, StatePublisher, UsbLink};
use crate::engine::{Engine, Mode};
use crate::input::{self, DecodeError, InputSnapshot, RawSticks};
use crate::macros::MacroSummary;
use crate::present::Presenter;
use crate::usb::handshake::{self, HandshakeConfig};
use crate::usb::hid::ReportStream;
use crate::usb::{TransportError, UsbDevice};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub handshake: HandshakeConfig,
    pub retry_interval: Duration,
    /// Consecutive unreachable failures before it is reported as an error.
    pub unreachable_threshold: u32,
    /// Re-tick the last live snapshot when no report arrives this fast.
    pub tick_interval: Duration,
    /// How often commands are applied while no device is attached.
    pub idle_poll: Duration,
    pub calibration_window: Duration,
    pub calibration_samples: usize,
    pub radial_profiles: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            retry_interval: Duration::from_secs(5),
            unreachable_threshold: 12,
            tick_interval: Duration::from_millis(8),
            idle_poll: Duration::from_millis(50),
            calibration_window: Duration::from_secs(1),
            calibration_samples: 20,
            radial_profiles: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    Degraded,
    Shutdown,
}

pub struct Supervisor<D, P> {
    device: D,
    presenter: P,
    engine: Engine,
    commands: Arc<CommandQueue>,
    publisher: Arc<StatePublisher>,
    shutdown: watch::Receiver<bool>,
    config: SupervisorConfig,
    epoch: Instant,
    usb: UsbLink,
    macros: Vec<MacroSummary>,
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

impl<D: UsbDevice, P: Presenter> Supervisor<D, P> {
    pub fn new(
        device: D,
        presenter: P,
        engine: Engine,
        commands: Arc<CommandQueue>,
        publisher: Arc<StatePublisher>,
        shutdown: watch::Receiver<bool>,
        config: SupervisorConfig,
    ) -> Self {
        let macros = engine.macros();
        Self {
            device,
            presenter,
            engine,
            commands,
            publisher,
            shutdown,
            config,
            epoch: Instant::now(),
            usb: UsbLink::AwaitingDevice,
            macros,
        }
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        self.publish();
        self.presenter.indicate(self.engine.mode());

        while self.bring_up().await {
            let mut stream = match self.device.open_reports() {
                Ok(s) => s,
                Err(e) => {
                    warn!("[HID] Could not open report stream: {e}");
                    self.set_usb(UsbLink::AwaitingDevice);
                    if !self.idle_for(self.config.retry_interval).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_usb(UsbLink::Connected);
            info!("[MITM] Passthrough active.");
            let end = self.session(&mut stream).await;

            // Release the device before anything else
            stream.close().await;
            self.engine.end_session();
            self.publish();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Degraded => {
                    warn!("[USB] Controller fell back to degraded mode, re-running handshake");
                    self.set_usb(UsbLink::Initializing);
                }
                SessionEnd::Disconnected => {
                    warn!("[USB] Controller disconnected. Waiting for it to come back...");
                    self.set_usb(UsbLink::AwaitingDevice);
                }
            }
        }

        info!("[MITM] Shutting down...");
        self.engine.end_session();
        self.presenter.shutdown().await;
        self.publish();
    }

    /// Handshake until it succeeds. False on shutdown.
    async fn bring_up(&mut self) -> bool {
        let mut unreachable = 0u32;
        loop {
            if self.shutdown_requested() {
                return false;
            }
            if unreachable < self.config.unreachable_threshold {
                self.set_usb(UsbLink::Initializing);
            }

            let attempt = tokio::select! {
                _ = stopped(&mut self.shutdown) => return false,
                result = handshake::initialize(&self.device, &self.config.handshake) => result,
            };
            match attempt {
                Ok(_) => return true,
                Err(e) => {
                    unreachable = if e.is_unreachable() { unreachable + 1 } else { 0 };
                    self.report_failure(&e, unreachable);
                }
            }

            // No claim is held here: the handshake drops it on every path
            if !self.idle_for(self.config.retry_interval).await {
                return false;
            }
        }
    }

    fn report_failure(&mut self, e: &TransportError, unreachable: u32) {
        let threshold = self.config.unreachable_threshold;
        let retry = self.config.retry_interval.as_secs_f32();
        if unreachable >= threshold {
            if unreachable == threshold {
                error!("[USB] Controller unreachable after {unreachable} attempts: {e}. Still retrying every {retry}s");
            } else {
                debug!("[USB] Still unreachable ({unreachable} attempts): {e}");
            }
            self.set_usb(UsbLink::Unreachable {
                attempts: unreachable,
                error: e.to_string(),
            });
        } else {
            warn!("[USB] {e}, retrying in {retry}s...");
            self.set_usb(UsbLink::AwaitingDevice);
        }
    }

    /// Sleep while still applying commands. False on shutdown.
    async fn idle_for(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            self.apply_commands();
            let wake = deadline.min(Instant::now() + self.config.idle_poll);
            tokio::select! {
                _ = stopped(&mut self.shutdown) => return false,
                _ = tokio::time::sleep_until(wake) => {}
            }
            if Instant::now() >= deadline {
                return true;
            }
        }
    }

    async fn session(&mut self, stream: &mut ReportStream) -> SessionEnd {
        let mut capture = Some(CalibrationCapture::new(
            self.config.calibration_window,
            self.config.calibration_samples,
        ));
        // Until the window closes, reports pass through with nominal centres
        let mut calibration = Calibration::nominal();
        let mut live = InputSnapshot::neutral();
        let tick_interval = self.config.tick_interval;
        info!("[CAL] Calibrating stick centres (don't touch the sticks)...");

        loop {
            self.apply_commands();

            let report = tokio::select! {
                _ = stopped(&mut self.shutdown) => return SessionEnd::Shutdown,
                report = tokio::time::timeout(tick_interval, stream.recv()) => report,
            };
            let now = self.now();

            match report {
                Ok(Some(raw)) => match input::decode(&raw, &calibration) {
                    Ok(snapshot) => {
                        if let Some(c) = capture.as_mut() {
                            c.observe(&RawSticks::from_report(&raw), now);
                            if c.is_complete(now) {
                                if let Some(done) = capture.take() {
                                    calibration = done.finish(self.config.radial_profiles);
                                }
                            }
                        }
                        live = snapshot.at(now);
                    }
                    Err(DecodeError::DegradedMode) => return SessionEnd::Degraded,
                    Err(e) => {
                        debug!("[HID] Dropping report: {e}");
                        continue;
                    }
                },
                Ok(None) => return SessionEnd::Disconnected,
                // Nothing new: re-tick the last report as it was, so playback
                // keeps advancing and a recording gains no frame
                Err(_) => {}
            }

            self.step(&live, now);
        }
    }

    fn step(&mut self, live: &InputSnapshot, now: Duration) {
        let tick = self.engine.tick(live, now);
        self.presenter.present(&tick.output);
        if let Some(mode) = tick.mode_changed {
            self.presenter.indicate(mode);
        }
        if tick.macros_changed {
            self.macros = self.engine.macros();
        }
        self.publish();
    }

    /// Apply everything the control surface queued since the last tick.
    fn apply_commands(&mut self) {
        let queued = self.commands.drain();
        if queued.is_empty() {
            return;
        }
        for QueuedCommand { command, reply } in queued {
            let name = command.name();
            let before = self.engine.mode();
            let outcome = match self.engine.execute(command, self.now()) {
                Ok(effect) => {
                    if effect.macros_changed {
                        self.macros = self.engine.macros();
                    }
                    debug!("[WEB] {name} applied");
                    Ok(effect.payload)
                }
                Err(e) => {
                    warn!("[WEB] {name} rejected: {e}");
                    Err(e.to_string())
                }
            };
            let after: Mode = self.engine.mode();
            if after != before {
                self.presenter.indicate(after);
            }
            // The requester may have timed out
            let _ = reply.send(outcome);
        }
        self.publish();
    }

    fn set_usb(&mut self, usb: UsbLink) {
        self.usb = usb;
        self.publish();
    }

    fn publish(&self) {
        self.publisher.publish(Published {
            state: self.engine.state(),
            macros: self.macros.clone(),
            link: LinkStatus {
                usb: self.usb.clone(),
                console: self.presenter.is_connected(),
            },
        });
    }
}
