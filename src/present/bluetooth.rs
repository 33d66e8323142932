//! Pro Controller emulation over BlueZ L2CAP.
//!
//! A background task owns the console link: it listens on PSM 17 (control)
//! and PSM 19 (interrupt), answers the pairing subcommands, then streams
//! 0x30 reports built from the latest presented snapshot. The hardware loop
//! only swaps the snapshot in a watch channel, so `present` never waits on
//! the radio. A dropped console link goes back to listening.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bluer::l2cap::{SocketAddr, Stream, StreamListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::switch::{self, ConsoleRequest};
use super::{led_pattern, sdp, Presenter};
use crate::engine::Mode;
use crate::input::InputSnapshot;
use crate::usb::device::write_led_pattern;

const PSM_CONTROL: u16 = 17;
const PSM_INTERRUPT: u16 = 19;
/// Pro Controller report period over Bluetooth.
const REPORT_INTERVAL: Duration = Duration::from_millis(15);
const PAIRING_READ_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BluetoothPresenter {
    latest: watch::Sender<InputSnapshot>,
    connected: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BluetoothPresenter {
    /// Configure the adapter, register the SDP record and start listening.
    pub async fn start() -> anyhow::Result<Self> {
        let dbus = zbus::Connection::system().await?;
        sdp::configure_adapter(&dbus).await?;
        sdp::register_sdp_profile(&dbus).await?;

        let (latest, snapshots) = watch::channel(InputSnapshot::neutral());
        let (stop, stop_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(console_link(snapshots, stop_rx, connected.clone()));
        Ok(Self {
            latest,
            connected,
            stop,
            task: Some(task),
        })
    }
}

impl Presenter for BluetoothPresenter {
    fn present(&mut self, snapshot: &InputSnapshot) {
        self.latest.send_replace(*snapshot);
    }

    fn indicate(&mut self, mode: Mode) {
        debug!("[LED] {mode:?}");
        tokio::spawn(write_led_pattern(led_pattern(mode)));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn shutdown(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("[BT] Console link task did not stop in time");
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        info!("[BT] Console link closed");
    }
}

/// A connected console.
struct ConsoleSession {
    control: Stream,
    interrupt: Stream,
    timer: u8,
}

impl ConsoleSession {
    fn next_timer(&mut self) -> u8 {
        let t = self.timer;
        self.timer = self.timer.wrapping_add(1);
        t
    }

    /// Answer one output report. Returns true once the console asked for
    /// standard input mode.
    async fn handle(&mut self, data: &[u8]) -> anyhow::Result<bool> {
        match switch::parse_request(data) {
            Some(ConsoleRequest::Subcommand { id, args }) => {
                let (ack, payload) = switch::answer_subcommand(id, args);
                let timer = self.next_timer();
                let reply = switch::subcommand_reply(timer, id, ack, &payload);
                debug!("[BT] Subcommand 0x{id:02X} -> ACK 0x{ack:02X}");
                self.interrupt.write_all(&reply).await?;
                Ok(id == switch::SUBCMD_SET_INPUT_MODE)
            }
            Some(ConsoleRequest::UsbCommand(cmd)) => {
                match switch::usb_command_reply(cmd) {
                    Some(reply) => self.control.write_all(&reply).await?,
                    None => debug!("[BT] Ignoring 0x80/0x{cmd:02X}"),
                }
                Ok(false)
            }
            Some(ConsoleRequest::Rumble) => Ok(false),
            Some(ConsoleRequest::Unknown(kind)) => {
                debug!("[BT] Unknown report type 0x{kind:02X}");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn send_input(&mut self, snapshot: &InputSnapshot) -> std::io::Result<()> {
        let timer = self.next_timer();
        self.interrupt.write_all(&switch::input_report(snapshot, timer)).await
    }
}

async fn console_link(
    mut snapshots: watch::Receiver<InputSnapshot>,
    mut stop: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let session = tokio::select! {
            _ = stopped(&mut stop) => return,
            session = accept() => session,
        };
        let mut session = match session {
            Ok(s) => s,
            Err(e) => {
                error!("[BT] Connection error: {e}");
                tokio::select! {
                    _ = stopped(&mut stop) => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };

        let paired = tokio::select! {
            _ = stopped(&mut stop) => return,
            paired = pair(&mut session) => paired,
        };
        if let Err(e) = paired {
            error!("[BT] Pairing error: {e}");
            continue;
        }

        info!("[BT] Connected to Switch!");
        connected.store(true, Ordering::Relaxed);
        let result = stream_reports(&mut session, &mut snapshots, &mut stop).await;
        connected.store(false, Ordering::Relaxed);

        match result {
            Ok(Link::Stopped) => return,
            Ok(Link::Dropped) => warn!("[BT] Switch disconnected. Waiting for reconnection..."),
            Err(e) => warn!("[BT] Link error: {e}. Waiting for reconnection..."),
        }
    }
}

/// Resolves once stop is requested or the presenter is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn accept() -> anyhow::Result<ConsoleSession> {
    let listen = |psm| StreamListener::bind(SocketAddr::new(bluer::Address::any(), bluer::AddressType::BrEdr, psm));
    let control_listener = listen(PSM_CONTROL).await?;
    let interrupt_listener = listen(PSM_INTERRUPT).await?;

    info!("[BT] Waiting for Switch on PSM {PSM_CONTROL}/{PSM_INTERRUPT}...");
    info!("[BT] >> Open 'Change Grip/Order' on the Switch <<");

    let (control, addr) = control_listener.accept().await?;
    info!("[BT] Control channel connected from {}", addr.addr);
    let (interrupt, addr) = interrupt_listener.accept().await?;
    info!("[BT] Interrupt channel connected from {}", addr.addr);

    Ok(ConsoleSession {
        control,
        interrupt,
        timer: 0,
    })
}

/// Answer subcommands until the console switches to standard input mode.
async fn pair(session: &mut ConsoleSession) -> anyhow::Result<()> {
    info!("[BT] Starting pairing handshake...");
    let mut buf = [0u8; 512];
    loop {
        let read = tokio::time::timeout(PAIRING_READ_TIMEOUT, session.control.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(0)) => anyhow::bail!("control channel closed during pairing"),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => anyhow::bail!("control channel read error: {e}"),
            Err(_) => {
                debug!("[BT] Pairing read timeout, still waiting...");
                continue;
            }
        };
        debug!("[BT] Pairing recv ({n} bytes): {:02X?}", &buf[..n.min(20)]);

        if session.handle(&buf[..n]).await? {
            info!("[BT] Switch requested standard input mode, pairing complete");
            // A few neutral reports so the console sees a live controller
            for _ in 0..3 {
                session.send_input(&InputSnapshot::neutral()).await?;
                tokio::time::sleep(REPORT_INTERVAL).await;
            }
            return Ok(());
        }
    }
}

enum Link {
    Stopped,
    Dropped,
}

async fn stream_reports(
    session: &mut ConsoleSession,
    snapshots: &mut watch::Receiver<InputSnapshot>,
    stop: &mut watch::Receiver<bool>,
) -> anyhow::Result<Link> {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut control_buf = [0u8; 512];
    let mut interrupt_buf = [0u8; 512];

    loop {
        tokio::select! {
            _ = stopped(stop) => return Ok(Link::Stopped),
            _ = ticker.tick() => {
                let snapshot = *snapshots.borrow_and_update();
                if let Err(e) = session.send_input(&snapshot).await {
                    debug!("[BT] Send error: {e}");
                    return Ok(Link::Dropped);
                }
            }
            read = session.control.read(&mut control_buf) => match read {
                Ok(0) | Err(_) => return Ok(Link::Dropped),
                Ok(n) => {
                    session.handle(&control_buf[..n]).await?;
                }
            },
            read = session.interrupt.read(&mut interrupt_buf) => match read {
                Ok(0) | Err(_) => return Ok(Link::Dropped),
                Ok(n) => {
                    session.handle(&interrupt_buf[..n]).await?;
                }
            },
        }
    }
}
