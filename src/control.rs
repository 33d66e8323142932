//! Hand-off points between the hardware loop and the control surface.
//!
//! Commands go in through a small bounded queue drained by the hardware loop
//! on its next tick; state comes out through a publisher the web side polls.
//! Neither side ever waits on the other.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::warn;

use crate::engine::{Command, EngineState};
use crate::macros::MacroSummary;

pub const COMMAND_QUEUE_CAP: usize = 32;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome reported back to whoever sent a command, with any bytes the
/// command produced.
pub type CommandReply = Result<Option<Vec<u8>>, String>;

#[derive(Debug)]
pub struct QueuedCommand {
    pub command: Command,
    pub reply: oneshot::Sender<CommandReply>,
}

/// Bounded command queue. When full, the oldest command is dropped.
#[derive(Debug)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<QueuedCommand>>,
    capacity: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(COMMAND_QUEUE_CAP)
    }
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue and get a receiver for the outcome.
    pub fn request(&self, command: Command) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(QueuedCommand {
            command,
            reply: tx,
        });
        rx
    }

    fn enqueue(&self, cmd: QueuedCommand) {
        let mut queue = lock(&self.inner);
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!("[MITM] Command queue full, dropping {}", dropped.command.name());
                let _ = dropped.reply.send(Err("dropped: command queue full".into()));
            }
        }
        queue.push_back(cmd);
    }

    /// Take everything queued so far, oldest first. Never blocks on I/O.
    pub fn drain(&self) -> Vec<QueuedCommand> {
        lock(&self.inner).drain(..).collect()
    }
}

/// USB side of the link.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UsbLink {
    AwaitingDevice,
    Initializing,
    Connected,
    Unreachable { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub usb: UsbLink,
    /// Console attached to the presenter.
    pub console: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            usb: UsbLink::AwaitingDevice,
            console: false,
        }
    }
}

/// Everything the control surface can read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Published {
    pub state: EngineState,
    pub macros: Vec<MacroSummary>,
    pub link: LinkStatus,
}

/// Latest published state, replaced as a whole.
#[derive(Debug, Default)]
pub struct StatePublisher {
    inner: Mutex<(Published, bool)>,
}

impl StatePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published value. Marks it changed only if it differs.
    pub fn publish(&self, next: Published) {
        let mut inner = lock(&self.inner);
        if inner.0 != next {
            *inner = (next, true);
        }
    }

    pub fn snapshot(&self) -> Published {
        lock(&self.inner).0.clone()
    }

    /// Return the value if changed since the last call, else None.
    pub fn take_changed(&self) -> Option<Published> {
        let mut inner = lock(&self.inner);
        if inner.1 {
            inner.1 = false;
            Some(inner.0.clone())
        } else {
            None
        }
    }
}
