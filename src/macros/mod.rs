//! Recorded macros: the in-memory store with its on-disk persistence, and
//! the replay engine.

pub mod replay;
pub mod storage;
pub mod store;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::InputSnapshot;

pub use self::replay::{PlaybackHandle, ReplayEngine};
pub use self::store::{MacroStore, RecordingHandle};

/// Stable macro identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroId(pub u32);

impl fmt::Display for MacroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One recorded instant. `snapshot.timestamp == offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub offset: Duration,
    pub snapshot: InputSnapshot,
}

impl Frame {
    pub fn new(offset: Duration, snapshot: InputSnapshot) -> Self {
        Self {
            offset,
            snapshot: snapshot.at(offset),
        }
    }
}

/// A committed macro. Frames are shared with any playback in progress.
#[derive(Debug, Clone)]
pub struct Macro {
    pub id: MacroId,
    pub name: String,
    pub created: DateTime<Utc>,
    pub slot: Option<usize>,
    pub frames: Arc<[Frame]>,
}

impl Macro {
    pub fn duration(&self) -> Duration {
        self.frames.last().map_or(Duration::ZERO, |f| f.offset)
    }

    pub fn summary(&self) -> MacroSummary {
        MacroSummary {
            id: self.id,
            name: self.name.clone(),
            created: self.created,
            slot: self.slot,
            frame_count: self.frames.len(),
            duration_ms: self.duration().as_millis() as u64,
        }
    }
}

/// Listing entry for the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacroSummary {
    pub id: MacroId,
    pub name: String,
    pub created: DateTime<Utc>,
    pub slot: Option<usize>,
    pub frame_count: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum MacroStoreError {
    #[error("recording has no frames")]
    EmptyRecording,

    #[error("macro {0} is playing")]
    InUse(MacroId),

    #[error("macro {0} not found")]
    NotFound(MacroId),

    #[error("macro name is empty")]
    InvalidName,

    #[error("slot {slot} out of range (0..{count})")]
    SlotOutOfRange { slot: usize, count: usize },

    #[error("persistence failed: {0}")]
    Persistence(#[from] io::Error),
}
