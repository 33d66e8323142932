//! Engine mode and the published state snapshot.

use serde::Serialize;

use crate::macros::{MacroId, PlaybackHandle, RecordingHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Idle,
    MacroArmed,
    Recording,
    Playing,
}

/// What the engine is doing, with the data each activity owns.
#[derive(Debug, Default)]
pub(crate) enum Activity {
    #[default]
    Idle,
    Armed,
    Recording(RecordingHandle),
    Playing(PlaybackHandle),
}

impl Activity {
    pub(crate) fn mode(&self) -> Mode {
        match self {
            Activity::Idle => Mode::Idle,
            Activity::Armed => Mode::MacroArmed,
            Activity::Recording(_) => Mode::Recording,
            Activity::Playing(_) => Mode::Playing,
        }
    }

    /// Macro being recorded or played.
    pub(crate) fn active_macro(&self) -> Option<MacroId> {
        match self {
            Activity::Recording(h) => Some(h.id()),
            Activity::Playing(h) => Some(h.macro_id()),
            Activity::Idle | Activity::Armed => None,
        }
    }

    pub(crate) fn playing(&self) -> Option<MacroId> {
        match self {
            Activity::Playing(h) => Some(h.macro_id()),
            _ => None,
        }
    }
}

/// Engine state as seen by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineState {
    pub mode: Mode,
    pub current_slot: usize,
    pub slot_count: usize,
    /// Only while recording or playing.
    pub active_macro: Option<MacroId>,
    /// Macro bound to the current slot.
    pub slot_macro: Option<MacroId>,
    pub slot_macro_name: Option<String>,
    pub playback_speed: f32,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            mode: Mode::Idle,
            current_slot: 0,
            slot_count: 0,
            active_macro: None,
            slot_macro: None,
            slot_macro_name: None,
            playback_speed: 1.0,
        }
    }
}
