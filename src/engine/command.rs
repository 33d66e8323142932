//! Commands accepted by the engine, from combos and from the control surface.

use thiserror::Error;

use super::Mode;
use crate::macros::{MacroId, MacroStoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ToggleMacroMode,
    ToggleRecording,
    PrevSlot,
    NextSlot,
    SelectSlot(usize),
    /// Play the macro in the current slot (restarts if already playing).
    PlayMacro,
    StopPlayback,
    RenameMacro(MacroId, String),
    DeleteMacro(MacroId),
    BindSlot { slot: usize, id: MacroId },
    CycleSpeed,
    SetPlaybackSpeed(f32),
    /// Fetch the persisted record of a macro.
    ExportMacro(MacroId),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ToggleMacroMode => "TOGGLE_MACRO_MODE",
            Command::ToggleRecording => "TOGGLE_RECORDING",
            Command::PrevSlot => "PREV_SLOT",
            Command::NextSlot => "NEXT_SLOT",
            Command::SelectSlot(_) => "SELECT_SLOT",
            Command::PlayMacro => "PLAY_MACRO",
            Command::StopPlayback => "STOP_PLAYBACK",
            Command::RenameMacro(..) => "RENAME_MACRO",
            Command::DeleteMacro(_) => "DELETE_MACRO",
            Command::BindSlot { .. } => "BIND_SLOT",
            Command::CycleSpeed => "CYCLE_SPEED",
            Command::SetPlaybackSpeed(_) => "SET_PLAYBACK_SPEED",
            Command::ExportMacro(_) => "EXPORT_MACRO",
        }
    }
}

/// Side effects of an accepted command, applied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effect {
    /// The macro list changed and should be republished.
    pub macros_changed: bool,
    /// Bytes to hand back to the requester.
    pub payload: Option<Vec<u8>>,
}

impl Effect {
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn macros_changed() -> Self {
        Self {
            macros_changed: true,
            ..Self::default()
        }
    }

    pub(crate) fn payload(data: Vec<u8>) -> Self {
        Self {
            payload: Some(data),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command} is not allowed in {mode:?}")]
    InvalidInMode { command: &'static str, mode: Mode },

    #[error("slot {0} is empty")]
    EmptySlot(usize),

    #[error(transparent)]
    Store(#[from] MacroStoreError),
}
