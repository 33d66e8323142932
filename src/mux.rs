//! Output multiplexer: picks what the console sees on each tick.

use crate::engine::Mode;
use crate::input::{Buttons, InputSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MuxDecision {
    pub output: InputSnapshot,
    /// Append `output` to the recording in progress.
    pub record: bool,
    /// Playback ran out; the engine returns to MacroArmed.
    pub finished: bool,
}

/// Masked live passthrough, or the replay snapshot while playing.
///
/// Only `mask` buttons are cleared from live input; everything else passes
/// through unchanged.
pub fn multiplex(
    live: &InputSnapshot,
    mask: Buttons,
    mode: Mode,
    replay: Option<InputSnapshot>,
) -> MuxDecision {
    let passthrough = live.masked(mask);
    match (mode, replay) {
        (Mode::Idle | Mode::MacroArmed, _) => MuxDecision {
            output: passthrough,
            record: false,
            finished: false,
        },
        (Mode::Recording, _) => MuxDecision {
            output: passthrough,
            record: true,
            finished: false,
        },
        (Mode::Playing, Some(snapshot)) => MuxDecision {
            output: snapshot,
            record: false,
            finished: false,
        },
        (Mode::Playing, None) => MuxDecision {
            output: passthrough,
            record: false,
            finished: true,
        },
    }
}
