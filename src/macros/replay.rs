//! Macro playback with timestamp chasing.
//!
//! Playback is driven by elapsed time, not by tick count: each call returns
//! the latest frame whose offset has been reached, so a late tick catches up
//! instead of drifting.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{Frame, Macro, MacroId};
use crate::input::InputSnapshot;

/// Available playback speed presets.
pub const SPEED_PRESETS: [f32; 5] = [0.25, 0.5, 1.0, 2.0, 4.0];

/// A playback in progress. Speed is fixed when playback starts.
#[derive(Debug)]
pub struct PlaybackHandle {
    macro_id: MacroId,
    frames: Arc<[Frame]>,
    started: Duration,
    speed: f32,
    cursor: usize,
    current: Option<InputSnapshot>,
}

impl PlaybackHandle {
    pub fn macro_id(&self) -> MacroId {
        self.macro_id
    }
}

#[derive(Debug, Clone)]
pub struct ReplayEngine {
    speed: f32,
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self { speed: 1.0 }
    }
}

impl ReplayEngine {
    pub fn new(speed: f32) -> Self {
        let mut engine = Self::default();
        engine.set_speed(speed);
        engine
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Set playback speed (clamped to the preset range).
    pub fn set_speed(&mut self, speed: f32) {
        let speed = if speed.is_finite() { speed } else { 1.0 };
        self.speed = speed.clamp(SPEED_PRESETS[0], SPEED_PRESETS[SPEED_PRESETS.len() - 1]);
        info!("[MACRO] Playback speed set to {:.2}x", self.speed);
    }

    /// Cycle to the next speed preset. Wraps around.
    pub fn cycle_speed(&mut self) {
        let current_idx = SPEED_PRESETS
            .iter()
            .position(|&s| (s - self.speed).abs() < 0.01)
            .unwrap_or(2); // 1.0x
        let next_idx = (current_idx + 1) % SPEED_PRESETS.len();
        self.set_speed(SPEED_PRESETS[next_idx]);
    }

    pub fn start(&self, m: Arc<Macro>, now: Duration) -> PlaybackHandle {
        info!(
            "[MACRO] Playback of macro {} started ({} frames, {:.2}x)",
            m.id,
            m.frames.len(),
            self.speed
        );
        PlaybackHandle {
            macro_id: m.id,
            frames: m.frames.clone(),
            started: now,
            speed: self.speed,
            cursor: 0,
            current: None,
        }
    }

    /// Snapshot to output at `now`.
    ///
    /// Neutral before the first frame, the latest reached frame afterwards,
    /// `None` once playback has run past the last frame. The last frame is
    /// always output once, even when no tick lands on its offset.
    pub fn next_snapshot(&self, handle: &mut PlaybackHandle, now: Duration) -> Option<InputSnapshot> {
        let last = handle.frames.last()?.offset;
        let elapsed_us = now.saturating_sub(handle.started).as_micros() as f64;
        let position = Duration::from_micros((elapsed_us * handle.speed as f64) as u64);
        let exhausted = handle.cursor == handle.frames.len();
        if position > last && exhausted {
            return None;
        }

        while let Some(frame) = handle.frames.get(handle.cursor) {
            if frame.offset > position {
                break;
            }
            handle.current = Some(frame.snapshot);
            handle.cursor += 1;
        }

        let out = handle.current.unwrap_or_else(InputSnapshot::neutral);
        Some(out.at(now))
    }

    pub fn stop(&self, handle: PlaybackHandle) {
        info!(
            "[MACRO] Playback of macro {} stopped at frame {}/{}",
            handle.macro_id,
            handle.cursor,
            handle.frames.len()
        );
    }
}
