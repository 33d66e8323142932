//! The macro engine: owns the mode, the macro store, the replay engine and
//! the combo classifier, and turns each live snapshot into the snapshot the
//! console sees.
//!
//! Combos and control-surface commands go through the same [`Engine::execute`]
//! transitions. The engine does no I/O besides macro persistence; LEDs and
//! publication are the caller's job.

mod command;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

pub use self::command::{Command, CommandError, Effect};
pub use self::state::{EngineState, Mode};

use self::state::Activity;
use crate::combo::{Classification, ComboClassifier, ComboIntent};
use crate::input::InputSnapshot;
use crate::macros::{Macro, MacroStore, MacroStoreError, MacroSummary, ReplayEngine};
use crate::mux::multiplex;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub playback_speed: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            playback_speed: 1.0,
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub output: InputSnapshot,
    /// New mode, if this tick changed it.
    pub mode_changed: Option<Mode>,
    pub macros_changed: bool,
}

pub struct Engine {
    activity: Activity,
    current_slot: usize,
    store: MacroStore,
    replay: ReplayEngine,
    classifier: ComboClassifier,
}

impl Engine {
    pub fn new(store: MacroStore, config: &EngineConfig) -> Self {
        Self {
            activity: Activity::Idle,
            current_slot: 0,
            store,
            replay: ReplayEngine::new(config.playback_speed),
            classifier: ComboClassifier::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.activity.mode()
    }

    pub fn state(&self) -> EngineState {
        let slot_macro = self.store.macro_in_slot(self.current_slot);
        EngineState {
            mode: self.mode(),
            current_slot: self.current_slot,
            slot_count: self.store.slot_count(),
            active_macro: self.activity.active_macro(),
            slot_macro: slot_macro.as_ref().map(|m| m.id),
            slot_macro_name: slot_macro.map(|m| m.name.clone()),
            playback_speed: self.replay.speed(),
        }
    }

    pub fn macros(&self) -> Vec<MacroSummary> {
        self.store.list()
    }

    /// Classify, apply the combo, multiplex, and record if recording.
    pub fn tick(&mut self, live: &InputSnapshot, now: Duration) -> Tick {
        let before = self.mode();
        let Classification { intent, mask } = self.classifier.classify(live, before);

        let mut macros_changed = false;
        if let Some(cmd) = self.intent_command(intent) {
            match self.execute(cmd, now) {
                Ok(effect) => macros_changed = effect.macros_changed,
                Err(e) => warn!("[COMBO] {intent:?}: {e}"),
            }
        }

        let replay = match &mut self.activity {
            Activity::Playing(handle) => self.replay.next_snapshot(handle, now),
            _ => None,
        };
        let decision = multiplex(live, mask, self.mode(), replay);

        if decision.record {
            if let Activity::Recording(handle) = &mut self.activity {
                self.store.append(handle, &decision.output);
            }
        }
        if decision.finished {
            info!("[MACRO] Playback finished");
            self.stop_playback();
        }

        let after = self.mode();
        Tick {
            output: decision.output,
            mode_changed: (after != before).then_some(after),
            macros_changed,
        }
    }

    fn intent_command(&self, intent: ComboIntent) -> Option<Command> {
        match intent {
            ComboIntent::None => None,
            ComboIntent::EnterMacroMode | ComboIntent::ExitMacroMode => Some(Command::ToggleMacroMode),
            ComboIntent::ToggleRecording => Some(Command::ToggleRecording),
            ComboIntent::SwitchSlotLeft => Some(Command::PrevSlot),
            ComboIntent::SwitchSlotRight => Some(Command::NextSlot),
            ComboIntent::Play => Some(Command::PlayMacro),
            ComboIntent::Stop => Some(Command::StopPlayback),
        }
    }

    /// Execute a command. Returns the side effects to apply.
    pub fn execute(&mut self, cmd: Command, now: Duration) -> Result<Effect, CommandError> {
        let mode = self.mode();
        let invalid = |cmd: &Command| CommandError::InvalidInMode {
            command: cmd.name(),
            mode,
        };

        match cmd {
            Command::ToggleMacroMode => Ok(self.toggle_macro_mode()),
            Command::ToggleRecording => match mode {
                Mode::MacroArmed => {
                    let handle = self.store.begin_recording(now);
                    self.activity = Activity::Recording(handle);
                    Ok(Effect::none())
                }
                Mode::Recording => self.finish_recording(),
                Mode::Idle | Mode::Playing => Err(invalid(&cmd)),
            },
            Command::PrevSlot | Command::NextSlot | Command::SelectSlot(_) => match mode {
                Mode::Idle | Mode::MacroArmed => self.switch_slot(&cmd),
                Mode::Recording | Mode::Playing => Err(invalid(&cmd)),
            },
            Command::PlayMacro => match mode {
                Mode::MacroArmed | Mode::Playing => self.play(now),
                Mode::Idle | Mode::Recording => Err(invalid(&cmd)),
            },
            Command::StopPlayback => match mode {
                Mode::Playing => {
                    self.stop_playback();
                    Ok(Effect::none())
                }
                Mode::MacroArmed => Ok(Effect::none()),
                Mode::Idle | Mode::Recording => Err(invalid(&cmd)),
            },
            Command::RenameMacro(id, name) => {
                self.store.rename(id, &name)?;
                Ok(Effect::macros_changed())
            }
            Command::DeleteMacro(id) => {
                self.store.delete(id, self.activity.playing())?;
                Ok(Effect::macros_changed())
            }
            Command::BindSlot { slot, id } => {
                self.store.bind_slot(slot, id)?;
                Ok(Effect::macros_changed())
            }
            Command::CycleSpeed => {
                self.replay.cycle_speed();
                Ok(Effect::none())
            }
            Command::SetPlaybackSpeed(speed) => {
                self.replay.set_speed(speed);
                Ok(Effect::none())
            }
            Command::ExportMacro(id) => Ok(Effect::payload(self.store.export(id)?)),
        }
    }

    fn toggle_macro_mode(&mut self) -> Effect {
        match std::mem::take(&mut self.activity) {
            Activity::Idle => {
                self.activity = Activity::Armed;
                info!(
                    "[MACRO] Macro mode ON. {} macro(s). Slot: {}",
                    self.store.list().len(),
                    self.current_slot
                );
            }
            Activity::Armed => info!("[MACRO] Macro mode OFF."),
            Activity::Recording(handle) => {
                info!("[MACRO] Recording discarded ({} frames).", handle.frame_count());
                self.store.discard(handle);
                info!("[MACRO] Macro mode OFF.");
            }
            Activity::Playing(handle) => {
                self.replay.stop(handle);
                info!("[MACRO] Macro mode OFF.");
            }
        }
        Effect::none()
    }

    /// Commit the recording to the current slot and return to MacroArmed.
    /// If it cannot be saved the recording stays active: stop again to
    /// retry, or leave macro mode to discard it.
    fn finish_recording(&mut self) -> Result<Effect, CommandError> {
        let Activity::Recording(handle) = &self.activity else {
            return Ok(Effect::none());
        };
        match self.store.commit(handle, self.current_slot) {
            Ok(_) => {
                self.activity = Activity::Armed;
                Ok(Effect::macros_changed())
            }
            Err(MacroStoreError::EmptyRecording) => {
                self.activity = Activity::Armed;
                Err(MacroStoreError::EmptyRecording.into())
            }
            Err(e) => {
                warn!("[MACRO] Recording kept after failed save: {e}");
                Err(e.into())
            }
        }
    }

    fn switch_slot(&mut self, cmd: &Command) -> Result<Effect, CommandError> {
        let count = self.store.slot_count();
        if count == 0 {
            return Ok(Effect::none());
        }
        self.current_slot = match *cmd {
            Command::PrevSlot => (self.current_slot + count - 1) % count,
            Command::NextSlot => (self.current_slot + 1) % count,
            Command::SelectSlot(slot) if slot < count => slot,
            Command::SelectSlot(slot) => {
                return Err(MacroStoreError::SlotOutOfRange { slot, count }.into());
            }
            _ => self.current_slot,
        };
        info!("[MACRO] Slot {} selected.", self.current_slot);
        Ok(Effect::none())
    }

    fn play(&mut self, now: Duration) -> Result<Effect, CommandError> {
        let m: Arc<Macro> = self
            .store
            .macro_in_slot(self.current_slot)
            .ok_or(CommandError::EmptySlot(self.current_slot))?;
        if let Activity::Playing(previous) = std::mem::take(&mut self.activity) {
            self.replay.stop(previous);
        }
        info!("[MACRO] Playing macro {} (slot {}).", m.id, self.current_slot);
        self.activity = Activity::Playing(self.replay.start(m, now));
        Ok(Effect::none())
    }

    fn stop_playback(&mut self) {
        if let Activity::Playing(handle) = std::mem::replace(&mut self.activity, Activity::Armed) {
            self.replay.stop(handle);
        }
    }

    /// Device went away or shutdown: drop any recording, stop playback.
    pub fn end_session(&mut self) {
        match std::mem::take(&mut self.activity) {
            Activity::Recording(handle) => {
                self.store.discard(handle);
                self.activity = Activity::Armed;
            }
            Activity::Playing(handle) => {
                self.replay.stop(handle);
                self.activity = Activity::Armed;
            }
            other => self.activity = other,
        }
        self.classifier.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::combo::MODE_HOLD;
    use crate::input::{Button, Buttons};
    use crate::macros::MacroId;

    const TICK: Duration = Duration::from_millis(8);
    const SLOTS: usize = 3;

    struct Harness {
        engine: Engine,
        now: Duration,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = MacroStore::open(dir.path(), SLOTS).unwrap();
            Self {
                engine: Engine::new(store, &EngineConfig::default()),
                now: Duration::ZERO,
                _dir: dir,
            }
        }

        fn feed(&mut self, buttons: &[Button], ticks: u32) -> Vec<Tick> {
            (0..ticks)
                .map(|_| {
                    let mut live = InputSnapshot::neutral().at(self.now);
                    live.buttons = Buttons::of(buttons);
                    let t = self.engine.tick(&live, self.now);
                    self.now += TICK;
                    t
                })
                .collect()
        }

        fn release(&mut self) {
            self.feed(&[], 1);
        }

        fn arm(&mut self) {
            let ticks = (MODE_HOLD.as_millis() / TICK.as_millis()) as u32 + 2;
            self.feed(&[Button::L3, Button::R3, Button::DpadDown], ticks);
            self.release();
            assert_eq!(self.engine.mode(), Mode::MacroArmed);
        }

        fn combo(&mut self, extra: Option<Button>) {
            match extra {
                Some(b) => self.feed(&[Button::L3, Button::R3, b], 1),
                None => self.feed(&[Button::L3, Button::R3], 1),
            };
            self.release();
        }

        /// Record A for `ticks` reports into the current slot.
        fn record(&mut self, ticks: u32) -> MacroId {
            self.combo(None);
            assert_eq!(self.engine.mode(), Mode::Recording);
            self.feed(&[Button::A], ticks);
            self.combo(None);
            assert_eq!(self.engine.mode(), Mode::MacroArmed);
            self.engine.state().slot_macro.unwrap()
        }
    }

    #[test]
    fn test_idle_is_passthrough() {
        let mut h = Harness::new();
        let ticks = h.feed(&[Button::A, Button::ZR], 3);
        for t in ticks {
            assert_eq!(t.output.buttons, Buttons::of(&[Button::A, Button::ZR]));
            assert_eq!(t.mode_changed, None);
        }
    }

    #[test]
    fn test_enter_and_exit_macro_mode() {
        let mut h = Harness::new();
        h.arm();
        let ticks = h.feed(&[Button::L3, Button::R3, Button::DpadDown], 70);
        assert_eq!(h.engine.mode(), Mode::Idle);
        let changes: Vec<_> = ticks.iter().filter_map(|t| t.mode_changed).collect();
        assert_eq!(changes, vec![Mode::Idle]);
        // The combo never reaches the console
        assert!(ticks.iter().all(|t| t.output.buttons.is_empty()));
    }

    #[test]
    fn test_record_then_play_reproduces_input() {
        let mut h = Harness::new();
        h.arm();
        let id = h.record(10);
        let m = h.engine.store.get(id).unwrap();
        assert!(m.frames.iter().any(|f| f.snapshot.buttons == Button::A.into()));
        // Combo buttons are not recorded
        assert!(m
            .frames
            .iter()
            .all(|f| !f.snapshot.buttons.intersects(Buttons::of(&[Button::L3, Button::R3]))));

        h.combo(Some(Button::A));
        assert_eq!(h.engine.mode(), Mode::Playing);
        assert_eq!(h.engine.state().active_macro, Some(id));

        // Live input is ignored while playing
        let ticks = h.feed(&[Button::X], 4);
        assert!(ticks.iter().all(|t| !t.output.buttons.contains(Button::X)));
        assert!(ticks.iter().any(|t| t.output.buttons.contains(Button::A)));

        // Runs out on its own
        let ticks = h.feed(&[], 40);
        assert_eq!(h.engine.mode(), Mode::MacroArmed);
        assert!(ticks.iter().any(|t| t.mode_changed == Some(Mode::MacroArmed)));
    }

    #[test]
    fn test_replay_timing_matches_recording() {
        let mut h = Harness::new();
        h.arm();
        h.combo(None);
        h.feed(&[Button::A], 6);
        h.feed(&[Button::A, Button::Y], 2);
        h.feed(&[Button::B], 1);
        h.combo(None);
        let id = h.engine.state().slot_macro.unwrap();
        let m = h.engine.store.get(id).unwrap();
        let last = *m.frames.last().unwrap();
        assert_eq!(last.snapshot.buttons, Buttons::from(Button::B));

        // Playback starts on the combo tick
        let mut ticks = h.feed(&[Button::L3, Button::R3, Button::A], 1);
        ticks.extend(h.feed(&[], 40));

        let mut finished_at = None;
        for (i, t) in ticks.iter().enumerate() {
            let elapsed = TICK * i as u32;
            if t.mode_changed == Some(Mode::MacroArmed) {
                finished_at = Some(elapsed);
                break;
            }
            let expected = m.frames.iter().rev().find(|f| f.offset <= elapsed).unwrap();
            assert_eq!(t.output.buttons, expected.snapshot.buttons, "at {elapsed:?}");
        }
        let finished_at = finished_at.expect("playback never finished");
        assert!(
            finished_at > last.offset && finished_at <= last.offset + TICK,
            "finished at {finished_at:?}, last frame at {:?}",
            last.offset
        );
        assert_eq!(h.engine.mode(), Mode::MacroArmed);
    }

    #[test]
    fn test_failed_save_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macros");
        let store = MacroStore::open(&path, SLOTS).unwrap();
        let mut engine = Engine::new(store, &EngineConfig::default());
        let mut now = Duration::ZERO;
        engine.execute(Command::ToggleMacroMode, now).unwrap();
        engine.execute(Command::ToggleRecording, now).unwrap();
        for _ in 0..3 {
            let mut live = InputSnapshot::neutral().at(now);
            live.buttons = Button::A.into();
            engine.tick(&live, now);
            now += TICK;
        }

        // Replace the directory with a file so every write fails
        fs::remove_dir_all(&path).unwrap();
        fs::write(&path, b"").unwrap();
        let err = engine.execute(Command::ToggleRecording, now).unwrap_err();
        assert!(matches!(err, CommandError::Store(MacroStoreError::Persistence(_))));
        assert_eq!(engine.mode(), Mode::Recording);
        assert!(engine.macros().is_empty());

        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        let effect = engine.execute(Command::ToggleRecording, now).unwrap();
        assert!(effect.macros_changed);
        assert_eq!(engine.mode(), Mode::MacroArmed);
        let id = engine.state().slot_macro.unwrap();
        assert_eq!(engine.store.get(id).unwrap().frames.len(), 3);
    }

    #[test]
    fn test_export_returns_record() {
        let mut h = Harness::new();
        h.arm();
        let id = h.record(4);
        let effect = h.engine.execute(Command::ExportMacro(id), h.now).unwrap();
        assert_eq!(effect.payload, Some(h.engine.store.export(id).unwrap()));
        assert!(!effect.macros_changed);
        assert!(matches!(
            h.engine.execute(Command::ExportMacro(MacroId(99)), h.now),
            Err(CommandError::Store(MacroStoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_stop_interrupts_playback() {
        let mut h = Harness::new();
        h.arm();
        h.record(50);
        h.combo(Some(Button::A));
        assert_eq!(h.engine.mode(), Mode::Playing);
        h.combo(Some(Button::B));
        assert_eq!(h.engine.mode(), Mode::MacroArmed);
    }

    #[test]
    fn test_empty_recording_creates_nothing() {
        let mut h = Harness::new();
        h.arm();
        let now = h.now;
        h.engine.execute(Command::ToggleRecording, now).unwrap();
        let err = h.engine.execute(Command::ToggleRecording, now).unwrap_err();
        assert!(matches!(err, CommandError::Store(MacroStoreError::EmptyRecording)));
        assert_eq!(h.engine.mode(), Mode::MacroArmed);
        assert!(h.engine.macros().is_empty());
    }

    #[test]
    fn test_play_empty_slot_rejected() {
        let mut h = Harness::new();
        h.arm();
        let err = h.engine.execute(Command::PlayMacro, h.now).unwrap_err();
        assert!(matches!(err, CommandError::EmptySlot(0)));
        assert_eq!(h.engine.mode(), Mode::MacroArmed);
    }

    #[test]
    fn test_slot_switching_wraps() {
        let mut h = Harness::new();
        h.arm();
        h.combo(Some(Button::DpadLeft));
        assert_eq!(h.engine.state().current_slot, SLOTS - 1);
        h.combo(Some(Button::DpadRight));
        h.combo(Some(Button::DpadRight));
        assert_eq!(h.engine.state().current_slot, 1);
    }

    #[test]
    fn test_recording_and_playing_are_exclusive() {
        let mut h = Harness::new();
        h.arm();
        h.record(5);
        h.combo(None);
        assert_eq!(h.engine.mode(), Mode::Recording);
        // Play is ignored while recording
        let err = h.engine.execute(Command::PlayMacro, h.now).unwrap_err();
        assert!(matches!(err, CommandError::InvalidInMode { mode: Mode::Recording, .. }));
        h.combo(Some(Button::A));
        assert_eq!(h.engine.mode(), Mode::Recording);
    }

    #[test]
    fn test_recording_rejected_outside_macro_mode() {
        let mut h = Harness::new();
        let err = h.engine.execute(Command::ToggleRecording, h.now).unwrap_err();
        assert!(matches!(err, CommandError::InvalidInMode { mode: Mode::Idle, .. }));
    }

    #[test]
    fn test_delete_playing_macro_is_in_use() {
        let mut h = Harness::new();
        h.arm();
        let id = h.record(50);
        h.combo(Some(Button::A));
        let err = h.engine.execute(Command::DeleteMacro(id), h.now).unwrap_err();
        assert!(matches!(err, CommandError::Store(MacroStoreError::InUse(_))));
        h.combo(Some(Button::B));
        let effect = h.engine.execute(Command::DeleteMacro(id), h.now).unwrap();
        assert!(effect.macros_changed);
        assert_eq!(h.engine.state().slot_macro, None);
    }

    #[test]
    fn test_exit_discards_recording() {
        let mut h = Harness::new();
        h.arm();
        h.combo(None);
        h.feed(&[Button::A], 5);
        h.engine.execute(Command::ToggleMacroMode, h.now).unwrap();
        assert_eq!(h.engine.mode(), Mode::Idle);
        assert!(h.engine.macros().is_empty());
    }

    #[test]
    fn test_end_session_resets_activity() {
        let mut h = Harness::new();
        h.arm();
        h.combo(None);
        h.feed(&[Button::A], 5);
        h.engine.end_session();
        assert_eq!(h.engine.mode(), Mode::MacroArmed);
        assert!(h.engine.macros().is_empty());
        assert_eq!(h.engine.state().active_macro, None);
    }

    #[test]
    fn test_web_commands_share_transitions() {
        let mut h = Harness::new();
        let now = h.now;
        h.engine.execute(Command::ToggleMacroMode, now).unwrap();
        h.engine.execute(Command::SelectSlot(2), now).unwrap();
        h.engine.execute(Command::ToggleRecording, now).unwrap();
        h.feed(&[Button::B], 3);
        let effect = h.engine.execute(Command::ToggleRecording, h.now).unwrap();
        assert!(effect.macros_changed);
        let state = h.engine.state();
        assert_eq!(state.current_slot, 2);
        assert!(state.slot_macro.is_some());

        assert!(matches!(
            h.engine.execute(Command::SelectSlot(SLOTS), h.now),
            Err(CommandError::Store(MacroStoreError::SlotOutOfRange { .. }))
        ));
        h.engine.execute(Command::CycleSpeed, h.now).unwrap();
        assert_eq!(h.engine.state().playback_speed, 2.0);
    }
}
