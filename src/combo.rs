//! Combo detection.
//!
//! Every gesture is an L3+R3 chord with its own state machine:
//! `Idle → Holding → Fired`, staying `Fired` until the chord is released so a
//! gesture fires once per hold. A chord that starts while one of its excluded
//! buttons is already down goes `Blocked` instead. Buttons of any gesture
//! that is not `Idle` are masked from the console.

use std::time::Duration;

use tracing::debug;

use crate::engine::Mode;
use crate::input::{Button, Buttons, InputSnapshot};

/// What a combo asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComboIntent {
    #[default]
    None,
    EnterMacroMode,
    ExitMacroMode,
    ToggleRecording,
    SwitchSlotLeft,
    SwitchSlotRight,
    Play,
    Stop,
}

/// Hold duration for macro mode toggle.
pub const MODE_HOLD: Duration = Duration::from_millis(500);

const BASE: Buttons = Buttons::of(&[Button::L3, Button::R3]);

/// Buttons that turn the base chord into a different gesture.
const MODIFIERS: Buttons = Buttons::of(&[
    Button::DpadDown,
    Button::DpadLeft,
    Button::DpadRight,
    Button::A,
    Button::B,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GestureKind {
    MacroMode,
    Record,
    SlotLeft,
    SlotRight,
    Play,
    Stop,
}

impl GestureKind {
    /// Intent for this gesture in `mode`, or `None` if the mode ignores it.
    fn intent(self, mode: Mode) -> ComboIntent {
        use GestureKind::*;
        match (self, mode) {
            (MacroMode, Mode::Idle) => ComboIntent::EnterMacroMode,
            (MacroMode, _) => ComboIntent::ExitMacroMode,
            (Record, Mode::MacroArmed | Mode::Recording) => ComboIntent::ToggleRecording,
            (SlotLeft, Mode::MacroArmed) => ComboIntent::SwitchSlotLeft,
            (SlotRight, Mode::MacroArmed) => ComboIntent::SwitchSlotRight,
            (Play, Mode::MacroArmed | Mode::Playing) => ComboIntent::Play,
            (Stop, Mode::MacroArmed | Mode::Playing) => ComboIntent::Stop,
            _ => ComboIntent::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Holding { since: Duration },
    Fired,
    Blocked,
}

#[derive(Debug, Clone)]
struct Gesture {
    kind: GestureKind,
    chord: Buttons,
    excludes: Buttons,
    /// Zero fires on the rising edge.
    hold: Duration,
    phase: Phase,
}

impl Gesture {
    const fn new(kind: GestureKind, chord: Buttons, excludes: Buttons, hold: Duration) -> Self {
        Self {
            kind,
            chord,
            excludes,
            hold,
            phase: Phase::Idle,
        }
    }

    /// Advance on one snapshot. Returns true on the tick the gesture fires.
    fn step(&mut self, buttons: Buttons, now: Duration) -> bool {
        if !buttons.contains_all(self.chord) {
            self.phase = Phase::Idle;
            return false;
        }

        match self.phase {
            Phase::Idle if buttons.intersects(self.excludes) => {
                self.phase = Phase::Blocked;
                false
            }
            Phase::Idle if self.hold.is_zero() => {
                self.phase = Phase::Fired;
                true
            }
            Phase::Idle => {
                self.phase = Phase::Holding { since: now };
                false
            }
            Phase::Holding { since } if now.saturating_sub(since) >= self.hold => {
                self.phase = Phase::Fired;
                true
            }
            Phase::Holding { .. } | Phase::Fired | Phase::Blocked => false,
        }
    }

    fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }
}

/// Result of classifying one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub intent: ComboIntent,
    /// Buttons taking part in a gesture; released before output.
    pub mask: Buttons,
}

/// Gesture state machines in priority order.
#[derive(Debug, Clone)]
pub struct ComboClassifier {
    gestures: [Gesture; 6],
}

impl Default for ComboClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ComboClassifier {
    pub fn new() -> Self {
        let chord = |extra: Button| Buttons::of(&[Button::L3, Button::R3, extra]);
        let press = Duration::ZERO;
        Self {
            gestures: [
                Gesture::new(
                    GestureKind::MacroMode,
                    chord(Button::DpadDown),
                    Buttons::NONE,
                    MODE_HOLD,
                ),
                Gesture::new(GestureKind::Record, BASE, MODIFIERS, press),
                Gesture::new(GestureKind::SlotLeft, chord(Button::DpadLeft), Buttons::NONE, press),
                Gesture::new(GestureKind::SlotRight, chord(Button::DpadRight), Buttons::NONE, press),
                Gesture::new(GestureKind::Play, chord(Button::A), Buttons::NONE, press),
                Gesture::new(GestureKind::Stop, chord(Button::B), Buttons::NONE, press),
            ],
        }
    }

    /// Feed one snapshot. Elapsed hold time comes from snapshot timestamps.
    pub fn classify(&mut self, snapshot: &InputSnapshot, mode: Mode) -> Classification {
        let mut intent = ComboIntent::None;
        let mut mask = Buttons::NONE;

        for gesture in self.gestures.iter_mut() {
            if gesture.step(snapshot.buttons, snapshot.timestamp) {
                let candidate = gesture.kind.intent(mode);
                if intent == ComboIntent::None && candidate != ComboIntent::None {
                    intent = candidate;
                } else if candidate == ComboIntent::None {
                    debug!("[COMBO] {:?} ignored in {mode:?}", gesture.kind);
                }
            }
            if gesture.is_active() {
                mask |= gesture.chord;
            }
        }

        if intent != ComboIntent::None {
            debug!("[COMBO] {intent:?}");
        }
        Classification { intent, mask }
    }

    /// Forget all in-progress gestures (new session).
    pub fn reset(&mut self) {
        for gesture in self.gestures.iter_mut() {
            gesture.phase = Phase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(8);

    fn snap(buttons: &[Button], t: Duration) -> InputSnapshot {
        let mut s = InputSnapshot::neutral().at(t);
        s.buttons = Buttons::of(buttons);
        s
    }

    /// Feed `buttons` for `ticks` reports starting at `*t`, tracking mode
    /// changes like the engine would. Returns the non-None intents.
    fn hold(
        c: &mut ComboClassifier,
        mode: &mut Mode,
        buttons: &[Button],
        ticks: u32,
        t: &mut Duration,
    ) -> Vec<ComboIntent> {
        let mut out = Vec::new();
        for _ in 0..ticks {
            let r = c.classify(&snap(buttons, *t), *mode);
            match r.intent {
                ComboIntent::None => {}
                ComboIntent::EnterMacroMode => *mode = Mode::MacroArmed,
                ComboIntent::ExitMacroMode => *mode = Mode::Idle,
                ComboIntent::ToggleRecording if *mode == Mode::MacroArmed => *mode = Mode::Recording,
                ComboIntent::ToggleRecording => *mode = Mode::MacroArmed,
                _ => {}
            }
            if r.intent != ComboIntent::None {
                out.push(r.intent);
            }
            *t += TICK;
        }
        out
    }

    const TOGGLE: [Button; 3] = [Button::L3, Button::R3, Button::DpadDown];

    #[test]
    fn test_no_combo() {
        let mut c = ComboClassifier::new();
        let r = c.classify(&snap(&[Button::A, Button::ZR], Duration::ZERO), Mode::Idle);
        assert_eq!(r, Classification::default());
    }

    #[test]
    fn test_long_hold_enters_macro_mode_once() {
        // 2 s at 125 Hz
        let mut c = ComboClassifier::new();
        let mut mode = Mode::Idle;
        let mut t = Duration::ZERO;
        let intents = hold(&mut c, &mut mode, &TOGGLE, 250, &mut t);
        assert_eq!(intents, vec![ComboIntent::EnterMacroMode]);
        assert_eq!(mode, Mode::MacroArmed);
    }

    #[test]
    fn test_short_hold_does_nothing() {
        let mut c = ComboClassifier::new();
        let mut mode = Mode::Idle;
        let mut t = Duration::ZERO;
        // 400 ms
        assert!(hold(&mut c, &mut mode, &TOGGLE, 50, &mut t).is_empty());
        hold(&mut c, &mut mode, &[], 1, &mut t);
        assert!(hold(&mut c, &mut mode, &TOGGLE, 50, &mut t).is_empty());
    }

    #[test]
    fn test_hold_fires_at_threshold() {
        let mut c = ComboClassifier::new();
        let t0 = Duration::from_secs(3);
        assert_eq!(c.classify(&snap(&TOGGLE, t0), Mode::Idle).intent, ComboIntent::None);
        let just_before = t0 + MODE_HOLD - Duration::from_millis(1);
        assert_eq!(c.classify(&snap(&TOGGLE, just_before), Mode::Idle).intent, ComboIntent::None);
        assert_eq!(
            c.classify(&snap(&TOGGLE, t0 + MODE_HOLD), Mode::Idle).intent,
            ComboIntent::EnterMacroMode
        );
    }

    #[test]
    fn test_exit_from_any_macro_mode() {
        for mode in [Mode::MacroArmed, Mode::Recording, Mode::Playing] {
            let mut c = ComboClassifier::new();
            c.classify(&snap(&TOGGLE, Duration::ZERO), mode);
            let r = c.classify(&snap(&TOGGLE, MODE_HOLD), mode);
            assert_eq!(r.intent, ComboIntent::ExitMacroMode, "{mode:?}");
        }
    }

    #[test]
    fn test_record_toggle_on_rising_edge() {
        let mut c = ComboClassifier::new();
        let mut mode = Mode::MacroArmed;
        let mut t = Duration::ZERO;
        let base = [Button::L3, Button::R3];
        assert_eq!(
            hold(&mut c, &mut mode, &base, 30, &mut t),
            vec![ComboIntent::ToggleRecording]
        );
        assert_eq!(mode, Mode::Recording);
        hold(&mut c, &mut mode, &[], 1, &mut t);
        assert_eq!(
            hold(&mut c, &mut mode, &base, 1, &mut t),
            vec![ComboIntent::ToggleRecording]
        );
        assert_eq!(mode, Mode::MacroArmed);
    }

    #[test]
    fn test_record_ignored_outside_macro_mode() {
        let base = [Button::L3, Button::R3];
        for mode in [Mode::Idle, Mode::Playing] {
            let mut c = ComboClassifier::new();
            let r = c.classify(&snap(&base, Duration::ZERO), mode);
            assert_eq!(r.intent, ComboIntent::None);
            // Still masked so the console never sees the combo
            assert_eq!(r.mask, BASE);
        }
    }

    #[test]
    fn test_modifier_first_blocks_record() {
        let mut c = ComboClassifier::new();
        let r = c.classify(
            &snap(&[Button::A, Button::L3, Button::R3], Duration::ZERO),
            Mode::MacroArmed,
        );
        assert_eq!(r.intent, ComboIntent::Play);

        // Releasing A keeps the base chord held: Record stays blocked.
        let r = c.classify(&snap(&[Button::L3, Button::R3], TICK), Mode::MacroArmed);
        assert_eq!(r.intent, ComboIntent::None);
        assert_eq!(r.mask, BASE);
    }

    #[test]
    fn test_slot_and_playback_combos() {
        let cases = [
            (Button::DpadLeft, Mode::MacroArmed, ComboIntent::SwitchSlotLeft),
            (Button::DpadRight, Mode::MacroArmed, ComboIntent::SwitchSlotRight),
            (Button::A, Mode::MacroArmed, ComboIntent::Play),
            (Button::B, Mode::MacroArmed, ComboIntent::Stop),
            (Button::A, Mode::Playing, ComboIntent::Play),
            (Button::B, Mode::Playing, ComboIntent::Stop),
            (Button::DpadLeft, Mode::Idle, ComboIntent::None),
            (Button::DpadRight, Mode::Recording, ComboIntent::None),
            (Button::A, Mode::Recording, ComboIntent::None),
            (Button::B, Mode::Idle, ComboIntent::None),
        ];
        for (extra, mode, expected) in cases {
            let mut c = ComboClassifier::new();
            let r = c.classify(&snap(&[Button::L3, Button::R3, extra], Duration::ZERO), mode);
            assert_eq!(r.intent, expected, "{extra:?} in {mode:?}");
            assert!(r.mask.contains(extra));
            assert!(r.mask.contains_all(BASE));
        }
    }

    #[test]
    fn test_instant_combo_fires_once_per_press() {
        let mut c = ComboClassifier::new();
        let mut mode = Mode::MacroArmed;
        let mut t = Duration::ZERO;
        let chord = [Button::L3, Button::R3, Button::DpadRight];
        assert_eq!(
            hold(&mut c, &mut mode, &chord, 40, &mut t),
            vec![ComboIntent::SwitchSlotRight]
        );
        // Let go of the modifier only, then press it again
        hold(&mut c, &mut mode, &[Button::L3, Button::R3], 1, &mut t);
        assert_eq!(
            hold(&mut c, &mut mode, &chord, 1, &mut t),
            vec![ComboIntent::SwitchSlotRight]
        );
    }

    #[test]
    fn test_mask_is_only_gesture_buttons() {
        let mut c = ComboClassifier::new();
        let r = c.classify(
            &snap(&[Button::L3, Button::R3, Button::A, Button::ZR, Button::Y], Duration::ZERO),
            Mode::Idle,
        );
        assert_eq!(r.mask, Buttons::of(&[Button::L3, Button::R3, Button::A]));
        let out = snap(&[Button::L3, Button::R3, Button::A, Button::ZR, Button::Y], Duration::ZERO)
            .masked(r.mask);
        assert_eq!(out.buttons, Buttons::of(&[Button::ZR, Button::Y]));
    }

    #[test]
    fn test_mask_clears_on_release() {
        let mut c = ComboClassifier::new();
        c.classify(&snap(&[Button::L3, Button::R3], Duration::ZERO), Mode::Idle);
        let r = c.classify(&snap(&[Button::L3], TICK), Mode::Idle);
        assert_eq!(r.mask, Buttons::NONE);
    }

    #[test]
    fn test_reset_forgets_holds() {
        let mut c = ComboClassifier::new();
        c.classify(&snap(&TOGGLE, Duration::ZERO), Mode::Idle);
        c.reset();
        let r = c.classify(&snap(&TOGGLE, MODE_HOLD), Mode::Idle);
        assert_eq!(r.intent, ComboIntent::None);
    }
}
