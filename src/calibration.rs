//! Stick and trigger calibration.
//!
//! Raw 12-bit axis readings are normalized around the nominal mid-scale
//! (0x800 ↦ 0.0, half-span 2048), corrected by a per-axis centre offset and
//! scale captured at startup, then optionally run through the 32-point radial
//! profile measured for this controller's stick envelope.

use std::f32::consts::TAU;
use std::time::Duration;

use tracing::{info, warn};

use crate::input::{RawSticks, Stick};

const NOMINAL_CENTER: f32 = 2048.0;
const HALF_SPAN: f32 = 2048.0;

/// A resting offset larger than this means the stick was held during
/// capture; that axis keeps nominal calibration.
const MAX_CENTER_OFFSET: f32 = 0.25;

/// Usable trigger byte span.
const TRIGGER_MIN: u8 = 36;
const TRIGGER_MAX: u8 = 240;

/// Clamp into `[lo, hi]`, mapping NaN to 0.
fn clamp_finite(v: f32, lo: f32, hi: f32) -> f32 {
    if v.is_finite() {
        v.clamp(lo, hi)
    } else if v.is_nan() {
        0.0
    } else {
        v.signum().clamp(lo, hi)
    }
}

/// Raw 12-bit reading to [-1, 1) around the nominal centre.
pub fn normalize(raw: u16) -> f32 {
    (raw as f32 - NOMINAL_CENTER) / HALF_SPAN
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisCalibration {
    /// Resting position in normalized units.
    pub center: f32,
    pub scale: f32,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl AxisCalibration {
    pub const IDENTITY: AxisCalibration = AxisCalibration {
        center: 0.0,
        scale: 1.0,
    };

    /// Calibration for an axis that rests at `raw`. The scale stretches the
    /// shorter side back to full deflection.
    pub fn from_resting(raw: f32) -> Self {
        let center = (raw - NOMINAL_CENTER) / HALF_SPAN;
        if !center.is_finite() || center.abs() > MAX_CENTER_OFFSET {
            return Self::IDENTITY;
        }
        Self {
            center,
            scale: 1.0 / (1.0 - center.abs()),
        }
    }

    pub fn apply(&self, raw: u16) -> f32 {
        self.apply_normalized(normalize(raw))
    }

    pub fn apply_normalized(&self, v: f32) -> f32 {
        clamp_finite((v - self.center) * self.scale, -1.0, 1.0)
    }
}

/// 32-point radial stick calibration with deadzone.
///
/// Each radius is the measured stick envelope at that angle, as a
/// percentage; magnitudes are stretched so the envelope reaches full tilt.
#[derive(Debug, Clone, PartialEq)]
pub struct RadialProfile {
    radii: [f32; 32],
    /// In raw units.
    deadzone: f32,
}

/// Measured envelope of the left (main) stick.
pub const LEFT_STICK_RADII: [f32; 32] = [
    61.28, 59.10, 59.32, 61.42, 64.61, 60.89, 58.93, 58.86, 57.96, 54.91, 53.94, 55.08, 58.76,
    55.50, 52.94, 53.47, 56.88, 54.62, 54.06, 55.79, 59.53, 58.33, 56.91, 58.23, 60.40, 61.90,
    61.76, 63.32, 68.50, 63.34, 61.14, 60.96,
];

/// Measured envelope of the right (C) stick.
pub const RIGHT_STICK_RADII: [f32; 32] = [
    54.74, 52.52, 52.24, 54.58, 58.28, 55.75, 54.01, 54.52, 55.03, 53.14, 52.31, 53.07, 56.86,
    52.77, 51.99, 52.16, 53.86, 52.02, 51.43, 53.31, 56.98, 53.29, 52.09, 52.24, 55.01, 53.96,
    53.79, 56.05, 59.98, 56.49, 54.20, 54.46,
];

const DEFAULT_DEADZONE: f32 = 10.0;

impl RadialProfile {
    pub fn new(radii: [f32; 32], deadzone: f32) -> Self {
        Self { radii, deadzone }
    }

    pub fn left() -> Self {
        Self::new(LEFT_STICK_RADII, DEFAULT_DEADZONE)
    }

    pub fn right() -> Self {
        Self::new(RIGHT_STICK_RADII, DEFAULT_DEADZONE)
    }

    fn radius_at(&self, angle: f32) -> f32 {
        let float_index = angle / TAU * 32.0;
        let index1 = (float_index as usize) % 32;
        let index2 = (index1 + 1) % 32;
        let fraction = float_index - float_index.floor();

        let r1 = self.radii[index1];
        let r2 = self.radii[index2];
        r1 + (r2 - r1) * fraction
    }

    /// Correct a centred, normalized stick position.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let magnitude = x.hypot(y) * HALF_SPAN / 1.3;
        if !magnitude.is_finite() || magnitude < self.deadzone {
            return (0.0, 0.0);
        }

        let mut angle = y.atan2(x);
        if angle < 0.0 {
            angle += TAU;
        }

        let radius = self.radius_at(angle);
        if radius <= 0.0 {
            return (x, y);
        }
        let corrected = magnitude * 100.0 / radius / HALF_SPAN;
        (corrected * angle.cos(), corrected * angle.sin())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StickCalibration {
    pub x: AxisCalibration,
    pub y: AxisCalibration,
    pub profile: Option<RadialProfile>,
}

impl StickCalibration {
    fn apply(&self, raw: (u16, u16)) -> Stick {
        self.finish(self.x.apply(raw.0), self.y.apply(raw.1))
    }

    fn finish(&self, x: f32, y: f32) -> Stick {
        let (x, y) = match &self.profile {
            Some(profile) => profile.apply(x, y),
            None => (x, y),
        };
        Stick {
            x: clamp_finite(x, -1.0, 1.0),
            y: clamp_finite(y, -1.0, 1.0),
        }
    }
}

/// Per-session calibration. Immutable once the capture window has closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    pub left: StickCalibration,
    pub right: StickCalibration,
}

impl Calibration {
    /// Nominal mid-scale centres, unit scale, no radial profile.
    pub fn nominal() -> Self {
        Self::default()
    }

    pub fn with_radial_profiles(mut self) -> Self {
        self.left.profile = Some(RadialProfile::left());
        self.right.profile = Some(RadialProfile::right());
        self
    }

    pub fn sticks(&self, raw: &RawSticks) -> (Stick, Stick) {
        (self.left.apply(raw.left), self.right.apply(raw.right))
    }

    pub fn trigger(&self, raw: u8) -> f32 {
        remap_trigger(raw)
    }
}

/// Trigger byte to [0, 1] over the usable span.
pub fn remap_trigger(raw: u8) -> f32 {
    let clamped = raw.clamp(TRIGGER_MIN, TRIGGER_MAX);
    (clamped - TRIGGER_MIN) as f32 / (TRIGGER_MAX - TRIGGER_MIN) as f32
}

/// Collects resting stick readings from the first reports of a session.
#[derive(Debug)]
pub struct CalibrationCapture {
    window: Duration,
    max_samples: usize,
    started: Option<Duration>,
    sums: [u64; 4],
    samples: usize,
}

impl Default for CalibrationCapture {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 20)
    }
}

impl CalibrationCapture {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            window,
            max_samples,
            started: None,
            sums: [0; 4],
            samples: 0,
        }
    }

    /// Record the sticks of one full-mode report received at `now`.
    pub fn observe(&mut self, raw: &RawSticks, now: Duration) {
        if self.is_complete(now) {
            return;
        }
        self.started.get_or_insert(now);
        let values = [raw.left.0, raw.left.1, raw.right.0, raw.right.1];
        for (sum, v) in self.sums.iter_mut().zip(values) {
            *sum += v as u64;
        }
        self.samples += 1;
    }

    pub fn is_complete(&self, now: Duration) -> bool {
        if self.samples >= self.max_samples {
            return true;
        }
        match self.started {
            Some(started) => now.saturating_sub(started) >= self.window,
            None => false,
        }
    }

    /// Close the window. No samples falls back to nominal centres.
    pub fn finish(self, radial: bool) -> Calibration {
        let mut cal = Calibration::nominal();
        if self.samples == 0 {
            warn!("[CAL] No reports during capture window, using nominal centres");
        } else {
            let n = self.samples as f32;
            let avg = self.sums.map(|s| s as f32 / n);
            cal.left.x = AxisCalibration::from_resting(avg[0]);
            cal.left.y = AxisCalibration::from_resting(avg[1]);
            cal.right.x = AxisCalibration::from_resting(avg[2]);
            cal.right.y = AxisCalibration::from_resting(avg[3]);
            info!(
                "[CAL] Centres from {} reports: L=({:.0}, {:.0}) R=({:.0}, {:.0})",
                self.samples, avg[0], avg[1], avg[2], avg[3]
            );
        }
        if radial {
            cal = cal.with_radial_profiles();
        }
        cal
    }
}
