//! Analog stick path for the controller.
//!
//! Raw stick values are normalised, passed through a dead-zone window and
//! the user's six-point response curve, then scaled into relative mouse
//! motion for sticks in mouse mode.

use crate::error::Result;
use crate::input::InputSink;
use serde::{Deserialize, Serialize};

/// Full-scale stick deflection.
pub const AXIS_MAX: f64 = 32767.0;
/// Pixels per unit of curved deflection and sensitivity.
pub const MOVE_SCALE: f64 = 1e-4;
/// Number of curve control points.
pub const CURVE_POINTS: usize = 6;

/// What a stick drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickMode {
    #[default]
    None,
    Mouse,
}

/// Curve control point, both coordinates in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: f64,
    pub y: f64,
}

/// The identity curve.
pub fn linear_curve() -> Vec<CurvePoint> {
    (0..CURVE_POINTS)
        .map(|i| {
            let v = i as f64 * 100.0 / (CURVE_POINTS - 1) as f64;
            CurvePoint { x: v, y: v }
        })
        .collect()
}

/// Per-stick settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StickConfig {
    pub mode: StickMode,
    pub sensitivity_x: u8,
    pub sensitivity_y: u8,
    /// Percent of travel ignored around the centre.
    pub dead_zone_min: f64,
    /// Percent of travel beyond which output saturates.
    pub dead_zone_max: f64,
    pub invert_y: bool,
    pub curve: Vec<CurvePoint>,
}

impl Default for StickConfig {
    fn default() -> Self {
        Self {
            mode: StickMode::None,
            sensitivity_x: 10,
            sensitivity_y: 10,
            dead_zone_min: 5.0,
            dead_zone_max: 100.0,
            invert_y: false,
            curve: linear_curve(),
        }
    }
}

/// Piecewise-linear interpolation over points sorted by `x` (percent in, percent out).
pub fn apply_curve(points: &[CurvePoint], x: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return x;
    };
    if x <= first.x {
        return first.y;
    }
    if x >= last.x {
        return last.y;
    }
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if x <= b.x {
            if b.x <= a.x {
                return b.y;
            }
            return a.y + (x - a.x) * (b.y - a.y) / (b.x - a.x);
        }
    }
    last.y
}

/// Convert one raw axis value into a move delta.
pub fn axis_delta(raw: i16, cfg: &StickConfig, sensitivity: u8) -> i32 {
    let frac = (raw as f64 / AXIS_MAX).clamp(-1.0, 1.0);
    let magnitude = frac.abs();
    if magnitude < cfg.dead_zone_min / 100.0 {
        return 0;
    }
    let magnitude = if magnitude > cfg.dead_zone_max / 100.0 {
        1.0
    } else {
        magnitude
    };
    let curved = apply_curve(&cfg.curve, magnitude * 100.0) / 100.0;
    let delta = curved * AXIS_MAX * sensitivity as f64 * MOVE_SCALE;
    (delta.round() as i32) * frac.signum() as i32
}

/// Move delta for a stick position, with optional Y inversion.
pub fn stick_delta(cfg: &StickConfig, x: i16, y: i16) -> (i32, i32) {
    let dx = axis_delta(x, cfg, cfg.sensitivity_x);
    let dy = axis_delta(y, cfg, cfg.sensitivity_y);
    (dx, if cfg.invert_y { -dy } else { dy })
}

/// Decoded analog report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogReport {
    pub left: (i16, i16),
    pub right: (i16, i16),
}

/// Parse `[id, lx, ly, rx, ry]` with each axis an i16 LE.
pub fn parse_analog(data: &[u8]) -> Option<AnalogReport> {
    if data.len() < 9 {
        return None;
    }
    let axis = |i: usize| i16::from_le_bytes([data[i], data[i + 1]]);
    Some(AnalogReport {
        left: (axis(1), axis(3)),
        right: (axis(5), axis(7)),
    })
}

/// Both sticks' configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogConfig {
    pub left: StickConfig,
    pub right: StickConfig,
}

impl AnalogConfig {
    /// Emit relative motion for every stick in mouse mode.
    pub fn apply(&self, report: &AnalogReport, sink: &dyn InputSink) -> Result<()> {
        let mut total = (0, 0);
        for (cfg, (x, y)) in [(&self.left, report.left), (&self.right, report.right)] {
            if cfg.mode != StickMode::Mouse {
                continue;
            }
            let (dx, dy) = stick_delta(cfg, x, y);
            total.0 += dx;
            total.1 += dy;
        }
        if total != (0, 0) {
            sink.emit_mouse_move(total.0, total.1)?;
        }
        Ok(())
    }
}

/// Vibration preview report for the analog interface.
pub fn vibration_report(left: u8, right: u8) -> [u8; 5] {
    [0x00, 0x02, 0x07, left, right]
}
