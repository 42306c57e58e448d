//! Safety layer: validates profile values against known-safe ranges before
//! anything is sent to a device.
//!
//! A rejected value leaves the previous device state untouched; validation
//! errors are the only errors shown to the operator.
//!
//! # Bounds
//!
//! ## Brightness
//! - **Range**: 0 – 100 (slider percent). Converted to 0..1 for frame
//!   sources and to 0..1000 for the hardware brightness setter.
//!
//! ## DPI
//! - **Range**: per model (`[min, max]`), **step** 50. Values are rounded to
//!   the nearest step after the range check.
//!
//! ## Polling Rate
//! - **Values**: 125, 250, 500, 1000, 2000, 4000, 8000 Hz, limited further by
//!   the model.
//! - **Encoding**: one byte, 1 = 125 Hz through 7 = 8000 Hz.
//!
//! ## Controller
//! - **Stick sensitivity**: 5 – 50.
//! - **Vibration**: 0 – 100 per motor.
//! - **Curve**: exactly 6 points, x strictly increasing, both axes 0 – 100.
//! - **Dead zones**: 0 – 100, `min < max`.
//!
//! ## Cooling
//! - **Fan percent**: 0 – 100. Pump channels never go below the pump floor.
//!
//! ## Sleep
//! - **Minutes**: 1 – 60.

use crate::analog::{CurvePoint, StickConfig, CURVE_POINTS};
use crate::error::{Error, Result};

fn out_of_range(field: &'static str, value: i64, min: i64, max: i64) -> Error {
    Error::OutOfRange {
        field,
        value,
        min,
        max,
    }
}

fn check(field: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(field, value, min, max))
    }
}

pub const BRIGHTNESS_MAX: u8 = 100;

pub fn validate_brightness(value: i64) -> Result<u8> {
    check("brightness", value, 0, BRIGHTNESS_MAX as i64)?;
    Ok(value as u8)
}

pub const DPI_STEP: u16 = 50;

/// Validate a DPI value against a model's range and round to the step.
pub fn validate_dpi(dpi: u16, min: u16, max: u16) -> Result<u16> {
    check("dpi", dpi as i64, min as i64, max as i64)?;
    let rounded = ((dpi as u32 + DPI_STEP as u32 / 2) / DPI_STEP as u32) * DPI_STEP as u32;
    Ok((rounded as u16).clamp(min, max))
}

/// Polling rates and their wire codes.
pub const POLLING_RATES: [(u16, u8); 7] = [
    (125, 1),
    (250, 2),
    (500, 3),
    (1000, 4),
    (2000, 5),
    (4000, 6),
    (8000, 7),
];

/// Validate a polling rate against the model's supported set; returns the wire code.
pub fn validate_polling_rate(hz: u16, supported: &[u16]) -> Result<u8> {
    let max = supported.iter().copied().max().unwrap_or(1000);
    if !supported.contains(&hz) {
        return Err(out_of_range("polling_rate", hz as i64, 125, max as i64));
    }
    POLLING_RATES
        .iter()
        .find(|(rate, _)| *rate == hz)
        .map(|(_, code)| *code)
        .ok_or_else(|| out_of_range("polling_rate", hz as i64, 125, 8000))
}

pub const SENSITIVITY_RANGE: (u8, u8) = (5, 50);

pub fn validate_sensitivity(value: u8) -> Result<u8> {
    check(
        "sensitivity",
        value as i64,
        SENSITIVITY_RANGE.0 as i64,
        SENSITIVITY_RANGE.1 as i64,
    )?;
    Ok(value)
}

pub fn validate_vibration(value: u8) -> Result<u8> {
    check("vibration", value as i64, 0, 100)?;
    Ok(value)
}

/// Curve must have six points, strictly increasing in x, all within 0..=100.
pub fn validate_curve(points: &[CurvePoint]) -> Result<()> {
    if points.len() != CURVE_POINTS {
        return Err(out_of_range(
            "curve_points",
            points.len() as i64,
            CURVE_POINTS as i64,
            CURVE_POINTS as i64,
        ));
    }
    for p in points {
        if !(0.0..=100.0).contains(&p.x) {
            return Err(out_of_range("curve_x", p.x as i64, 0, 100));
        }
        if !(0.0..=100.0).contains(&p.y) {
            return Err(out_of_range("curve_y", p.y as i64, 0, 100));
        }
    }
    for pair in points.windows(2) {
        if pair[1].x <= pair[0].x {
            return Err(out_of_range(
                "curve_x",
                pair[1].x as i64,
                pair[0].x as i64 + 1,
                100,
            ));
        }
    }
    Ok(())
}

/// Validate every field of a stick configuration.
pub fn validate_stick(cfg: &StickConfig) -> Result<()> {
    validate_sensitivity(cfg.sensitivity_x)?;
    validate_sensitivity(cfg.sensitivity_y)?;
    check("dead_zone_min", cfg.dead_zone_min as i64, 0, 100)?;
    check("dead_zone_max", cfg.dead_zone_max as i64, 0, 100)?;
    if cfg.dead_zone_min >= cfg.dead_zone_max {
        return Err(out_of_range(
            "dead_zone_min",
            cfg.dead_zone_min as i64,
            0,
            cfg.dead_zone_max as i64 - 1,
        ));
    }
    validate_curve(&cfg.curve)
}

/// Validate a fan speed; pump channels are raised to `pump_min`.
pub fn validate_fan_percent(percent: u8, pump: bool, pump_min: u8) -> Result<u8> {
    check("fan_percent", percent as i64, 0, 100)?;
    Ok(if pump { percent.max(pump_min) } else { percent })
}

pub fn validate_sleep_minutes(minutes: u32) -> Result<u32> {
    check("sleep_minutes", minutes as i64, 1, 60)?;
    Ok(minutes)
}

/// A key table must match the firmware key count exactly.
pub fn validate_key_count(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::KeyCountMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::linear_curve;

    #[test]
    fn brightness_bounds() {
        assert_eq!(validate_brightness(0).unwrap(), 0);
        assert_eq!(validate_brightness(100).unwrap(), 100);
        assert!(validate_brightness(101).is_err());
        assert!(validate_brightness(-1).is_err());
    }

    #[test]
    fn dpi_in_range_rounds_to_step() {
        assert_eq!(validate_dpi(800, 100, 26000).unwrap(), 800);
        assert_eq!(validate_dpi(810, 100, 26000).unwrap(), 800);
        assert_eq!(validate_dpi(825, 100, 26000).unwrap(), 850);
        assert_eq!(validate_dpi(26000, 100, 26000).unwrap(), 26000);
    }

    #[test]
    fn dpi_out_of_range_is_rejected() {
        assert!(validate_dpi(50, 100, 18000).is_err());
        assert!(validate_dpi(26000, 100, 18000).is_err());
    }

    #[test]
    fn polling_rate_codes() {
        let supported = [125, 250, 500, 1000, 2000, 4000, 8000];
        assert_eq!(validate_polling_rate(125, &supported).unwrap(), 1);
        assert_eq!(validate_polling_rate(1000, &supported).unwrap(), 4);
        assert_eq!(validate_polling_rate(8000, &supported).unwrap(), 7);
        assert!(validate_polling_rate(2000, &[125, 250, 500, 1000]).is_err());
        assert!(validate_polling_rate(300, &supported).is_err());
    }

    #[test]
    fn sensitivity_and_vibration() {
        assert!(validate_sensitivity(4).is_err());
        assert!(validate_sensitivity(5).is_ok());
        assert!(validate_sensitivity(50).is_ok());
        assert!(validate_sensitivity(51).is_err());
        assert!(validate_vibration(100).is_ok());
        assert!(validate_vibration(101).is_err());
    }

    #[test]
    fn curve_rules() {
        assert!(validate_curve(&linear_curve()).is_ok());

        let mut short = linear_curve();
        short.pop();
        assert!(validate_curve(&short).is_err());

        let mut unordered = linear_curve();
        unordered.swap(2, 3);
        assert!(validate_curve(&unordered).is_err());

        let mut high = linear_curve();
        high[5].y = 120.0;
        assert!(validate_curve(&high).is_err());
    }

    #[test]
    fn dead_zone_window_must_be_open() {
        let cfg = StickConfig {
            dead_zone_min: 50.0,
            dead_zone_max: 40.0,
            ..StickConfig::default()
        };
        assert!(validate_stick(&cfg).is_err());
        assert!(validate_stick(&StickConfig::default()).is_ok());
    }

    #[test]
    fn pump_floor_is_enforced() {
        assert_eq!(validate_fan_percent(30, true, 50).unwrap(), 50);
        assert_eq!(validate_fan_percent(30, false, 50).unwrap(), 30);
        assert_eq!(validate_fan_percent(80, true, 50).unwrap(), 80);
        assert!(validate_fan_percent(101, false, 50).is_err());
    }

    #[test]
    fn sleep_and_key_count() {
        assert!(validate_sleep_minutes(0).is_err());
        assert!(validate_sleep_minutes(15).is_ok());
        assert!(validate_sleep_minutes(61).is_err());
        assert!(validate_key_count(6, 6).is_ok());
        assert!(matches!(
            validate_key_count(5, 6),
            Err(Error::KeyCountMismatch {
                expected: 6,
                actual: 5
            })
        ));
    }
}
