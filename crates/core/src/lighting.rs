//! Lighting frames.
//!
//! Frame content comes from a [`FrameSource`]; this module only lays the
//! bytes out the way each device family expects and drives the per-device
//! RGB worker thread.

use crate::error::{Error, Result};
use crate::protocol::data_types;
use crate::ticker::CancelToken;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// An RGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn scaled(self, factor: f64) -> Self {
        let f = factor.clamp(0.0, 1.0);
        let s = |c: u8| (c as f64 * f).round() as u8;
        Self::new(s(self.r), s(self.g), s(self.b))
    }

    pub fn bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// Convert a brightness slider to a 0..1 factor, clamping to 0..=100 first.
pub fn brightness_factor(slider: i32) -> f64 {
    slider.clamp(0, 100) as f64 / 100.0
}

/// Repeat one colour across `led_count` LEDs.
pub fn solid(color: Rgb, led_count: usize) -> Vec<u8> {
    color.bytes().repeat(led_count)
}

/// How a device family lays out a colour frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    /// One RGB triple per LED, in LED order.
    Flat,
    /// Zone ids interleaved with their colour.
    Zones(&'static [u8]),
    /// Per-key colours addressed by packet position.
    PerKey(&'static [u16]),
}

impl FrameLayout {
    /// Number of LEDs the frame source must produce.
    pub fn led_count(&self, flat_leds: usize) -> usize {
        match self {
            Self::Flat => flat_leds,
            Self::Zones(zones) => zones.len(),
            Self::PerKey(keys) => keys.len(),
        }
    }

    /// Frame an RGB buffer; returns the data-type marker and payload.
    pub fn frame(&self, rgb: &[u8]) -> Result<([u8; 2], Vec<u8>)> {
        match self {
            Self::Flat => Ok((data_types::COLOR, rgb.to_vec())),
            Self::Zones(zones) => Ok((data_types::COLOR, zone_frame(zones, rgb)?)),
            Self::PerKey(positions) => Ok((
                KeyboardEffect::Static.data_type(),
                per_key_frame(KeyboardEffect::Static, &EffectParams::default(), positions, rgb)?,
            )),
        }
    }
}

/// Interleave zone ids with colours: `{led_count, 0x01, zone, r, g, b, ...}`.
pub fn zone_frame(zones: &[u8], rgb: &[u8]) -> Result<Vec<u8>> {
    if rgb.len() != zones.len() * 3 {
        return Err(Error::protocol(
            "zone frame",
            format!("{} zones need {} bytes, got {}", zones.len(), zones.len() * 3, rgb.len()),
        ));
    }
    let mut out = Vec::with_capacity(2 + zones.len() * 4);
    out.push(zones.len() as u8);
    out.push(0x01);
    for (zone, color) in zones.iter().zip(rgb.chunks_exact(3)) {
        out.push(*zone);
        out.extend_from_slice(color);
    }
    Ok(out)
}

/// Built-in keyboard effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyboardEffect {
    Static,
    Off,
    Spiral,
    RainbowWave,
    Rain,
    Tlk,
    Tlr,
    ColorPulse,
    ColorShift,
    ColorWave,
    Visor,
    Watercolor,
}

impl KeyboardEffect {
    /// Data-type marker that selects the effect in firmware.
    pub fn data_type(self) -> [u8; 2] {
        match self {
            Self::Static => [0x7e, 0x20],
            Self::Off => [0x7e, 0x21],
            Self::Spiral => [0xab, 0x7b],
            Self::RainbowWave => [0xa4, 0x4f],
            Self::Rain => [0xa0, 0x6f],
            Self::Tlk => [0xb1, 0xc1],
            Self::Tlr => [0x8c, 0x2e],
            Self::ColorPulse => [0x6b, 0x4f],
            Self::ColorShift => [0xfa, 0xa5],
            Self::ColorWave => [0x29, 0x16],
            Self::Visor => [0x90, 0xc0],
            Self::Watercolor => [0x22, 0x00],
        }
    }

    /// Whether the frame carries per-key RGB data after the key list.
    fn carries_rgb(self) -> bool {
        matches!(self, Self::Static)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSpeed {
    Slow,
    #[default]
    Medium,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectDirection {
    #[default]
    None,
    Up,
    Down,
    Left,
    Right,
}

/// Parameters embedded in an effect header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EffectParams {
    #[serde(default)]
    pub speed: EffectSpeed,
    #[serde(default)]
    pub direction: EffectDirection,
    #[serde(default)]
    pub colors: Option<(Rgb, Rgb)>,
}

/// Build a per-key frame:
/// `{speed, direction, has_colors, [rgb_a, rgb_b], key_count, keys (desc)..., rgb...}`.
///
/// Key indices are packet positions divided by 3, sorted descending.
pub fn per_key_frame(
    effect: KeyboardEffect,
    params: &EffectParams,
    positions: &[u16],
    rgb: &[u8],
) -> Result<Vec<u8>> {
    if effect.carries_rgb() && rgb.len() != positions.len() * 3 {
        return Err(Error::protocol(
            "per-key frame",
            format!("{} keys need {} bytes, got {}", positions.len(), positions.len() * 3, rgb.len()),
        ));
    }
    let key_count = u8::try_from(positions.len()).map_err(|_| Error::OutOfRange {
        field: "per-key count",
        value: positions.len() as i64,
        min: 0,
        max: u8::MAX.into(),
    })?;
    let indices = positions
        .iter()
        .map(|&p| {
            u8::try_from(p / 3).map_err(|_| Error::OutOfRange {
                field: "key position",
                value: p.into(),
                min: 0,
                max: i64::from(u8::MAX) * 3 + 2,
            })
        })
        .collect::<Result<Vec<u8>>>()?;

    let mut out = Vec::with_capacity(6 + positions.len() * 4);
    out.push(match params.speed {
        EffectSpeed::Slow => 0x01,
        EffectSpeed::Medium => 0x02,
        EffectSpeed::Fast => 0x03,
    });
    out.push(match params.direction {
        EffectDirection::None => 0x00,
        EffectDirection::Up => 0x01,
        EffectDirection::Down => 0x02,
        EffectDirection::Left => 0x04,
        EffectDirection::Right => 0x05,
    });
    match params.colors {
        Some((a, b)) => {
            out.push(0x01);
            out.extend_from_slice(&a.bytes());
            out.extend_from_slice(&b.bytes());
        }
        None => out.push(0x00),
    }

    let mut order: Vec<usize> = (0..positions.len()).collect();
    order.sort_by(|&a, &b| positions[b].cmp(&positions[a]));

    out.push(key_count);
    out.extend(order.iter().map(|&i| indices[i]));
    if effect.carries_rgb() {
        for &i in &order {
            out.extend_from_slice(&rgb[i * 3..i * 3 + 3]);
        }
    }
    Ok(out)
}

/// Produces RGB frames for the RGB worker.
pub trait FrameSource: Send {
    /// Next frame of `led_count * 3` bytes at the given brightness.
    fn next_frame(&mut self, led_count: usize, brightness: f64) -> Vec<u8>;
}

/// A single colour on every LED.
#[derive(Debug, Clone, Copy)]
pub struct StaticColor(pub Rgb);

impl FrameSource for StaticColor {
    fn next_frame(&mut self, led_count: usize, brightness: f64) -> Vec<u8> {
        solid(self.0.scaled(brightness), led_count)
    }
}

/// A precomputed frame, scaled by brightness and fitted to the LED count.
#[derive(Debug, Clone)]
pub struct FixedFrame(pub Vec<u8>);

impl FrameSource for FixedFrame {
    fn next_frame(&mut self, led_count: usize, brightness: f64) -> Vec<u8> {
        let f = brightness.clamp(0.0, 1.0);
        let mut out: Vec<u8> = self
            .0
            .iter()
            .map(|&c| (c as f64 * f).round() as u8)
            .collect();
        out.resize(led_count * 3, 0);
        out
    }
}

/// A running RGB worker thread.
///
/// Cancelled with a single signal; further signals are no-ops.
pub struct ActiveRgb {
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ActiveRgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRgb")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ActiveRgb {
    /// Start pushing frames from `source` every `interval`.
    pub fn start<F>(
        name: &str,
        interval: Duration,
        led_count: usize,
        brightness: f64,
        mut source: Box<dyn FrameSource>,
        push: F,
    ) -> Result<Self>
    where
        F: Fn(&[u8]) -> Result<()> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let thread_name = format!("{name}-rgb");
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || loop {
                let frame = source.next_frame(led_count, brightness);
                if let Err(e) = push(&frame) {
                    warn!(thread = %thread_name, error = %e, "RGB frame push failed");
                }
                if token.wait(interval) {
                    debug!(thread = %thread_name, "RGB worker cancelled");
                    break;
                }
            })
            .map_err(|e| Error::Fatal(format!("spawn rgb worker: {e}")))?;
        Ok(Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ActiveRgb {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn brightness_is_clamped_before_scaling() {
        assert_eq!(brightness_factor(150), 1.0);
        assert_eq!(brightness_factor(-5), 0.0);
        assert_eq!(brightness_factor(50), 0.5);
        assert_eq!(Rgb::new(200, 100, 0).scaled(0.5), Rgb::new(100, 50, 0));
    }

    #[test]
    fn zone_frame_interleaves_zone_ids() {
        let frame = zone_frame(&[0x02, 0x05], &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(frame, vec![2, 0x01, 0x02, 1, 2, 3, 0x05, 4, 5, 6]);
        assert!(zone_frame(&[0x02], &[1, 2]).is_err());
    }

    #[test]
    fn per_key_frame_sorts_keys_descending() {
        let positions = [3u16, 30, 12];
        let rgb = [1, 1, 1, 2, 2, 2, 3, 3, 3];
        let frame =
            per_key_frame(KeyboardEffect::Static, &EffectParams::default(), &positions, &rgb)
                .unwrap();
        assert_eq!(
            frame,
            vec![0x02, 0x00, 0x00, 3, 10, 4, 1, 2, 2, 2, 3, 3, 3, 1, 1, 1]
        );
    }

    #[test]
    fn per_key_frame_rejects_positions_past_the_index_range() {
        let err = per_key_frame(KeyboardEffect::Off, &EffectParams::default(), &[3, 768], &[])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange { field: "key position", value: 768, .. }
        ));
        assert!(per_key_frame(KeyboardEffect::Off, &EffectParams::default(), &[767], &[]).is_ok());
    }

    #[test]
    fn per_key_frame_rejects_more_keys_than_the_count_byte_holds() {
        let positions: Vec<u16> = (0..256).collect();
        let err = per_key_frame(KeyboardEffect::Off, &EffectParams::default(), &positions, &[])
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { field: "per-key count", value: 256, .. }));
    }

    #[test]
    fn effect_frame_inlines_colours_without_rgb_payload() {
        let params = EffectParams {
            speed: EffectSpeed::Fast,
            direction: EffectDirection::Left,
            colors: Some((Rgb::new(255, 0, 0), Rgb::new(0, 0, 255))),
        };
        let frame = per_key_frame(KeyboardEffect::ColorWave, &params, &[6, 9], &[]).unwrap();
        assert_eq!(
            frame,
            vec![0x03, 0x04, 0x01, 255, 0, 0, 0, 0, 255, 2, 3, 2]
        );
    }

    #[test]
    fn effects_have_distinct_markers() {
        use KeyboardEffect::*;
        let all = [
            Static, Off, Spiral, RainbowWave, Rain, Tlk, Tlr, ColorPulse, ColorShift, ColorWave,
            Visor, Watercolor,
        ];
        let mut markers: Vec<[u8; 2]> = all.iter().map(|e| e.data_type()).collect();
        markers.sort();
        markers.dedup();
        assert_eq!(markers.len(), all.len());
    }

    #[test]
    fn static_source_fills_every_led() {
        let mut src = StaticColor(Rgb::new(10, 20, 30));
        assert_eq!(src.next_frame(2, 1.0), vec![10, 20, 30, 10, 20, 30]);
    }

    #[test]
    fn fixed_frame_scales_and_fits() {
        let mut src = FixedFrame(vec![200, 100, 50]);
        assert_eq!(src.next_frame(2, 0.5), vec![100, 50, 25, 0, 0, 0]);
        assert_eq!(src.next_frame(0, 1.0), Vec::<u8>::new());
    }

    #[test]
    fn active_rgb_stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let rgb = ActiveRgb::start(
            "test",
            Duration::from_millis(5),
            4,
            1.0,
            Box::new(StaticColor(Rgb::BLACK)),
            move |frame| {
                assert_eq!(frame.len(), 12);
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(40));
        rgb.stop();
        rgb.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
