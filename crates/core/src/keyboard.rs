//! Keyboard driver (K65 PLUS, K70 PRO MINI).
//!
//! Button reports go through the [`MappingEngine`]; FN chords come back as
//! [`DeviceRequest`]s and are handled here. Side-band reports carry knob
//! turns and battery updates.

use crate::driver::{self, side_band, DeviceCore, DeviceFamily, DriverContext, Link};
use crate::endpoint::ColorEndpointMode;
use crate::error::Result;
use crate::input::{keys, KeyMotion};
use crate::keymap::{
    self, DeviceRequest, FnChord, InputLayout, KeyAssignment, KeyMap, MacroLibrary,
    MappingEngine, PerformanceFlags, SharedKeyMap,
};
use crate::lighting::{self, ActiveRgb, EffectParams, FrameLayout, KeyboardEffect, StaticColor};
use crate::profile::{self, DeviceProfile};
use crate::protocol::cmd;
use crate::safety;
use crate::state::DeviceState;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

const BRIGHTNESS_STEP: u8 = 10;
/// Profile slots beyond the primary one (`<serial>-1` ... `<serial>-N`).
const EXTRA_PROFILE_SLOTS: usize = 3;

/// Static description of a keyboard model.
#[derive(Debug)]
pub struct KeyboardModel {
    pub pid: u16,
    pub name: &'static str,
    /// Entries in the firmware key-assignment table.
    pub key_count: usize,
    pub input: InputLayout,
    pub chords: &'static [(u64, FnChord)],
    /// Per-key packet positions (multiples of 3).
    pub key_positions: &'static [u16],
    pub polling_rates: &'static [u16],
}

const fn sequential_positions<const N: usize>() -> [u16; N] {
    let mut out = [0u16; N];
    let mut i = 0;
    while i < N {
        out[i] = (i * 3) as u16;
        i += 1;
    }
    out
}

static K65_POSITIONS: [u16; 84] = sequential_positions();
static K70_MINI_POSITIONS: [u16; 61] = sequential_positions();

const DEFAULT_CHORDS: &[(u64, FnChord)] = &[
    (1 << 20, FnChord::BrightnessUp),
    (1 << 21, FnChord::BrightnessDown),
    (1 << 22, FnChord::ProfileSwitch),
    (1 << 23, FnChord::PerformanceLock),
    (1 << 24, FnChord::BluetoothSwitch),
];

pub static K65_PLUS: KeyboardModel = KeyboardModel {
    pid: 0x2b10,
    name: "K65 PLUS WIRELESS",
    key_count: 30,
    input: InputLayout {
        bitmap: 4..8,
        reverse: false,
        modifier: Some(2),
        fn_byte: Some(3),
    },
    chords: DEFAULT_CHORDS,
    key_positions: &K65_POSITIONS,
    polling_rates: &[125, 250, 500, 1000],
};

pub static K70_PRO_MINI: KeyboardModel = KeyboardModel {
    pid: 0x1bb4,
    name: "K70 PRO MINI WIRELESS",
    key_count: 30,
    input: InputLayout {
        bitmap: 4..8,
        reverse: true,
        modifier: Some(2),
        fn_byte: Some(3),
    },
    chords: DEFAULT_CHORDS,
    key_positions: &K70_MINI_POSITIONS,
    polling_rates: &[125, 250, 500, 1000, 2000, 4000, 8000],
};

pub static MODELS: [&KeyboardModel; 2] = [&K65_PLUS, &K70_PRO_MINI];

pub fn model_for_pid(pid: u16) -> Option<&'static KeyboardModel> {
    MODELS.iter().copied().find(|m| m.pid == pid)
}

/// Every key handled natively, mask `1 << i` at button index `i`.
pub fn default_key_map(key_count: usize) -> KeyMap {
    (0..key_count)
        .map(|i| (1u64 << i, KeyAssignment::native(&format!("key{}", i + 1), i as u8)))
        .collect()
}

#[derive(Debug, Default)]
struct KeyboardSettings {
    profile: DeviceProfile,
    slot: usize,
}

/// Keyboard driver.
pub struct Keyboard {
    me: Weak<Self>,
    core: DeviceCore,
    ctx: DriverContext,
    model: &'static KeyboardModel,
    engine: MappingEngine,
    macros: Arc<MacroLibrary>,
    settings: Mutex<KeyboardSettings>,
    listener: Mutex<Option<Transport>>,
}

impl std::fmt::Debug for Keyboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyboard")
            .field("model", &self.model.name)
            .field("core", &self.core)
            .finish()
    }
}

impl Keyboard {
    pub fn new(
        model: &'static KeyboardModel,
        link: Link,
        serial: &str,
        listener: Option<Transport>,
        ctx: DriverContext,
    ) -> Arc<Self> {
        let core = DeviceCore::new(model.name, serial, link, ColorEndpointMode::Session, &ctx.config);
        let macros = Arc::new(MacroLibrary::default());
        let engine = MappingEngine::new(
            model.input.clone(),
            Arc::new(SharedKeyMap::new(default_key_map(model.key_count))),
            Arc::clone(&macros),
            Arc::clone(&ctx.sink),
            core.exit_flag(),
        )
        .with_chords(model.chords);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core,
            ctx,
            model,
            engine,
            macros,
            settings: Mutex::new(KeyboardSettings::default()),
            listener: Mutex::new(listener),
        })
    }

    pub fn model(&self) -> &'static KeyboardModel {
        self.model
    }

    pub fn engine(&self) -> &MappingEngine {
        &self.engine
    }

    pub fn brightness(&self) -> u8 {
        self.settings.lock().profile.brightness
    }

    /// Upload a key map and make it live. A map of the wrong size is refused
    /// and the device is left untouched.
    pub fn set_key_map(&self, map: KeyMap) -> Result<usize> {
        self.core.ensure_reachable()?;
        let frames = keymap::upload_key_map(
            self.core.transport(),
            self.core.addr(),
            &map,
            self.model.key_count,
        )?;
        self.engine.keymap().replace(map);
        Ok(frames)
    }

    pub fn set_brightness(&self, brightness: i64) -> Result<()> {
        let value = safety::validate_brightness(brightness)?;
        self.settings.lock().profile.brightness = value;
        self.apply_lighting()
    }

    pub fn set_effect(&self, effect: KeyboardEffect, params: EffectParams) -> Result<()> {
        {
            let mut settings = self.settings.lock();
            settings.profile.effect = Some(effect);
            settings.profile.effect_params = params;
        }
        self.apply_lighting()
    }

    pub fn set_performance_flags(&self, flags: PerformanceFlags) {
        self.settings.lock().profile.performance = flags;
        self.engine.set_performance_flags(flags);
    }

    fn load_macros(&self) {
        match self.ctx.profiles.macros() {
            Ok(macros) => macros.into_iter().for_each(|m| self.macros.insert(m)),
            Err(e) => warn!(error = %e, "Macros unavailable"),
        }
    }

    fn stored_key_map(&self, profile: &DeviceProfile) -> KeyMap {
        let Some(hash) = profile.key_assignment_hash.as_deref() else {
            return default_key_map(self.model.key_count);
        };
        match self.ctx.profiles.key_map(hash) {
            Ok(Some(map)) => map,
            Ok(None) => {
                warn!(hash, "Key map not found, using defaults");
                default_key_map(self.model.key_count)
            }
            Err(e) => {
                warn!(hash, error = %e, "Key map unreadable, using defaults");
                default_key_map(self.model.key_count)
            }
        }
    }

    /// Push every profile setting; individual failures keep the old state.
    fn apply_profile(&self, profile: DeviceProfile) -> Result<()> {
        let map = self.stored_key_map(&profile);
        if let Err(e) = self.set_key_map(map) {
            warn!(error = %e, "Key map rejected, keeping firmware defaults");
            if let Err(e) = self.set_key_map(default_key_map(self.model.key_count)) {
                warn!(error = %e, "Default key map not uploaded");
            }
        }
        self.engine.set_performance_flags(profile.performance);

        match safety::validate_polling_rate(profile.polling_rate, self.model.polling_rates) {
            Ok(code) => {
                if let Err(e) = self.core.fire(cmd::SET_POLLING_RATE, &[code]) {
                    warn!(error = %e, "Polling rate not applied");
                }
            }
            Err(e) => warn!(error = %e, "Polling rate rejected"),
        }
        match safety::validate_sleep_minutes(profile.sleep_minutes) {
            Ok(minutes) => {
                let ms = minutes * 60_000;
                if let Err(e) = self.core.fire(cmd::SET_SLEEP_TIMER, &ms.to_le_bytes()) {
                    warn!(error = %e, "Sleep timer not applied");
                }
            }
            Err(e) => warn!(error = %e, "Sleep timer rejected"),
        }

        self.settings.lock().profile = profile;
        self.apply_lighting()
    }

    fn apply_lighting(&self) -> Result<()> {
        let (effect, params, color, brightness) = {
            let settings = self.settings.lock();
            let p = &settings.profile;
            (p.effect, p.effect_params, p.color, p.brightness)
        };

        match effect {
            Some(effect) if effect != KeyboardEffect::Static => {
                self.core.stop_rgb();
                let level = brightness as u16 * 10;
                self.core.fire(cmd::SET_BRIGHTNESS, &level.to_le_bytes())?;
                let frame = lighting::per_key_frame(effect, &params, self.model.key_positions, &[])?;
                self.core.write_color(effect.data_type(), &frame)
            }
            _ => {
                let layout = FrameLayout::PerKey(self.model.key_positions);
                let keyboard = self.me.clone();
                let rgb = ActiveRgb::start(
                    &format!("{}-{}", self.model.name, self.core.serial()),
                    self.ctx.config.rgb_refresh(),
                    layout.led_count(0),
                    lighting::brightness_factor(brightness as i32),
                    Box::new(StaticColor(color)),
                    move |rgb| {
                        let Some(kb) = keyboard.upgrade() else {
                            return Ok(());
                        };
                        let (data_type, payload) = layout.frame(rgb)?;
                        kb.core.write_color(data_type, &payload)
                    },
                )?;
                self.core.set_rgb(Some(rgb));
                Ok(())
            }
        }
    }

    fn adjust_brightness(&self, up: bool) {
        let level = {
            let mut settings = self.settings.lock();
            let b = settings.profile.brightness;
            let next = if up {
                b.saturating_add(BRIGHTNESS_STEP).min(safety::BRIGHTNESS_MAX)
            } else {
                b.saturating_sub(BRIGHTNESS_STEP)
            };
            settings.profile.brightness = next;
            next
        };
        debug!(brightness = level, "Brightness changed");
        if let Err(e) = self.apply_lighting() {
            warn!(error = %e, "Brightness not applied");
        }
    }

    fn profile_slot_name(&self, slot: usize) -> String {
        match slot {
            0 => self.core.serial(),
            n => format!("{}-{n}", self.core.serial()),
        }
    }

    /// Move to the next stored profile slot, wrapping to the primary one.
    pub fn switch_profile(&self) -> Result<usize> {
        let current = self.settings.lock().slot;
        let mut next = (current + 1) % (EXTRA_PROFILE_SLOTS + 1);
        let profile = loop {
            if next == 0 {
                break profile::profile_or_default(
                    self.ctx.profiles.as_ref(),
                    &self.profile_slot_name(0),
                );
            }
            match self.ctx.profiles.device_profile(&self.profile_slot_name(next)) {
                Ok(Some(p)) => break p,
                _ => next = (next + 1) % (EXTRA_PROFILE_SLOTS + 1),
            }
        };
        self.settings.lock().slot = next;
        info!(serial = %self.core.serial(), slot = next, "Profile switched");
        self.apply_profile(profile)?;
        Ok(next)
    }

    fn handle_request(&self, request: DeviceRequest) {
        match request {
            DeviceRequest::Chord(FnChord::BrightnessUp) => self.adjust_brightness(true),
            DeviceRequest::Chord(FnChord::BrightnessDown) => self.adjust_brightness(false),
            DeviceRequest::Chord(FnChord::ProfileSwitch) => {
                if let Err(e) = self.switch_profile() {
                    warn!(error = %e, "Profile switch failed");
                }
            }
            DeviceRequest::Chord(FnChord::PerformanceLock) => {
                let locked = self.engine.toggle_performance_lock();
                info!(locked, "Performance lock toggled");
            }
            DeviceRequest::Chord(FnChord::BluetoothSwitch) => {
                debug!("Bluetooth profile switch is handled by firmware");
            }
            other => trace!(?other, "Request not applicable to keyboards"),
        }
    }

    fn handle_side_band(&self, data: &[u8]) {
        if let Some(level) = side_band::battery(data) {
            self.modify_battery_level(level);
            return;
        }
        match data.get(2).copied() {
            Some(side_band::KNOB) => {
                let delta = data.get(3).map_or(0, |&b| b as i8);
                let code = if delta > 0 {
                    keys::KEY_VOLUMEUP
                } else {
                    keys::KEY_VOLUMEDOWN
                };
                for _ in 0..delta.unsigned_abs() {
                    if let Err(e) = self.ctx.sink.emit_key(code, KeyMotion::OneShot) {
                        warn!(error = %e, "Volume key not emitted");
                        break;
                    }
                }
            }
            other => trace!(kind = ?other, "Ignoring side-band report"),
        }
    }

    /// Entry point for every input report, wired or forwarded by a dongle.
    pub fn handle_input(&self, data: &[u8]) {
        match data.get(1).copied() {
            Some(keymap::BUTTON_REPORT) => match self.engine.handle_report(data) {
                Ok(requests) => requests.into_iter().for_each(|r| self.handle_request(r)),
                Err(e) => warn!(error = %e, "Key event not delivered"),
            },
            _ if side_band::is_side_band(data) => self.handle_side_band(data),
            _ => trace!("Ignoring input report"),
        }
    }

    fn start_background(&self) -> Result<()> {
        if self.core.is_wireless() {
            return Ok(());
        }
        self.core.spawn_ticker(
            "keepalive",
            self.ctx.config.keep_alive(),
            driver::weak_task(self.me.clone(), |kb: &Keyboard| {
                if let Err(e) = kb.keep_alive() {
                    warn!(error = %e, "Keyboard heartbeat failed");
                }
            }),
        )?;
        if let Some(listener) = self.listener.lock().take() {
            let keyboard = self.me.clone();
            self.core.spawn_listener(
                "listener",
                listener,
                self.ctx.config.listener_timeout(),
                move |data| {
                    if let Some(kb) = keyboard.upgrade() {
                        kb.handle_input(data);
                    }
                },
            )?;
        }
        Ok(())
    }

    fn release_inputs(&self) {
        if let Err(e) = self.engine.release_all() {
            warn!(error = %e, "Held keys not released");
        }
    }
}

impl DeviceFamily for Keyboard {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn init(&self) -> Result<()> {
        driver::begin_init(&self.core)?;
        self.core.read_firmware()?;
        if self.core.is_wireless() {
            match self.core.query_battery() {
                Ok(level) => self.modify_battery_level(level),
                Err(e) => debug!(error = %e, "Battery not reported"),
            }
        }
        self.core.lifecycle().advance(DeviceState::Identified);

        self.load_macros();
        let profile = profile::profile_or_default(self.ctx.profiles.as_ref(), &self.core.serial());
        self.settings.lock().slot = 0;
        if let Err(e) = self.apply_profile(profile) {
            warn!(error = %e, "Profile not fully applied");
        }
        self.start_background()?;

        self.core.lifecycle().advance(DeviceState::Ready);
        info!(model = self.model.name, serial = %self.core.serial(), "Keyboard ready");
        Ok(())
    }

    fn stop(&self) {
        self.release_inputs();
        self.core.stop(true);
    }

    fn stop_dirty(&self) {
        self.release_inputs();
        self.core.stop(false);
    }

    fn sleep_mode(&self) -> Option<u32> {
        Some(self.settings.lock().profile.sleep_minutes)
    }

    fn trigger_key_assignment(&self, data: &[u8]) {
        self.handle_input(data);
    }

    fn set_connected(&self, connected: bool) {
        if !connected {
            self.release_inputs();
        }
        self.core.set_connected(connected);
    }
}
