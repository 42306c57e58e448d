//! Mouse driver (M65 RGB ULTRA, IRONCLAW RGB).

use crate::driver::{self, side_band, DeviceCore, DeviceFamily, DriverContext, Link};
use crate::endpoint::ColorEndpointMode;
use crate::error::{Error, Result};
use crate::keymap::{
    self, DeviceRequest, InputLayout, KeyAssignment, KeyMap, MacroLibrary, MappingEngine,
    SharedKeyMap,
};
use crate::lighting::{self, ActiveRgb, FixedFrame, FrameLayout, Rgb};
use crate::profile::{self, DeviceProfile};
use crate::protocol::cmd;
use crate::safety;
use crate::state::DeviceState;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Static description of a mouse model.
#[derive(Debug)]
pub struct MouseModel {
    pub pid: u16,
    pub name: &'static str,
    pub key_count: usize,
    pub input: InputLayout,
    pub frame: FrameLayout,
    /// LED count for flat frames.
    pub led_count: usize,
    pub dpi_min: u16,
    pub dpi_max: u16,
    pub polling_rates: &'static [u16],
}

impl MouseModel {
    pub fn led_count(&self) -> usize {
        self.frame.led_count(self.led_count)
    }
}

pub static M65_RGB_ULTRA: MouseModel = MouseModel {
    pid: 0x1b9e,
    name: "M65 RGB ULTRA",
    key_count: 7,
    input: InputLayout {
        bitmap: 2..3,
        reverse: false,
        modifier: None,
        fn_byte: None,
    },
    frame: FrameLayout::Flat,
    led_count: 2,
    dpi_min: 100,
    dpi_max: 26000,
    polling_rates: &[125, 250, 500, 1000, 2000, 4000, 8000],
};

pub static IRONCLAW_RGB: MouseModel = MouseModel {
    pid: 0x1b5d,
    name: "IRONCLAW RGB",
    key_count: 6,
    input: InputLayout {
        bitmap: 2..3,
        reverse: false,
        modifier: None,
        fn_byte: None,
    },
    frame: FrameLayout::Zones(&[0x01, 0x02, 0x04]),
    led_count: 3,
    dpi_min: 100,
    dpi_max: 18000,
    polling_rates: &[125, 250, 500, 1000],
};

pub static MODELS: [&MouseModel; 2] = [&M65_RGB_ULTRA, &IRONCLAW_RGB];

pub fn model_for_pid(pid: u16) -> Option<&'static MouseModel> {
    MODELS.iter().copied().find(|m| m.pid == pid)
}

fn default_key_map(key_count: usize) -> KeyMap {
    (0..key_count)
        .map(|i| (1u64 << i, KeyAssignment::native(&format!("button{}", i + 1), i as u8)))
        .collect()
}

/// Next DPI stage, wrapping at both ends.
pub fn next_stage(current: usize, count: usize, up: bool) -> usize {
    if count == 0 {
        return 0;
    }
    let current = current.min(count - 1);
    if up {
        (current + 1) % count
    } else {
        (current + count - 1) % count
    }
}

/// One colour per LED: the zone override when set, otherwise the profile colour.
fn zone_colors(profile: &DeviceProfile, led_count: usize) -> Vec<u8> {
    (0..led_count)
        .flat_map(|i| {
            profile
                .zone_colors
                .get(&(i as u8))
                .copied()
                .unwrap_or(profile.color)
                .bytes()
        })
        .collect()
}

#[derive(Debug)]
struct MouseSettings {
    profile: DeviceProfile,
    stage: usize,
    /// Stage to return to when sniper is released.
    sniper_restore: Option<usize>,
}

impl Default for MouseSettings {
    fn default() -> Self {
        let profile = DeviceProfile::default();
        Self {
            stage: profile.active_dpi_stage,
            profile,
            sniper_restore: None,
        }
    }
}

/// Mouse driver.
pub struct Mouse {
    me: Weak<Self>,
    core: DeviceCore,
    ctx: DriverContext,
    model: &'static MouseModel,
    engine: MappingEngine,
    macros: Arc<MacroLibrary>,
    settings: Mutex<MouseSettings>,
    listener: Mutex<Option<Transport>>,
}

impl std::fmt::Debug for Mouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mouse")
            .field("model", &self.model.name)
            .field("core", &self.core)
            .finish()
    }
}

impl Mouse {
    pub fn new(
        model: &'static MouseModel,
        link: Link,
        serial: &str,
        listener: Option<Transport>,
        ctx: DriverContext,
    ) -> Arc<Self> {
        let core = DeviceCore::new(model.name, serial, link, ColorEndpointMode::Bracketed, &ctx.config);
        let macros = Arc::new(MacroLibrary::default());
        let engine = MappingEngine::new(
            model.input.clone(),
            Arc::new(SharedKeyMap::new(default_key_map(model.key_count))),
            Arc::clone(&macros),
            Arc::clone(&ctx.sink),
            core.exit_flag(),
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core,
            ctx,
            model,
            engine,
            macros,
            settings: Mutex::new(MouseSettings::default()),
            listener: Mutex::new(listener),
        })
    }

    pub fn model(&self) -> &'static MouseModel {
        self.model
    }

    pub fn engine(&self) -> &MappingEngine {
        &self.engine
    }

    /// Index of the active DPI stage.
    pub fn active_stage(&self) -> usize {
        self.settings.lock().stage
    }

    /// Send a DPI value to both axes.
    pub fn set_dpi(&self, dpi: u16) -> Result<u16> {
        let dpi = safety::validate_dpi(dpi, self.model.dpi_min, self.model.dpi_max)?;
        let bytes = dpi.to_le_bytes();
        self.core.fire(cmd::SET_DPI_X, &bytes)?;
        self.core.fire(cmd::SET_DPI_Y, &bytes)?;
        debug!(dpi, "DPI set");
        Ok(dpi)
    }

    /// Step to the neighbouring DPI stage and apply it.
    pub fn cycle_dpi(&self, up: bool) -> Result<u16> {
        let (stage, dpi) = {
            let settings = self.settings.lock();
            let stages = &settings.profile.dpi_stages;
            if stages.is_empty() {
                return Err(Error::protocol("dpi", "profile has no DPI stages"));
            }
            let stage = next_stage(settings.stage, stages.len(), up);
            (stage, stages[stage])
        };
        let applied = self.set_dpi(dpi)?;
        let mut settings = self.settings.lock();
        settings.stage = stage;
        settings.sniper_restore = None;
        Ok(applied)
    }

    /// Sniper held: drop to the sniper DPI. Released: restore the saved stage.
    pub fn sniper(&self, held: bool) -> Result<()> {
        if held {
            let sniper_dpi = {
                let mut settings = self.settings.lock();
                if settings.sniper_restore.is_some() {
                    return Ok(());
                }
                settings.sniper_restore = Some(settings.stage);
                settings.profile.sniper_dpi
            };
            self.set_dpi(sniper_dpi)?;
        } else {
            let dpi = {
                let mut settings = self.settings.lock();
                let Some(stage) = settings.sniper_restore.take() else {
                    return Ok(());
                };
                settings.stage = stage;
                settings.profile.dpi_stages.get(stage).copied()
            };
            if let Some(dpi) = dpi {
                self.set_dpi(dpi)?;
            }
        }
        Ok(())
    }

    pub fn set_polling_rate(&self, hz: u16) -> Result<()> {
        let code = safety::validate_polling_rate(hz, self.model.polling_rates)?;
        self.core.fire(cmd::SET_POLLING_RATE, &[code])?;
        self.settings.lock().profile.polling_rate = hz;
        Ok(())
    }

    pub fn set_sleep_minutes(&self, minutes: u32) -> Result<()> {
        let minutes = safety::validate_sleep_minutes(minutes)?;
        self.core
            .fire(cmd::SET_SLEEP_TIMER, &(minutes * 60_000).to_le_bytes())?;
        self.settings.lock().profile.sleep_minutes = minutes;
        Ok(())
    }

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

    pub fn set_color(&self, color: Rgb) -> Result<()> {
        self.settings.lock().profile.color = color;
        self.start_rgb()
    }

    fn start_rgb(&self) -> Result<()> {
        let (frame, brightness) = {
            let settings = self.settings.lock();
            (
                zone_colors(&settings.profile, self.model.led_count()),
                settings.profile.brightness,
            )
        };
        let layout = self.model.frame;
        let mouse = self.me.clone();
        let rgb = ActiveRgb::start(
            &format!("{}-{}", self.model.name, self.core.serial()),
            self.ctx.config.rgb_refresh(),
            self.model.led_count(),
            lighting::brightness_factor(brightness as i32),
            Box::new(FixedFrame(frame)),
            move |rgb| {
                let Some(mouse) = mouse.upgrade() else {
                    return Ok(());
                };
                let (data_type, payload) = layout.frame(rgb)?;
                mouse.core.write_color(data_type, &payload)
            },
        )?;
        self.core.set_rgb(Some(rgb));
        Ok(())
    }

    fn apply_profile(&self, mut profile: DeviceProfile) -> Result<()> {
        let (min, max) = (self.model.dpi_min, self.model.dpi_max);
        profile.dpi_stages.retain(|&dpi| match safety::validate_dpi(dpi, min, max) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Dropping DPI stage");
                false
            }
        });
        let stage = profile
            .active_dpi_stage
            .min(profile.dpi_stages.len().saturating_sub(1));
        let dpi = profile.dpi_stages.get(stage).copied();
        let (polling, sleep) = (profile.polling_rate, profile.sleep_minutes);

        let map = match profile.key_assignment_hash.as_deref() {
            Some(hash) => match self.ctx.profiles.key_map(hash) {
                Ok(Some(map)) => map,
                Ok(None) | Err(_) => {
                    warn!(hash, "Key map unavailable, using defaults");
                    default_key_map(self.model.key_count)
                }
            },
            None => default_key_map(self.model.key_count),
        };

        {
            let mut settings = self.settings.lock();
            settings.profile = profile;
            settings.stage = stage;
            settings.sniper_restore = None;
        }

        if let Err(e) = self.set_key_map(map) {
            warn!(error = %e, "Key map rejected");
        }
        if let Some(dpi) = dpi {
            if let Err(e) = self.set_dpi(dpi) {
                warn!(error = %e, "DPI not applied");
            }
        }
        if let Err(e) = self.set_polling_rate(polling) {
            warn!(error = %e, "Polling rate not applied");
        }
        if let Err(e) = self.set_sleep_minutes(sleep) {
            warn!(error = %e, "Sleep timer not applied");
        }
        self.start_rgb()
    }

    fn handle_request(&self, request: DeviceRequest) {
        let result = match request {
            DeviceRequest::DpiUp => self.cycle_dpi(true).map(drop),
            DeviceRequest::DpiDown => self.cycle_dpi(false).map(drop),
            DeviceRequest::Sniper(held) => self.sniper(held),
            DeviceRequest::Chord(chord) => {
                trace!(?chord, "Chord not applicable to mice");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(?request, error = %e, "Mouse request failed");
        }
    }

    /// Entry point for every input report, wired or forwarded by a dongle.
    pub fn handle_input(&self, data: &[u8]) {
        if data.get(1) == Some(&keymap::BUTTON_REPORT) {
            match self.engine.handle_report(data) {
                Ok(requests) => requests.into_iter().for_each(|r| self.handle_request(r)),
                Err(e) => warn!(error = %e, "Button event not delivered"),
            }
        } else if let Some(level) = side_band::battery(data) {
            self.modify_battery_level(level);
        } else {
            trace!("Ignoring input report");
        }
    }

    fn load_macros(&self) {
        match self.ctx.profiles.macros() {
            Ok(macros) => macros.into_iter().for_each(|m| self.macros.insert(m)),
            Err(e) => warn!(error = %e, "Macros unavailable"),
        }
    }

    fn start_background(&self) -> Result<()> {
        if self.core.is_wireless() {
            return Ok(());
        }
        self.core.spawn_ticker(
            "keepalive",
            self.ctx.config.keep_alive(),
            driver::weak_task(self.me.clone(), |mouse: &Mouse| {
                if let Err(e) = mouse.keep_alive() {
                    warn!(error = %e, "Mouse heartbeat failed");
                }
            }),
        )?;
        if let Some(listener) = self.listener.lock().take() {
            let mouse = self.me.clone();
            self.core.spawn_listener(
                "listener",
                listener,
                self.ctx.config.listener_timeout(),
                move |data| {
                    if let Some(mouse) = mouse.upgrade() {
                        mouse.handle_input(data);
                    }
                },
            )?;
        }
        Ok(())
    }

    fn release_inputs(&self) {
        if let Err(e) = self.engine.release_all() {
            warn!(error = %e, "Held buttons not released");
        }
    }
}

impl DeviceFamily for Mouse {
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
        if let Err(e) = self.apply_profile(profile) {
            warn!(error = %e, "Profile not fully applied");
        }
        self.start_background()?;

        self.core.lifecycle().advance(DeviceState::Ready);
        info!(model = self.model.name, serial = %self.core.serial(), "Mouse ready");
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
