//! SCUF Envision Pro controller driver.
//!
//! Commands go out with command byte 0x02 and the sub-endpoint ahead of the
//! opcode. Stick movement arrives on a separate analog interface and is turned
//! into relative mouse motion for sticks in mouse mode.

use crate::analog::{self, AnalogConfig};
use crate::driver::{self, side_band, DeviceCore, DeviceFamily, DriverContext, Link};
use crate::endpoint::{Address, ColorEndpointMode};
use crate::error::{Error, Result};
use crate::lighting::{self, ActiveRgb, FrameLayout, StaticColor};
use crate::profile::{self, DeviceProfile};
use crate::protocol::cmd;
use crate::safety;
use crate::state::DeviceState;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub const PRODUCT_NAME: &str = "SCUF Envision Pro";
pub const PID: u16 = 0x3a05;
/// Sub-endpoint of a wired controller.
pub const WIRED_SUB_ENDPOINT: u8 = 0x08;
const LED_COUNT: usize = 9;
const PREVIEW_DURATION: Duration = Duration::from_secs(1);
const PREVIEW_POLL: Duration = Duration::from_millis(50);

/// Controller driver.
pub struct Controller {
    me: Weak<Self>,
    core: DeviceCore,
    ctx: DriverContext,
    analog_config: RwLock<Arc<AnalogConfig>>,
    profile: Mutex<DeviceProfile>,
    /// Analog interface: stick reports in, vibration previews out.
    analog: Option<Transport>,
    analog_started: Mutex<bool>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("core", &self.core)
            .field("analog", &self.analog.is_some())
            .finish()
    }
}

impl Controller {
    pub fn wired_link(transport: Transport) -> Link {
        Link::new(transport, Address::controller(WIRED_SUB_ENDPOINT), false)
    }

    pub fn new(link: Link, serial: &str, analog: Option<Transport>, ctx: DriverContext) -> Arc<Self> {
        let core = DeviceCore::new(PRODUCT_NAME, serial, link, ColorEndpointMode::Bracketed, &ctx.config);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core,
            ctx,
            analog_config: RwLock::new(Arc::new(AnalogConfig::default())),
            profile: Mutex::new(DeviceProfile::default()),
            analog,
            analog_started: Mutex::new(false),
        })
    }

    pub fn analog_config(&self) -> Arc<AnalogConfig> {
        Arc::clone(&self.analog_config.read())
    }

    /// Replace the stick configuration. Both sticks are checked first; a
    /// rejected config leaves the live one in place.
    pub fn set_analog(&self, config: AnalogConfig) -> Result<()> {
        safety::validate_stick(&config.left)?;
        safety::validate_stick(&config.right)?;
        *self.analog_config.write() = Arc::new(config);
        Ok(())
    }

    pub fn set_vibration(&self, left: u8, right: u8) -> Result<()> {
        let left = safety::validate_vibration(left)?;
        let right = safety::validate_vibration(right)?;
        self.core.fire(cmd::SET_VIBRATION, &[left, right])?;
        let mut profile = self.profile.lock();
        profile.vibration_left = left;
        profile.vibration_right = right;
        Ok(())
    }

    /// Rumble at the given strengths for a second on the analog interface.
    pub fn preview_vibration(&self, left: u8, right: u8) -> Result<()> {
        let left = safety::validate_vibration(left)?;
        let right = safety::validate_vibration(right)?;
        let analog = self
            .analog
            .clone()
            .ok_or_else(|| Error::DeviceNotFound(format!("{PRODUCT_NAME}: analog interface")))?;
        analog.write_raw(&analog::vibration_report(left, right))?;

        let exit = self.core.exit_flag();
        self.core.spawn_worker("vibration", move || {
            let until = Instant::now() + PREVIEW_DURATION;
            while Instant::now() < until && !exit.is_set() {
                thread::sleep(PREVIEW_POLL);
            }
            if let Err(e) = analog.write_raw(&analog::vibration_report(0, 0)) {
                warn!(error = %e, "Vibration preview not stopped");
            }
        })
    }

    fn handle_analog(&self, data: &[u8]) {
        let Some(report) = analog::parse_analog(data) else {
            trace!(len = data.len(), "Short analog report");
            return;
        };
        let config = self.analog_config();
        if let Err(e) = config.apply(&report, self.ctx.sink.as_ref()) {
            warn!(error = %e, "Stick motion not delivered");
        }
    }

    /// Reports forwarded by a dongle; only battery updates matter here.
    /// Button reports keep their hardware function and are not remapped.
    pub fn handle_input(&self, data: &[u8]) {
        match side_band::battery(data) {
            Some(level) => self.modify_battery_level(level),
            None => trace!("Ignoring input report"),
        }
    }

    fn start_rgb(&self) -> Result<()> {
        let (color, brightness) = {
            let p = self.profile.lock();
            (p.color, p.brightness)
        };
        let controller = self.me.clone();
        let rgb = ActiveRgb::start(
            &format!("{PRODUCT_NAME}-{}", self.core.serial()),
            self.ctx.config.rgb_refresh(),
            LED_COUNT,
            lighting::brightness_factor(brightness as i32),
            Box::new(StaticColor(color)),
            move |rgb| {
                let Some(controller) = controller.upgrade() else {
                    return Ok(());
                };
                let (data_type, payload) = FrameLayout::Flat.frame(rgb)?;
                controller.core.write_color(data_type, &payload)
            },
        )?;
        self.core.set_rgb(Some(rgb));
        Ok(())
    }

    fn apply_profile(&self, profile: DeviceProfile) -> Result<()> {
        if let Err(e) = self.set_analog(profile.analog.clone()) {
            warn!(error = %e, "Stick configuration rejected, keeping defaults");
        }
        if let Err(e) = self.set_vibration(profile.vibration_left, profile.vibration_right) {
            warn!(error = %e, "Vibration not applied");
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
        *self.profile.lock() = profile;
        self.start_rgb()
    }

    fn start_background(&self) -> Result<()> {
        if !self.core.is_wireless() {
            self.core.spawn_ticker(
                "keepalive",
                self.ctx.config.keep_alive(),
                driver::weak_task(self.me.clone(), |c: &Controller| {
                    if let Err(e) = c.keep_alive() {
                        warn!(error = %e, "Controller heartbeat failed");
                    }
                }),
            )?;
        }
        let mut started = self.analog_started.lock();
        if let (Some(analog), false) = (&self.analog, *started) {
            let controller = self.me.clone();
            self.core.spawn_listener(
                "analog",
                analog.clone(),
                self.ctx.config.listener_timeout(),
                move |data| {
                    if let Some(c) = controller.upgrade() {
                        c.handle_analog(data);
                    }
                },
            )?;
            *started = true;
        }
        Ok(())
    }
}

impl DeviceFamily for Controller {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn init(&self) -> Result<()> {
        driver::begin_init(&self.core)?;
        self.core.read_firmware()?;
        match self.core.query_battery() {
            Ok(level) => self.modify_battery_level(level),
            Err(e) => debug!(error = %e, "Battery not reported"),
        }
        self.core.lifecycle().advance(DeviceState::Identified);

        let profile = profile::profile_or_default(self.ctx.profiles.as_ref(), &self.core.serial());
        if let Err(e) = self.apply_profile(profile) {
            warn!(error = %e, "Profile not fully applied");
        }
        self.start_background()?;

        self.core.lifecycle().advance(DeviceState::Ready);
        info!(serial = %self.core.serial(), "Controller ready");
        Ok(())
    }

    fn sleep_mode(&self) -> Option<u32> {
        Some(self.profile.lock().sleep_minutes)
    }

    fn trigger_key_assignment(&self, data: &[u8]) {
        self.handle_input(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::StickMode;
    use crate::config::DaemonConfig;
    use crate::input::mock::{Emitted, RecordingSink};
    use crate::profile::MemoryProfileStore;
    use crate::transport::mock::{self, MockHandle};

    fn controller(analog: Option<Transport>) -> (Arc<Controller>, MockHandle, RecordingSink) {
        let (transport, handle) = mock::transport();
        let sink = RecordingSink::new();
        let ctx = DriverContext {
            sink: Arc::new(sink.clone()),
            config: Arc::new(DaemonConfig::default()),
            profiles: Arc::new(MemoryProfileStore::new()),
        };
        let c = Controller::new(Controller::wired_link(transport), "SC1", analog, ctx);
        (c, handle, sink)
    }

    #[test]
    fn vibration_is_validated_then_sent_with_controller_prefix() {
        let (c, handle, _) = controller(None);
        assert!(c.set_vibration(101, 0).unwrap_err().is_config());
        assert!(handle.writes().is_empty());

        c.set_vibration(40, 60).unwrap();
        let w = &handle.writes()[0];
        assert_eq!(&w[..8], &[0x00, 0x02, 0x08, 0x01, 0x6b, 0x00, 40, 60]);
    }

    #[test]
    fn rejected_stick_config_keeps_the_live_one() {
        let (c, _, _) = controller(None);
        let mut bad = AnalogConfig::default();
        bad.left.dead_zone_min = 90.0;
        bad.left.dead_zone_max = 10.0;
        assert!(c.set_analog(bad).is_err());
        assert_eq!(*c.analog_config(), AnalogConfig::default());
    }

    #[test]
    fn preview_needs_the_analog_interface() {
        let (c, _, _) = controller(None);
        assert!(matches!(
            c.preview_vibration(10, 10),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn preview_rumbles_then_stops() {
        let (analog, analog_handle) = mock::transport();
        let (c, _, _) = controller(Some(analog));
        c.preview_vibration(30, 70).unwrap();
        c.core().stop(false);
        let writes = analog_handle.writes();
        assert_eq!(writes[0], analog::vibration_report(30, 70).to_vec());
        assert_eq!(writes.last().unwrap(), &analog::vibration_report(0, 0).to_vec());
    }

    #[test]
    fn mouse_mode_stick_moves_the_pointer() {
        let (c, _, sink) = controller(None);
        let mut config = AnalogConfig::default();
        config.right.mode = StickMode::Mouse;
        c.set_analog(config).unwrap();

        let mut report = vec![0x01];
        for axis in [0i16, 0, 20000, 0] {
            report.extend_from_slice(&axis.to_le_bytes());
        }
        c.handle_analog(&report);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Emitted::Move(dx, 0) if dx > 0));
    }

    #[test]
    fn forwarded_reports_update_battery_and_leave_buttons_alone() {
        let (c, handle, sink) = controller(None);
        c.handle_input(&[0x00, side_band::WIRELESS, side_band::BATTERY, 0x00, 0xE8, 0x02]);
        assert_eq!(c.battery_level(), 74);

        c.handle_input(&[0x01, crate::keymap::BUTTON_REPORT, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(c.battery_level(), 74);
        assert!(sink.events().is_empty());
        assert!(handle.writes().is_empty());
    }
}
