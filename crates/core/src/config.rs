//! Daemon configuration.
//!
//! Loaded once at start-up from a JSON file. Every field has a default, so a
//! missing file or a partial file is fine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Allowed keep-alive window in seconds.
pub const KEEP_ALIVE_RANGE: (u64, u64) = (10, 20);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root of the profile store (`profiles/`, `keymaps/`, `macros/`).
    pub profile_dir: PathBuf,
    /// Heartbeat interval for wired devices, clamped to 10..=20 s.
    pub keep_alive_secs: u64,
    /// Dongle keep-alive and battery poll interval.
    pub dongle_keep_alive_secs: u64,
    pub temperature_refresh_ms: u64,
    pub speed_refresh_ms: u64,
    pub listener_timeout_ms: u64,
    /// Interval at which the RGB worker re-sends its frame.
    pub rgb_refresh_ms: u64,
    /// Delay between a wireless connect event and child initialisation.
    pub connect_settle_secs: u64,
    /// Interval between hot-plug rescans of the HID bus.
    pub hotplug_scan_ms: u64,
    /// Boot speed for non-pump hub channels.
    pub fan_default_percent: u8,
    /// Lowest speed any pump channel is ever set to.
    pub pump_min_percent: u8,
    /// Per-channel speed overrides (channel id -> percent).
    pub custom_speeds: BTreeMap<u8, u8>,
    pub software_mode_retries: u32,
    pub software_mode_retry_delay_ms: u64,
    pub enable_uinput: bool,
    pub uinput_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from("/var/lib/open-icue"),
            keep_alive_secs: 15,
            dongle_keep_alive_secs: 10,
            temperature_refresh_ms: 1000,
            speed_refresh_ms: 1000,
            listener_timeout_ms: 100,
            rgb_refresh_ms: 1000,
            connect_settle_secs: 5,
            hotplug_scan_ms: 2000,
            fan_default_percent: 50,
            pump_min_percent: 50,
            custom_speeds: BTreeMap::new(),
            software_mode_retries: 20,
            software_mode_retry_delay_ms: 2000,
            enable_uinput: true,
            uinput_path: PathBuf::from(crate::input::UINPUT_PATH),
        }
    }
}

fn out_of_range(field: &'static str, value: u64, min: u64, max: u64) -> Error {
    Error::OutOfRange {
        field,
        value: value as i64,
        min: min as i64,
        max: max as i64,
    }
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fan_default_percent > 100 {
            return Err(out_of_range("fan_default_percent", self.fan_default_percent as u64, 0, 100));
        }
        if self.pump_min_percent > 100 {
            return Err(out_of_range("pump_min_percent", self.pump_min_percent as u64, 0, 100));
        }
        for percent in self.custom_speeds.values() {
            if *percent > 100 {
                return Err(out_of_range("custom_speeds", *percent as u64, 0, 100));
            }
        }
        for (field, value) in [
            ("temperature_refresh_ms", self.temperature_refresh_ms),
            ("speed_refresh_ms", self.speed_refresh_ms),
            ("listener_timeout_ms", self.listener_timeout_ms),
            ("rgb_refresh_ms", self.rgb_refresh_ms),
            ("dongle_keep_alive_secs", self.dongle_keep_alive_secs),
            ("hotplug_scan_ms", self.hotplug_scan_ms),
        ] {
            if value == 0 {
                return Err(out_of_range(field, 0, 1, u32::MAX as u64));
            }
        }
        if self.software_mode_retries == 0 {
            return Err(out_of_range("software_mode_retries", 0, 1, 100));
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(
            self.keep_alive_secs
                .clamp(KEEP_ALIVE_RANGE.0, KEEP_ALIVE_RANGE.1),
        )
    }

    pub fn dongle_keep_alive(&self) -> Duration {
        Duration::from_secs(self.dongle_keep_alive_secs)
    }

    pub fn temperature_refresh(&self) -> Duration {
        Duration::from_millis(self.temperature_refresh_ms)
    }

    pub fn speed_refresh(&self) -> Duration {
        Duration::from_millis(self.speed_refresh_ms)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    pub fn rgb_refresh(&self) -> Duration {
        Duration::from_millis(self.rgb_refresh_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_secs(self.connect_settle_secs)
    }

    pub fn hotplug_scan(&self) -> Duration {
        Duration::from_millis(self.hotplug_scan_ms)
    }

    pub fn software_mode_retry_delay(&self) -> Duration {
        Duration::from_millis(self.software_mode_retry_delay_ms)
    }
}
