//! Device profiles and the store that supplies them.
//!
//! Profiles are produced elsewhere (an editor, a UI) and only read here. The
//! on-disk layout under the profile directory is:
//!
//! - `profiles/<serial>.json`: [`DeviceProfile`]
//! - `keymaps/<hash>.json`: [`KeyMapFile`]
//! - `macros/<id>.json`: [`Macro`]

use crate::analog::AnalogConfig;
use crate::error::{Error, Result};
use crate::keymap::{KeyMap, PerformanceFlags};
use crate::lighting::{EffectParams, KeyboardEffect, Rgb};
use crate::macros::Macro;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-device settings, keyed by serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub brightness: u8,
    pub rgb_profile: String,
    /// Static colour used by the built-in frame source.
    pub color: Rgb,
    /// Per-zone or per-channel colours.
    pub zone_colors: BTreeMap<u8, Rgb>,
    /// Firmware effect for per-key keyboards.
    pub effect: Option<KeyboardEffect>,
    pub effect_params: EffectParams,
    pub dpi_stages: Vec<u16>,
    pub active_dpi_stage: usize,
    pub sniper_dpi: u16,
    pub polling_rate: u16,
    pub sleep_minutes: u32,
    pub key_assignment_hash: Option<String>,
    pub performance: PerformanceFlags,
    pub vibration_left: u8,
    pub vibration_right: u8,
    pub analog: AnalogConfig,
    /// Hub channel speeds (channel id -> percent), overriding the daemon defaults.
    pub channel_speeds: BTreeMap<u8, u8>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            brightness: 100,
            rgb_profile: "static".into(),
            color: Rgb::new(255, 255, 255),
            zone_colors: BTreeMap::new(),
            effect: None,
            effect_params: EffectParams::default(),
            dpi_stages: vec![400, 800, 1200, 1600, 3200],
            active_dpi_stage: 1,
            sniper_dpi: 200,
            polling_rate: 1000,
            sleep_minutes: 15,
            key_assignment_hash: None,
            performance: PerformanceFlags::default(),
            vibration_left: 50,
            vibration_right: 50,
            analog: AnalogConfig::default(),
            channel_speeds: BTreeMap::new(),
        }
    }
}

/// A stored key-assignment table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapFile {
    #[serde(default)]
    pub name: String,
    pub keys: KeyMap,
}

/// Read-only source of profiles.
pub trait ProfileStore: Send + Sync {
    fn device_profile(&self, serial: &str) -> Result<Option<DeviceProfile>>;
    fn key_map(&self, hash: &str) -> Result<Option<KeyMap>>;
    fn macros(&self) -> Result<Vec<Macro>>;
}

/// Load a device profile, falling back to defaults on absence or error.
pub fn profile_or_default(store: &dyn ProfileStore, serial: &str) -> DeviceProfile {
    match store.device_profile(serial) {
        Ok(Some(p)) => p,
        Ok(None) => {
            debug!(serial, "No stored profile, using defaults");
            DeviceProfile::default()
        }
        Err(e) => {
            warn!(serial, error = %e, "Profile unreadable, using defaults");
            DeviceProfile::default()
        }
    }
}

/// JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    root: PathBuf,
}

impl JsonProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read<T: serde::de::DeserializeOwned>(&self, dir: &str, name: &str) -> Result<Option<T>> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::Profile(format!("invalid file name: {name:?}")));
        }
        let path = self.root.join(dir).join(format!("{name}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let value = serde_json::from_str(&text)
            .map_err(|e| Error::Profile(format!("{}: {e}", path.display())))?;
        Ok(Some(value))
    }
}

impl ProfileStore for JsonProfileStore {
    fn device_profile(&self, serial: &str) -> Result<Option<DeviceProfile>> {
        self.read("profiles", serial)
    }

    fn key_map(&self, hash: &str) -> Result<Option<KeyMap>> {
        Ok(self.read::<KeyMapFile>("keymaps", hash)?.map(|f| f.keys))
    }

    fn macros(&self) -> Result<Vec<Macro>> {
        let dir = self.root.join("macros");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut macros = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Macro>(&text) {
                Ok(m) => macros.push(m),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable macro"),
            }
        }
        macros.sort_by_key(|m| m.id);
        Ok(macros)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, DeviceProfile>>,
    key_maps: RwLock<HashMap<String, KeyMap>>,
    macros: RwLock<Vec<Macro>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_profile(&self, serial: &str, profile: DeviceProfile) {
        self.profiles.write().insert(serial.to_string(), profile);
    }

    pub fn insert_key_map(&self, hash: &str, map: KeyMap) {
        self.key_maps.write().insert(hash.to_string(), map);
    }

    pub fn insert_macro(&self, m: Macro) {
        self.macros.write().push(m);
    }
}

impl ProfileStore for MemoryProfileStore {
    fn device_profile(&self, serial: &str) -> Result<Option<DeviceProfile>> {
        Ok(self.profiles.read().get(serial).cloned())
    }

    fn key_map(&self, hash: &str) -> Result<Option<KeyMap>> {
        Ok(self.key_maps.read().get(hash).cloned())
    }

    fn macros(&self) -> Result<Vec<Macro>> {
        Ok(self.macros.read().clone())
    }
}
