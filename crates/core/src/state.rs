//! Device lifecycle state and the flags shared with background tasks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Per-device lifecycle.
///
/// `OFFLINE -> OPENING -> SOFTWARE_MODE -> IDENTIFIED -> READY -> STOPPING
/// -> HARDWARE_MODE -> CLOSED`. A dirty stop skips `HARDWARE_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum DeviceState {
    Offline,
    Opening,
    SoftwareMode,
    Identified,
    Ready,
    Stopping,
    HardwareMode,
    Closed,
}

impl DeviceState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        match (self, next) {
            (Offline, Opening)
            | (Opening, SoftwareMode)
            | (SoftwareMode, Identified)
            | (Identified, Ready)
            | (Stopping, HardwareMode)
            | (Stopping, Closed)
            | (HardwareMode, Closed) => true,
            // Re-arm after wake or a wireless reconnect.
            (Ready, SoftwareMode) | (Ready, Opening) | (Closed, Opening) | (Offline, Offline) => {
                true
            }
            // Any live state may begin stopping.
            (s, Stopping) => s != Closed && s != Stopping,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Offline => "OFFLINE",
            Self::Opening => "OPENING",
            Self::SoftwareMode => "SOFTWARE_MODE",
            Self::Identified => "IDENTIFIED",
            Self::Ready => "READY",
            Self::Stopping => "STOPPING",
            Self::HardwareMode => "HARDWARE_MODE",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Monotonic exit flag: once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle bookkeeping shared by a driver and its background threads.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    exit: ExitFlag,
    connected: AtomicBool,
    state: Mutex<DeviceState>,
    battery: AtomicU8,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit: ExitFlag::new(),
            connected: AtomicBool::new(true),
            state: Mutex::new(DeviceState::Offline),
            battery: AtomicU8::new(0),
        }
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.exit.clone()
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.is_set()
    }

    pub fn request_exit(&self) {
        self.exit.set();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            debug!(device = %self.name, connected, "Connection state changed");
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Move to `next`. Illegal transitions are logged and still applied;
    /// the state is informational and never gates I/O on its own.
    pub fn advance(&self, next: DeviceState) {
        let mut state = self.state.lock();
        if !state.can_advance_to(next) {
            debug!(device = %self.name, from = %*state, to = %next, "Unusual state transition");
        } else {
            debug!(device = %self.name, from = %*state, to = %next, "State transition");
        }
        *state = next;
    }

    pub fn battery_level(&self) -> u8 {
        self.battery.load(Ordering::SeqCst)
    }

    pub fn set_battery_level(&self, level: u8) {
        self.battery.store(level.min(100), Ordering::SeqCst);
    }
}
