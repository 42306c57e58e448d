//! Device factory and the registry of running drivers.

use crate::controller::Controller;
use crate::device::{DiscoveredDevice, Product, ProductKind};
use crate::dongle::Dongle;
use crate::driver::{Device, DriverContext, Link};
use crate::error::Result;
use crate::hub::LinkHub;
use crate::keyboard::Keyboard;
use crate::mouse::Mouse;
use crate::transport::Transport;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CStr;
use tracing::{debug, info, warn};

/// Opened HID interfaces of one physical device.
#[derive(Debug, Clone)]
pub struct Ports {
    pub main: Transport,
    pub listener: Option<Transport>,
    pub analog: Option<Transport>,
}

/// Build the driver for a product without touching the device.
pub fn build_device(product: &'static Product, serial: &str, ports: Ports, ctx: DriverContext) -> Device {
    let Ports {
        main,
        listener,
        analog,
    } = ports;
    match product.kind {
        ProductKind::LinkHub => Device::LinkHub(LinkHub::new(main, serial, ctx)),
        ProductKind::Keyboard(model) => {
            Device::Keyboard(Keyboard::new(model, Link::wired(main), serial, listener, ctx))
        }
        ProductKind::Mouse(model) => {
            Device::Mouse(Mouse::new(model, Link::wired(main), serial, listener, ctx))
        }
        ProductKind::Controller => Device::Controller(Controller::new(
            Controller::wired_link(main),
            serial,
            analog,
            ctx,
        )),
        ProductKind::Dongle => Device::Dongle(Dongle::new(main, serial, listener, ctx)),
    }
}

fn open_path(api: &hidapi::HidApi, path: &CStr, product: &Product, role: &str) -> Result<Transport> {
    let handle = api.open_path(path)?;
    Ok(Transport::new(
        Box::new(handle),
        product.layout(),
        format!("{}:{role}", product.name),
    ))
}

/// Open every interface a discovered device needs.
pub fn open_ports(api: &hidapi::HidApi, found: &DiscoveredDevice) -> Result<Ports> {
    let product = found.product;
    let main = open_path(api, found.main_path()?, product, "main")?;
    let optional = |interface: Option<i32>, role: &str| -> Option<Transport> {
        let path = found.path(interface?)?;
        match open_path(api, path, product, role) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(product = product.name, role, error = %e, "Interface not opened");
                None
            }
        }
    };
    Ok(Ports {
        listener: optional(product.interfaces.listener, "listener"),
        analog: optional(product.interfaces.analog, "analog"),
        main,
    })
}

/// Serials that appeared or vanished between two bus scans.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HotplugDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl HotplugDiff {
    /// Compare the serials already handled with the ones a scan found.
    pub fn between(known: &BTreeSet<String>, present: &BTreeSet<String>) -> Self {
        Self {
            added: present.difference(known).cloned().collect(),
            removed: known.difference(present).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// All running drivers, keyed by serial.
#[derive(Debug, Default)]
pub struct Registry {
    devices: RwLock<BTreeMap<String, Device>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the driver's state machine and register it. A failed start leaves
    /// the device in its autonomous mode and nothing registered.
    pub fn start(&self, device: Device) -> Result<()> {
        let serial = device.serial();
        if let Err(e) = device.family().init() {
            warn!(kind = device.kind(), serial = %serial, error = %e, "Device failed to start");
            device.family().stop_dirty();
            return Err(e);
        }
        info!(kind = device.kind(), serial = %serial, state = %device.state(), "Device registered");
        if let Some(previous) = self.devices.write().insert(serial, device) {
            previous.family().stop_dirty();
        }
        Ok(())
    }

    pub fn get(&self, serial: &str) -> Option<Device> {
        self.devices.read().get(serial).cloned()
    }

    pub fn serials(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Drop an unplugged device. Its handle is gone, so the stop is dirty.
    pub fn remove(&self, serial: &str) -> Option<Device> {
        let device = self.devices.write().remove(serial)?;
        device.family().stop_dirty();
        debug!(serial, "Device removed");
        Some(device)
    }

    /// Stop every device cleanly, restoring hardware mode.
    pub fn stop_all(&self) {
        let devices = std::mem::take(&mut *self.devices.write());
        for (serial, device) in devices {
            debug!(serial = %serial, kind = device.kind(), "Stopping device");
            device.family().stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::device::product_for;
    use crate::input::NullSink;
    use crate::profile::MemoryProfileStore;
    use crate::state::DeviceState;
    use crate::transport::mock::{self, MockHandle};
    use crate::{CORSAIR_VID, SCUF_VID};
    use std::sync::Arc;

    fn ctx() -> DriverContext {
        DriverContext {
            sink: Arc::new(NullSink),
            config: Arc::new(DaemonConfig {
                software_mode_retries: 1,
                software_mode_retry_delay_ms: 1,
                ..DaemonConfig::default()
            }),
            profiles: Arc::new(MemoryProfileStore::new()),
        }
    }

    fn ports() -> (Ports, MockHandle) {
        let (main, handle) = mock::transport();
        (
            Ports {
                main,
                listener: None,
                analog: None,
            },
            handle,
        )
    }

    #[test]
    fn factory_picks_the_family() {
        let cases = [
            (CORSAIR_VID, 0x0c3f, "link-hub"),
            (CORSAIR_VID, 0x2b10, "keyboard"),
            (CORSAIR_VID, 0x1b5d, "mouse"),
            (SCUF_VID, 0x3a05, "controller"),
            (CORSAIR_VID, 0x1bdc, "dongle"),
        ];
        for (vid, pid, kind) in cases {
            let product = product_for(vid, pid).unwrap();
            let device = build_device(product, "S", ports().0, ctx());
            assert_eq!(device.kind(), kind);
            assert_eq!(device.serial(), "S");
            assert_eq!(device.state(), DeviceState::Offline);
        }
    }

    #[test]
    fn failed_start_registers_nothing() {
        let (ports, handle) = ports();
        handle.fail_writes(true);
        let product = product_for(CORSAIR_VID, 0x1b9e).unwrap();
        let registry = Registry::new();
        assert!(registry.start(build_device(product, "M1", ports, ctx())).is_err());
        assert!(registry.is_empty());
    }

    fn serials(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hotplug_diff_reports_arrivals_and_departures() {
        let diff = HotplugDiff::between(&serials(&["A", "B"]), &serials(&["B", "C", "D"]));
        assert_eq!(diff.added, vec!["C".to_string(), "D".to_string()]);
        assert_eq!(diff.removed, vec!["A".to_string()]);

        let unchanged = HotplugDiff::between(&serials(&["A"]), &serials(&["A"]));
        assert!(unchanged.is_empty());
        assert_eq!(HotplugDiff::between(&serials(&[]), &serials(&[])), HotplugDiff::default());
    }

    #[test]
    fn unplugged_device_is_removed_without_restoring_hardware_mode() {
        let (ports, handle) = ports();
        let product = product_for(CORSAIR_VID, 0x1b9e).unwrap();
        let registry = Registry::new();
        registry
            .start(build_device(product, "M1", ports, ctx()))
            .unwrap();

        let known: BTreeSet<String> = registry.serials().into_iter().collect();
        let diff = HotplugDiff::between(&known, &BTreeSet::new());
        assert_eq!(diff.removed, vec!["M1".to_string()]);
        for serial in &diff.removed {
            assert!(registry.remove(serial).is_some());
        }

        assert!(registry.is_empty());
        assert!(registry.remove("M1").is_none());
        assert!(handle.writes_to(crate::protocol::cmd::HARDWARE_MODE).is_empty());
    }

    #[test]
    fn mouse_starts_registers_and_stops_cleanly() {
        let (ports, handle) = ports();
        let product = product_for(CORSAIR_VID, 0x1b9e).unwrap();
        let registry = Registry::new();
        registry
            .start(build_device(product, "M1", ports, ctx()))
            .unwrap();
        assert_eq!(registry.serials(), vec!["M1".to_string()]);
        assert_eq!(registry.get("M1").unwrap().state(), DeviceState::Ready);

        registry.stop_all();
        assert!(registry.is_empty());
        let writes = handle.writes();
        assert_eq!(&writes.last().unwrap()[2..6], crate::protocol::cmd::HARDWARE_MODE);
    }
}
