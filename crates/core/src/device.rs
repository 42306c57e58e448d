//! Product table and HID discovery.

use crate::error::{Error, Result};
use crate::keyboard::{self, KeyboardModel};
use crate::mouse::{self, MouseModel};
use crate::protocol::ReportLayout;
use crate::{controller, CORSAIR_VID, SCUF_VID};
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use tracing::debug;

/// Which driver a product gets.
#[derive(Debug, Clone, Copy)]
pub enum ProductKind {
    LinkHub,
    Keyboard(&'static KeyboardModel),
    Mouse(&'static MouseModel),
    Controller,
    Dongle,
}

/// HID interface numbers a product exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interfaces {
    /// Command interface.
    pub main: i32,
    /// Unsolicited input reports.
    pub listener: Option<i32>,
    /// Controller stick reports and vibration previews.
    pub analog: Option<i32>,
}

/// A supported USB product.
#[derive(Debug, Clone, Copy)]
pub struct Product {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
    pub kind: ProductKind,
    pub interfaces: Interfaces,
}

impl Product {
    pub fn layout(&self) -> ReportLayout {
        match self.kind {
            ProductKind::LinkHub => ReportLayout::LINK_HUB,
            _ => ReportLayout::STANDARD,
        }
    }

    /// Short family name for logs and listings.
    pub fn family(&self) -> &'static str {
        match self.kind {
            ProductKind::LinkHub => "link-hub",
            ProductKind::Keyboard(_) => "keyboard",
            ProductKind::Mouse(_) => "mouse",
            ProductKind::Controller => "controller",
            ProductKind::Dongle => "dongle",
        }
    }
}

const WIRED_INPUT: Interfaces = Interfaces {
    main: 1,
    listener: Some(2),
    analog: None,
};

pub static PRODUCTS: [Product; 7] = [
    Product {
        vid: CORSAIR_VID,
        pid: 0x0c3f,
        name: "iCUE LINK System Hub",
        kind: ProductKind::LinkHub,
        interfaces: Interfaces {
            main: 0,
            listener: None,
            analog: None,
        },
    },
    Product {
        vid: CORSAIR_VID,
        pid: 0x2b10,
        name: "K65 PLUS WIRELESS",
        kind: ProductKind::Keyboard(&keyboard::K65_PLUS),
        interfaces: WIRED_INPUT,
    },
    Product {
        vid: CORSAIR_VID,
        pid: 0x1bb4,
        name: "K70 PRO MINI WIRELESS",
        kind: ProductKind::Keyboard(&keyboard::K70_PRO_MINI),
        interfaces: WIRED_INPUT,
    },
    Product {
        vid: CORSAIR_VID,
        pid: 0x1b9e,
        name: "M65 RGB ULTRA",
        kind: ProductKind::Mouse(&mouse::M65_RGB_ULTRA),
        interfaces: WIRED_INPUT,
    },
    Product {
        vid: CORSAIR_VID,
        pid: 0x1b5d,
        name: "IRONCLAW RGB",
        kind: ProductKind::Mouse(&mouse::IRONCLAW_RGB),
        interfaces: WIRED_INPUT,
    },
    Product {
        vid: SCUF_VID,
        pid: controller::PID,
        name: controller::PRODUCT_NAME,
        kind: ProductKind::Controller,
        interfaces: Interfaces {
            main: 1,
            listener: None,
            analog: Some(3),
        },
    },
    Product {
        vid: CORSAIR_VID,
        pid: 0x1bdc,
        name: "SLIPSTREAM WIRELESS USB Receiver",
        kind: ProductKind::Dongle,
        interfaces: WIRED_INPUT,
    },
];

pub fn product_for(vid: u16, pid: u16) -> Option<&'static Product> {
    PRODUCTS.iter().find(|p| p.vid == vid && p.pid == pid)
}

/// One physical device: all of its HID interfaces, grouped by serial.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub product: &'static Product,
    pub serial: String,
    paths: BTreeMap<i32, CString>,
}

impl DiscoveredDevice {
    pub fn path(&self, interface: i32) -> Option<&CStr> {
        self.paths.get(&interface).map(CString::as_c_str)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = i32> + '_ {
        self.paths.keys().copied()
    }

    /// Path of the command interface, required to drive the device.
    pub fn main_path(&self) -> Result<&CStr> {
        self.path(self.product.interfaces.main).ok_or_else(|| {
            Error::DeviceNotFound(format!(
                "{} {}: interface {} missing",
                self.product.name, self.serial, self.product.interfaces.main
            ))
        })
    }
}

/// Enumerate supported CORSAIR and SCUF devices.
pub fn discover(api: &hidapi::HidApi) -> Vec<DiscoveredDevice> {
    debug!("Starting HID device enumeration");
    let mut found: BTreeMap<(u16, u16, String), DiscoveredDevice> = BTreeMap::new();

    for info in api.device_list() {
        if info.vendor_id() != CORSAIR_VID && info.vendor_id() != SCUF_VID {
            continue;
        }
        let Some(product) = product_for(info.vendor_id(), info.product_id()) else {
            continue;
        };
        let serial = info
            .serial_number()
            .filter(|s| !s.is_empty())
            .map_or_else(|| info.path().to_string_lossy().into_owned(), str::to_string);

        let entry = found
            .entry((product.vid, product.pid, serial.clone()))
            .or_insert_with(|| DiscoveredDevice {
                product,
                serial,
                paths: BTreeMap::new(),
            });
        entry
            .paths
            .insert(info.interface_number(), info.path().to_owned());
    }

    let devices: Vec<DiscoveredDevice> = found.into_values().collect();
    for d in &devices {
        debug!(
            product = d.product.name,
            vid = format_args!("0x{:04X}", d.product.vid),
            pid = format_args!("0x{:04X}", d.product.pid),
            serial = %d.serial,
            interfaces = d.paths.len(),
            "Found device"
        );
    }
    debug!(count = devices.len(), "Device enumeration complete");
    devices
}
