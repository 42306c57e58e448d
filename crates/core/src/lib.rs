//! open-icue-core: wire protocol, device drivers and input synthesis for
//! CORSAIR and SCUF HID peripherals.
//!
//! Each supported device is moved out of its autonomous hardware mode into a
//! host-driven software mode and kept there: lighting frames, DPI, polling
//! rate, key remapping, macros, stick curves, fan speeds and the heartbeats
//! that stop the firmware from reverting.

pub mod analog;
pub mod comm;
pub mod config;
pub mod controller;
pub mod device;
pub mod dongle;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod input;
pub mod keyboard;
pub mod keymap;
pub mod lighting;
pub mod macros;
pub mod mouse;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod safety;
pub mod state;
pub mod ticker;
pub mod transport;

/// CORSAIR USB vendor id.
pub const CORSAIR_VID: u16 = 0x1b1c;
/// SCUF USB vendor id.
pub const SCUF_VID: u16 = 0x2e95;
