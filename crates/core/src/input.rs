//! Virtual input devices backed by the kernel uinput node.
//!
//! The daemon creates one virtual keyboard and one virtual mouse at start-up.
//! Key mapping, macro playback and the analog path write synthetic events
//! through the [`InputSink`] trait; every primitive ends with a `SYN_REPORT`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::{mem, slice};
use tracing::{debug, info, warn};

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const SYN_REPORT: u16 = 0x00;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;

const UI_SET_EVBIT: u64 = 0x4004_5564;
const UI_SET_KEYBIT: u64 = 0x4004_5565;
const UI_SET_RELBIT: u64 = 0x4004_5566;
const UI_DEV_CREATE: u64 = 0x5501;
const UI_DEV_DESTROY: u64 = 0x5502;

const BUS_USB: u16 = 0x03;
const BUS_VIRTUAL: u16 = 0x06;

/// Default uinput node.
pub const UINPUT_PATH: &str = "/dev/uinput";

/// Linux key and button codes used by the mapping engine.
pub mod keys {
    pub const KEY_ESC: u16 = 1;
    pub const KEY_1: u16 = 2;
    pub const KEY_0: u16 = 11;
    pub const KEY_MINUS: u16 = 12;
    pub const KEY_EQUAL: u16 = 13;
    pub const KEY_BACKSPACE: u16 = 14;
    pub const KEY_TAB: u16 = 15;
    pub const KEY_Q: u16 = 16;
    pub const KEY_LEFTBRACE: u16 = 26;
    pub const KEY_RIGHTBRACE: u16 = 27;
    pub const KEY_ENTER: u16 = 28;
    pub const KEY_LEFTCTRL: u16 = 29;
    pub const KEY_A: u16 = 30;
    pub const KEY_SEMICOLON: u16 = 39;
    pub const KEY_APOSTROPHE: u16 = 40;
    pub const KEY_GRAVE: u16 = 41;
    pub const KEY_LEFTSHIFT: u16 = 42;
    pub const KEY_BACKSLASH: u16 = 43;
    pub const KEY_Z: u16 = 44;
    pub const KEY_B: u16 = 48;
    pub const KEY_COMMA: u16 = 51;
    pub const KEY_DOT: u16 = 52;
    pub const KEY_SLASH: u16 = 53;
    pub const KEY_LEFTALT: u16 = 56;
    pub const KEY_SPACE: u16 = 57;
    pub const KEY_F1: u16 = 59;
    pub const KEY_F4: u16 = 62;
    pub const KEY_MUTE: u16 = 113;
    pub const KEY_VOLUMEDOWN: u16 = 114;
    pub const KEY_VOLUMEUP: u16 = 115;
    pub const KEY_LEFTMETA: u16 = 125;
    pub const KEY_NEXTSONG: u16 = 163;
    pub const KEY_PLAYPAUSE: u16 = 164;
    pub const KEY_PREVIOUSSONG: u16 = 165;
    pub const KEY_STOPCD: u16 = 166;

    pub const BTN_LEFT: u16 = 0x110;
    pub const BTN_RIGHT: u16 = 0x111;
    pub const BTN_MIDDLE: u16 = 0x112;
    pub const BTN_SIDE: u16 = 0x113;
    pub const BTN_EXTRA: u16 = 0x114;
    pub const BTN_FORWARD: u16 = 0x115;
    pub const BTN_BACK: u16 = 0x116;
    pub const BTN_TASK: u16 = 0x117;
}

/// How a key or button event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMotion {
    Press,
    Release,
    /// Press immediately followed by release.
    OneShot,
}

/// Destination for synthetic input events.
pub trait InputSink: Send + Sync {
    fn emit_key(&self, code: u16, motion: KeyMotion) -> Result<()>;
    fn emit_mouse_button(&self, code: u16, motion: KeyMotion) -> Result<()>;
    fn emit_mouse_move(&self, dx: i32, dy: i32) -> Result<()>;
    fn emit_mouse_wheel(&self, delta: i32) -> Result<()>;
}

/// Map a character to `(key code, needs shift)` on a US layout.
pub fn char_to_key(c: char) -> Option<(u16, bool)> {
    const ROWS: [(&str, u16); 3] = [("qwertyuiop", 16), ("asdfghjkl", 30), ("zxcvbnm", 44)];
    for (row, base) in ROWS {
        if let Some(i) = row.find(c.to_ascii_lowercase()) {
            return Some((base + i as u16, c.is_ascii_uppercase()));
        }
    }

    let plain = match c {
        '1'..='9' => Some(keys::KEY_1 + (c as u16 - '1' as u16)),
        '0' => Some(keys::KEY_0),
        ' ' => Some(keys::KEY_SPACE),
        '-' => Some(keys::KEY_MINUS),
        '=' => Some(keys::KEY_EQUAL),
        '[' => Some(keys::KEY_LEFTBRACE),
        ']' => Some(keys::KEY_RIGHTBRACE),
        '\\' => Some(keys::KEY_BACKSLASH),
        ';' => Some(keys::KEY_SEMICOLON),
        '\'' => Some(keys::KEY_APOSTROPHE),
        '`' => Some(keys::KEY_GRAVE),
        ',' => Some(keys::KEY_COMMA),
        '.' => Some(keys::KEY_DOT),
        '/' => Some(keys::KEY_SLASH),
        '\n' => Some(keys::KEY_ENTER),
        '\t' => Some(keys::KEY_TAB),
        _ => None,
    };
    if let Some(code) = plain {
        return Some((code, false));
    }

    let shifted = match c {
        '!' => keys::KEY_1,
        '@' => keys::KEY_1 + 1,
        '#' => keys::KEY_1 + 2,
        '$' => keys::KEY_1 + 3,
        '%' => keys::KEY_1 + 4,
        '^' => keys::KEY_1 + 5,
        '&' => keys::KEY_1 + 6,
        '*' => keys::KEY_1 + 7,
        '(' => keys::KEY_1 + 8,
        ')' => keys::KEY_0,
        '_' => keys::KEY_MINUS,
        '+' => keys::KEY_EQUAL,
        '{' => keys::KEY_LEFTBRACE,
        '}' => keys::KEY_RIGHTBRACE,
        '|' => keys::KEY_BACKSLASH,
        ':' => keys::KEY_SEMICOLON,
        '"' => keys::KEY_APOSTROPHE,
        '~' => keys::KEY_GRAVE,
        '<' => keys::KEY_COMMA,
        '>' => keys::KEY_DOT,
        '?' => keys::KEY_SLASH,
        _ => return None,
    };
    Some((shifted, true))
}

/// Type a string as press/release pairs, wrapping shifted characters in Shift.
pub fn type_text(sink: &dyn InputSink, text: &str) -> Result<()> {
    for c in text.chars() {
        let Some((code, shift)) = char_to_key(c) else {
            debug!(character = ?c, "No key for character, skipping");
            continue;
        };
        if shift {
            sink.emit_key(keys::KEY_LEFTSHIFT, KeyMotion::Press)?;
        }
        sink.emit_key(code, KeyMotion::OneShot)?;
        if shift {
            sink.emit_key(keys::KEY_LEFTSHIFT, KeyMotion::Release)?;
        }
    }
    Ok(())
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawInputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

/// Which capabilities a virtual device registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Keyboard,
    Mouse,
}

/// One kernel virtual input device.
pub struct UinputDevice {
    name: String,
    file: Mutex<File>,
}

impl std::fmt::Debug for UinputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UinputDevice").field("name", &self.name).finish()
    }
}

fn ioctl_arg(fd: libc::c_int, request: u64, arg: u16) -> Result<()> {
    // SAFETY: fd is an open uinput descriptor and the request takes an int.
    let rc = unsafe { libc::ioctl(fd, request as _, arg as libc::c_int) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn as_bytes<T>(value: &T) -> &[u8] {
    // SAFETY: T is a repr(C) plain-old-data struct.
    unsafe { slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

impl UinputDevice {
    /// Register a virtual device on `node`.
    pub fn create(node: &Path, name: &str, role: DeviceRole, vendor: u16) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(node)
            .map_err(|e| Error::Fatal(format!("open {}: {e}", node.display())))?;
        let fd = file.as_raw_fd();

        ioctl_arg(fd, UI_SET_EVBIT, EV_SYN)?;
        ioctl_arg(fd, UI_SET_EVBIT, EV_KEY)?;
        match role {
            DeviceRole::Keyboard => {
                for code in 1..256u16 {
                    if ioctl_arg(fd, UI_SET_KEYBIT, code).is_err() {
                        warn!(code, "Failed to enable key code");
                    }
                }
            }
            DeviceRole::Mouse => {
                ioctl_arg(fd, UI_SET_EVBIT, EV_REL)?;
                for rel in [REL_X, REL_Y, REL_WHEEL] {
                    ioctl_arg(fd, UI_SET_RELBIT, rel)?;
                }
                for code in keys::BTN_LEFT..=keys::BTN_TASK {
                    ioctl_arg(fd, UI_SET_KEYBIT, code)?;
                }
            }
        }

        // SAFETY: all-zero is a valid UinputUserDev.
        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        let bytes = name.as_bytes();
        let len = bytes.len().min(dev.name.len() - 1);
        dev.name[..len].copy_from_slice(&bytes[..len]);
        dev.id = InputId {
            bustype: match role {
                DeviceRole::Keyboard => BUS_VIRTUAL,
                DeviceRole::Mouse => BUS_USB,
            },
            vendor,
            product: match role {
                DeviceRole::Keyboard => 0x0001,
                DeviceRole::Mouse => 0x0002,
            },
            version: 1,
        };
        file.write_all(as_bytes(&dev))
            .map_err(|e| Error::Fatal(format!("uinput setup {name}: {e}")))?;

        // SAFETY: request takes no argument.
        if unsafe { libc::ioctl(fd, UI_DEV_CREATE as _) } < 0 {
            return Err(Error::Fatal(format!(
                "uinput create {name}: {}",
                std::io::Error::last_os_error()
            )));
        }

        info!(device = name, "Virtual input device created");
        Ok(Self {
            name: name.to_string(),
            file: Mutex::new(file),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write a batch of `(type, code, value)` events followed by `SYN_REPORT`.
    fn emit(&self, events: &[(u16, u16, i32)]) -> Result<()> {
        let mut file = self.file.lock();
        for &(type_, code, value) in events.iter().chain(&[(EV_SYN, SYN_REPORT, 0)]) {
            let event = RawInputEvent {
                time: libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                },
                type_,
                code,
                value,
            };
            file.write_all(as_bytes(&event))?;
        }
        Ok(())
    }

    fn emit_button(&self, code: u16, motion: KeyMotion) -> Result<()> {
        match motion {
            KeyMotion::Press => self.emit(&[(EV_KEY, code, 1)]),
            KeyMotion::Release => self.emit(&[(EV_KEY, code, 0)]),
            KeyMotion::OneShot => {
                self.emit(&[(EV_KEY, code, 1)])?;
                self.emit(&[(EV_KEY, code, 0)])
            }
        }
    }
}

impl Drop for UinputDevice {
    fn drop(&mut self) {
        let fd = self.file.get_mut().as_raw_fd();
        // SAFETY: fd is still open; File closes it afterwards.
        if unsafe { libc::ioctl(fd, UI_DEV_DESTROY as _) } < 0 {
            warn!(device = %self.name, "uinput destroy failed");
        } else {
            debug!(device = %self.name, "Virtual input device destroyed");
        }
    }
}

/// The daemon's virtual keyboard and mouse pair.
#[derive(Debug)]
pub struct VirtualInput {
    keyboard: UinputDevice,
    mouse: UinputDevice,
}

impl VirtualInput {
    /// Create both devices. Failure is fatal for the daemon.
    pub fn create(node: &Path, product: &str, vendor: u16) -> Result<Self> {
        let keyboard = UinputDevice::create(
            node,
            &format!("{product} Virtual Keyboard"),
            DeviceRole::Keyboard,
            vendor,
        )?;
        let mouse = UinputDevice::create(node, "Virtual Mouse", DeviceRole::Mouse, vendor)?;
        Ok(Self { keyboard, mouse })
    }
}

impl InputSink for VirtualInput {
    fn emit_key(&self, code: u16, motion: KeyMotion) -> Result<()> {
        self.keyboard.emit_button(code, motion)
    }

    fn emit_mouse_button(&self, code: u16, motion: KeyMotion) -> Result<()> {
        self.mouse.emit_button(code, motion)
    }

    fn emit_mouse_move(&self, dx: i32, dy: i32) -> Result<()> {
        let mut events = Vec::with_capacity(2);
        if dx != 0 {
            events.push((EV_REL, REL_X, dx));
        }
        if dy != 0 {
            events.push((EV_REL, REL_Y, dy));
        }
        if events.is_empty() {
            return Ok(());
        }
        self.mouse.emit(&events)
    }

    fn emit_mouse_wheel(&self, delta: i32) -> Result<()> {
        self.mouse.emit(&[(EV_REL, REL_WHEEL, delta)])
    }
}

/// A sink that drops every event (uinput disabled).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl InputSink for NullSink {
    fn emit_key(&self, _code: u16, _motion: KeyMotion) -> Result<()> {
        Ok(())
    }
    fn emit_mouse_button(&self, _code: u16, _motion: KeyMotion) -> Result<()> {
        Ok(())
    }
    fn emit_mouse_move(&self, _dx: i32, _dy: i32) -> Result<()> {
        Ok(())
    }
    fn emit_mouse_wheel(&self, _delta: i32) -> Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{Emitted, RecordingSink};
    use super::*;

    #[test]
    fn letters_follow_qwerty_rows() {
        assert_eq!(char_to_key('q'), Some((keys::KEY_Q, false)));
        assert_eq!(char_to_key('a'), Some((keys::KEY_A, false)));
        assert_eq!(char_to_key('B'), Some((keys::KEY_B, true)));
        assert_eq!(char_to_key('m'), Some((50, false)));
    }

    #[test]
    fn digits_and_symbols() {
        assert_eq!(char_to_key('1'), Some((2, false)));
        assert_eq!(char_to_key('9'), Some((10, false)));
        assert_eq!(char_to_key('0'), Some((11, false)));
        assert_eq!(char_to_key('!'), Some((2, true)));
        assert_eq!(char_to_key('?'), Some((keys::KEY_SLASH, true)));
        assert_eq!(char_to_key('é'), None);
    }

    #[test]
    fn type_text_wraps_uppercase_in_shift() {
        let sink = RecordingSink::new();
        type_text(&sink, "Hi").unwrap();
        assert_eq!(
            sink.events(),
            vec![
                Emitted::Key(keys::KEY_LEFTSHIFT, KeyMotion::Press),
                Emitted::Key(35, KeyMotion::OneShot),
                Emitted::Key(keys::KEY_LEFTSHIFT, KeyMotion::Release),
                Emitted::Key(23, KeyMotion::OneShot),
            ]
        );
    }

    #[test]
    fn uinput_structs_match_kernel_layout() {
        assert_eq!(mem::size_of::<InputId>(), 8);
        assert_eq!(mem::size_of::<UinputUserDev>(), 80 + 8 + 4 + 4 * 64 * 4);
    }

    #[test]
    fn missing_uinput_node_is_fatal() {
        let err = VirtualInput::create(Path::new("/nonexistent/uinput"), "CORSAIR", 0x1b1c)
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
