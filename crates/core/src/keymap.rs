//! Key/button mapping engine.
//!
//! Button reports carry a pressed-key bitmap, a modifier byte and an FN byte.
//! The engine XORs each bitmap against the previous one, looks up every
//! transition bit in the active [`KeyMap`] and emits synthetic input or
//! plays a macro. Actions that need the device itself (DPI stages, FN chords)
//! are returned to the driver as [`DeviceRequest`]s.
//!
//! Key maps are read-copy-update: edits clone the map, mutate the clone and
//! swap the `Arc`, so the listener always sees a whole map.

use crate::endpoint::{self, Address};
use crate::error::{Error, Result};
use crate::input::{keys, InputSink, KeyMotion};
use crate::macros::{Macro, MacroPlayer, MacroTracker};
use crate::protocol::{cmd, data_types, endpoints};
use crate::state::ExitFlag;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Report type byte of a button bitmap report.
pub const BUTTON_REPORT: u8 = 0x02;

/// Action kinds stored in key maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionKind {
    None = 0,
    Media = 1,
    DpiUp = 2,
    Keyboard = 3,
    DpiDown = 4,
    /// Command 1 scrolls up, 2 scrolls down.
    Scroll = 5,
    /// Ctrl + wheel; command as for `Scroll`.
    Zoom = 6,
    Sniper = 8,
    Mouse = 9,
    Macro = 10,
}

impl ActionKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Media),
            2 => Some(Self::DpiUp),
            3 => Some(Self::Keyboard),
            4 => Some(Self::DpiDown),
            5 => Some(Self::Scroll),
            6 => Some(Self::Zoom),
            8 => Some(Self::Sniper),
            9 => Some(Self::Mouse),
            10 => Some(Self::Macro),
            _ => None,
        }
    }
}

/// One physical button's assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAssignment {
    pub name: String,
    /// Handled natively by the firmware.
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub action_type: u8,
    #[serde(default)]
    pub action_command: u16,
    #[serde(default)]
    pub action_hold: bool,
    #[serde(default)]
    pub modifier_key: u8,
    #[serde(default)]
    pub retain_original: bool,
    pub button_index: u8,
}

impl KeyAssignment {
    /// A natively handled key.
    pub fn native(name: &str, button_index: u8) -> Self {
        Self {
            name: name.to_string(),
            default: true,
            action_type: ActionKind::None as u8,
            action_command: 0,
            action_hold: false,
            modifier_key: 0,
            retain_original: false,
            button_index,
        }
    }

    /// A host-handled key with the given action.
    pub fn mapped(name: &str, button_index: u8, kind: ActionKind, command: u16) -> Self {
        Self {
            default: false,
            action_type: kind as u8,
            action_command: command,
            ..Self::native(name, button_index)
        }
    }

    pub fn with_hold(mut self, hold: bool) -> Self {
        self.action_hold = hold;
        self
    }

    pub fn kind(&self) -> ActionKind {
        ActionKind::from_code(self.action_type).unwrap_or(ActionKind::None)
    }

    /// Firmware record value: 0x01 for native keys, otherwise the shifted modifier.
    fn record_value(&self) -> u8 {
        if self.default {
            0x01
        } else {
            self.modifier_key << 1
        }
    }
}

/// Assignments keyed by hardware bitmask.
pub type KeyMap = BTreeMap<u64, KeyAssignment>;

/// A key map shared between the listener and profile edits.
#[derive(Debug, Default)]
pub struct SharedKeyMap {
    current: RwLock<Arc<KeyMap>>,
}

impl SharedKeyMap {
    pub fn new(map: KeyMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(map)),
        }
    }

    /// Snapshot of the current map.
    pub fn load(&self) -> Arc<KeyMap> {
        Arc::clone(&self.current.read())
    }

    pub fn replace(&self, map: KeyMap) {
        *self.current.write() = Arc::new(map);
    }

    /// Clone, edit and swap. Returns the new snapshot.
    pub fn update(&self, edit: impl FnOnce(&mut KeyMap)) -> Arc<KeyMap> {
        let mut guard = self.current.write();
        let mut next = KeyMap::clone(&guard);
        edit(&mut next);
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        next
    }
}

/// Macros available to the mapping engine, by id.
#[derive(Debug, Default)]
pub struct MacroLibrary {
    macros: RwLock<Arc<HashMap<u16, Macro>>>,
}

impl MacroLibrary {
    pub fn new(macros: impl IntoIterator<Item = Macro>) -> Self {
        let map = macros.into_iter().map(|m| (m.id, m)).collect();
        Self {
            macros: RwLock::new(Arc::new(map)),
        }
    }

    pub fn get(&self, id: u16) -> Option<Macro> {
        self.macros.read().get(&id).cloned()
    }

    pub fn insert(&self, m: Macro) {
        let mut guard = self.macros.write();
        let mut next = HashMap::clone(&guard);
        next.insert(m.id, m);
        *guard = Arc::new(next);
    }
}

/// Where the fields of a button report live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLayout {
    /// Bitmap bytes (at most 8).
    pub bitmap: Range<usize>,
    /// Interpret the bitmap big-endian.
    pub reverse: bool,
    pub modifier: Option<usize>,
    pub fn_byte: Option<usize>,
}

/// Decoded button report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonReport {
    pub bitmap: u64,
    pub modifier: u8,
    pub fn_pressed: bool,
}

impl InputLayout {
    /// Decode a button report; other report types yield `None`.
    pub fn decode(&self, data: &[u8]) -> Option<ButtonReport> {
        if data.get(1) != Some(&BUTTON_REPORT) {
            return None;
        }
        let bytes = data.get(self.bitmap.clone())?;
        if bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        let bitmap = if self.reverse {
            buf[8 - bytes.len()..].copy_from_slice(bytes);
            u64::from_be_bytes(buf)
        } else {
            buf[..bytes.len()].copy_from_slice(bytes);
            u64::from_le_bytes(buf)
        };
        Some(ButtonReport {
            bitmap,
            modifier: self.modifier.and_then(|i| data.get(i).copied()).unwrap_or(0),
            fn_pressed: self
                .fn_byte
                .and_then(|i| data.get(i).copied())
                .is_some_and(|b| b != 0),
        })
    }
}

/// Keyboard FN chords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FnChord {
    BrightnessUp,
    BrightnessDown,
    ProfileSwitch,
    PerformanceLock,
    BluetoothSwitch,
}

/// Work the mapping engine hands back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    DpiUp,
    DpiDown,
    /// Sniper held (`true`) or released.
    Sniper(bool),
    Chord(FnChord),
}

/// Key suppression while the performance lock is engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceFlags {
    pub disable_win: bool,
    pub disable_alt_tab: bool,
    pub disable_alt_f4: bool,
    pub disable_shift_tab: bool,
}

mod modifier_bits {
    pub const SHIFT: u8 = 0x02 | 0x20;
    pub const ALT: u8 = 0x04 | 0x40;
}

impl PerformanceFlags {
    fn suppresses(&self, code: u16, modifier: u8) -> bool {
        match code {
            keys::KEY_LEFTMETA => self.disable_win,
            keys::KEY_TAB if modifier & modifier_bits::ALT != 0 => self.disable_alt_tab,
            keys::KEY_TAB if modifier & modifier_bits::SHIFT != 0 => self.disable_shift_tab,
            keys::KEY_F4 if modifier & modifier_bits::ALT != 0 => self.disable_alt_f4,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldSynthetic {
    Key(u16),
    MouseButton(u16),
}

#[derive(Debug, Default)]
struct EngineState {
    previous: u64,
    modifier: u8,
    held: BTreeMap<u64, HeldSynthetic>,
    performance_lock: bool,
}

/// Per-device mapping engine.
pub struct MappingEngine {
    layout: InputLayout,
    keymap: Arc<SharedKeyMap>,
    macros: Arc<MacroLibrary>,
    sink: Arc<dyn InputSink>,
    player: MacroPlayer,
    chords: Vec<(u64, FnChord)>,
    flags: RwLock<PerformanceFlags>,
    state: Mutex<EngineState>,
    exit: ExitFlag,
}

impl std::fmt::Debug for MappingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingEngine")
            .field("layout", &self.layout)
            .field("keys", &self.keymap.load().len())
            .finish()
    }
}

impl MappingEngine {
    pub fn new(
        layout: InputLayout,
        keymap: Arc<SharedKeyMap>,
        macros: Arc<MacroLibrary>,
        sink: Arc<dyn InputSink>,
        exit: ExitFlag,
    ) -> Self {
        let player = MacroPlayer::new(Arc::clone(&sink), Arc::new(MacroTracker::new()));
        Self {
            layout,
            keymap,
            macros,
            sink,
            player,
            chords: Vec::new(),
            flags: RwLock::new(PerformanceFlags::default()),
            state: Mutex::new(EngineState::default()),
            exit,
        }
    }

    /// FN + key combinations recognised on this device.
    pub fn with_chords(mut self, chords: &[(u64, FnChord)]) -> Self {
        self.chords = chords.to_vec();
        self
    }

    pub fn keymap(&self) -> &Arc<SharedKeyMap> {
        &self.keymap
    }

    pub fn tracker(&self) -> &Arc<MacroTracker> {
        self.player.tracker()
    }

    pub fn set_performance_flags(&self, flags: PerformanceFlags) {
        *self.flags.write() = flags;
    }

    /// Toggle the performance lock. Returns the new state.
    pub fn toggle_performance_lock(&self) -> bool {
        let mut state = self.state.lock();
        state.performance_lock = !state.performance_lock;
        state.performance_lock
    }

    /// Process one raw input report.
    pub fn handle_report(&self, data: &[u8]) -> Result<Vec<DeviceRequest>> {
        match self.layout.decode(data) {
            Some(report) => self.process(report),
            None => Ok(Vec::new()),
        }
    }

    /// Process a decoded button report.
    pub fn process(&self, report: ButtonReport) -> Result<Vec<DeviceRequest>> {
        let (pressed, released, modifier_changed, lock) = {
            let mut state = self.state.lock();
            let xor = state.previous ^ report.bitmap;
            let modifier_changed = state.modifier != report.modifier;
            state.previous = report.bitmap;
            state.modifier = report.modifier;
            (report.bitmap & xor, !report.bitmap & xor, modifier_changed, state.performance_lock)
        };

        if modifier_changed {
            self.release_held(|h| matches!(h, HeldSynthetic::Key(_)))?;
        }
        if pressed == 0 && released == 0 {
            return Ok(Vec::new());
        }

        // Anything a macro left held goes first.
        self.player.tracker().release_all(self.sink.as_ref())?;

        let keymap = self.keymap.load();
        let flags = if lock {
            *self.flags.read()
        } else {
            PerformanceFlags::default()
        };
        let mut requests = Vec::new();

        for bit in bits(released) {
            let Some(key) = keymap.get(&bit) else {
                continue;
            };
            let held = self.state.lock().held.remove(&bit);
            if let Some(held) = held {
                self.release(held)?;
            }
            if key.kind() == ActionKind::Sniper && !key.default {
                requests.push(DeviceRequest::Sniper(false));
            }
        }

        for bit in bits(pressed) {
            if report.fn_pressed {
                if let Some(&(_, chord)) = self.chords.iter().find(|(mask, _)| *mask == bit) {
                    debug!(?chord, "FN chord");
                    requests.push(DeviceRequest::Chord(chord));
                    continue;
                }
            }
            let Some(key) = keymap.get(&bit) else {
                trace!(mask = format_args!("0x{bit:X}"), "No assignment for key");
                continue;
            };
            if key.default {
                continue;
            }
            if key.modifier_key > 0 && report.modifier != key.modifier_key {
                trace!(key = %key.name, "Chord incomplete, dropping");
                continue;
            }
            if report.modifier != 0 && key.modifier_key == 0 && !key.retain_original {
                trace!(key = %key.name, "Modifier held on plain key, dropping");
                continue;
            }
            if let Some(req) = self.dispatch(bit, key, report.modifier, &flags)? {
                requests.push(req);
            }
        }

        Ok(requests)
    }

    fn dispatch(
        &self,
        bit: u64,
        key: &KeyAssignment,
        modifier: u8,
        flags: &PerformanceFlags,
    ) -> Result<Option<DeviceRequest>> {
        let command = key.action_command;
        match key.kind() {
            ActionKind::None => {}
            ActionKind::Media | ActionKind::Keyboard => {
                if flags.suppresses(command, modifier) {
                    debug!(key = %key.name, command, "Suppressed by performance lock");
                    return Ok(None);
                }
                if key.action_hold {
                    self.sink.emit_key(command, KeyMotion::Press)?;
                    self.state.lock().held.insert(bit, HeldSynthetic::Key(command));
                } else {
                    self.sink.emit_key(command, KeyMotion::OneShot)?;
                }
            }
            ActionKind::Mouse => {
                if key.action_hold {
                    self.sink.emit_mouse_button(command, KeyMotion::Press)?;
                    self.state
                        .lock()
                        .held
                        .insert(bit, HeldSynthetic::MouseButton(command));
                } else {
                    self.sink.emit_mouse_button(command, KeyMotion::OneShot)?;
                }
            }
            ActionKind::Scroll => self.sink.emit_mouse_wheel(wheel_delta(command))?,
            ActionKind::Zoom => {
                self.sink.emit_key(keys::KEY_LEFTCTRL, KeyMotion::Press)?;
                self.sink.emit_mouse_wheel(wheel_delta(command))?;
                self.sink.emit_key(keys::KEY_LEFTCTRL, KeyMotion::Release)?;
            }
            ActionKind::DpiUp => return Ok(Some(DeviceRequest::DpiUp)),
            ActionKind::DpiDown => return Ok(Some(DeviceRequest::DpiDown)),
            ActionKind::Sniper => return Ok(Some(DeviceRequest::Sniper(true))),
            ActionKind::Macro => match self.macros.get(command) {
                Some(m) => self.player.play(&m, &self.exit)?,
                None => warn!(key = %key.name, id = command, "Macro not found"),
            },
        }
        Ok(None)
    }

    fn release_held(&self, pick: impl Fn(&HeldSynthetic) -> bool) -> Result<()> {
        let released: Vec<HeldSynthetic> = {
            let mut state = self.state.lock();
            let masks: Vec<u64> = state
                .held
                .iter()
                .filter(|(_, h)| pick(h))
                .map(|(m, _)| *m)
                .collect();
            masks
                .into_iter()
                .filter_map(|m| state.held.remove(&m))
                .collect()
        };
        for held in released {
            self.release(held)?;
        }
        Ok(())
    }

    fn release(&self, held: HeldSynthetic) -> Result<()> {
        match held {
            HeldSynthetic::Key(code) => self.sink.emit_key(code, KeyMotion::Release),
            HeldSynthetic::MouseButton(code) => {
                self.sink.emit_mouse_button(code, KeyMotion::Release)
            }
        }
    }

    /// Release every held synthetic and macro action (shutdown, disconnect).
    pub fn release_all(&self) -> Result<()> {
        self.release_held(|_| true)?;
        self.player.tracker().release_all(self.sink.as_ref())?;
        Ok(())
    }
}

fn wheel_delta(command: u16) -> i32 {
    match command {
        2 => -1,
        _ => 1,
    }
}

/// Single-bit masks set in `value`, lowest first.
fn bits(value: u64) -> impl Iterator<Item = u64> {
    (0..64).map(|i| 1u64 << i).filter(move |b| value & b != 0)
}

/// Build the key-assignment records, refusing maps of the wrong size.
pub fn build_key_assignment(map: &KeyMap, key_count: usize) -> Result<Vec<u8>> {
    if map.len() != key_count {
        return Err(Error::KeyCountMismatch {
            expected: key_count,
            actual: map.len(),
        });
    }
    let mut entries: Vec<&KeyAssignment> = map.values().collect();
    entries.sort_by_key(|k| k.button_index);
    Ok(entries
        .iter()
        .flat_map(|k| [k.button_index, k.record_value()])
        .collect())
}

/// Upload a key map. The device is untouched when the size is wrong.
pub fn upload_key_map(
    transport: &Transport,
    addr: Address,
    map: &KeyMap,
    key_count: usize,
) -> Result<usize> {
    let records = build_key_assignment(map, key_count)?;
    let frames = transport.exclusive(|| {
        endpoint::open_endpoint(transport, addr, endpoints::KEY_ASSIGNMENT)?;
        let frames = endpoint::write_stream(
            transport,
            addr,
            cmd::WRITE,
            data_types::KEY_ASSIGNMENT,
            &records,
        )?;
        endpoint::close_endpoint(transport, addr)?;
        Ok::<_, Error>(frames)
    })?;
    debug!(keys = key_count, frames, "Key assignment uploaded");
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::mock::{Emitted, RecordingSink};
    use crate::macros::MacroAction;
    use crate::transport::mock;

    const LAYOUT: InputLayout = InputLayout {
        bitmap: 2..4,
        reverse: false,
        modifier: Some(4),
        fn_byte: Some(5),
    };

    fn report(bitmap: u16, modifier: u8, fn_pressed: bool) -> Vec<u8> {
        let b = bitmap.to_le_bytes();
        vec![0x01, BUTTON_REPORT, b[0], b[1], modifier, fn_pressed as u8]
    }

    fn engine(map: KeyMap) -> (MappingEngine, RecordingSink) {
        let sink = RecordingSink::new();
        let engine = MappingEngine::new(
            LAYOUT,
            Arc::new(SharedKeyMap::new(map)),
            Arc::new(MacroLibrary::default()),
            Arc::new(sink.clone()),
            ExitFlag::new(),
        );
        (engine, sink)
    }

    #[test]
    fn decode_little_and_big_endian_bitmaps() {
        let data = [0x01, 0x02, 0x01, 0x80, 0x00, 0x00];
        assert_eq!(LAYOUT.decode(&data).unwrap().bitmap, 0x8001);
        let reversed = InputLayout {
            reverse: true,
            ..LAYOUT
        };
        assert_eq!(reversed.decode(&data).unwrap().bitmap, 0x0180);
        assert!(LAYOUT.decode(&[0x01, 0x01, 0x36, 0x02]).is_none());
    }

    #[test]
    fn native_key_produces_nothing() {
        let mut map = KeyMap::new();
        map.insert(0x01, KeyAssignment::native("left", 0));
        let (engine, sink) = engine(map);
        engine.handle_report(&report(0x01, 0, false)).unwrap();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn keyboard_one_shot_fires_on_press_only() {
        let mut map = KeyMap::new();
        map.insert(
            0x02,
            KeyAssignment::mapped("g1", 1, ActionKind::Keyboard, keys::KEY_A),
        );
        let (engine, sink) = engine(map);
        engine.handle_report(&report(0x02, 0, false)).unwrap();
        engine.handle_report(&report(0x00, 0, false)).unwrap();
        assert_eq!(
            sink.events(),
            vec![Emitted::Key(keys::KEY_A, KeyMotion::OneShot)]
        );
    }

    #[test]
    fn held_mouse_button_releases_on_release_transition() {
        let mut map = KeyMap::new();
        map.insert(
            0x04,
            KeyAssignment::mapped("side", 2, ActionKind::Mouse, keys::BTN_SIDE).with_hold(true),
        );
        let (engine, sink) = engine(map);
        engine.handle_report(&report(0x04, 0, false)).unwrap();
        engine.handle_report(&report(0x00, 0, false)).unwrap();
        assert_eq!(
            sink.events(),
            vec![
                Emitted::MouseButton(keys::BTN_SIDE, KeyMotion::Press),
                Emitted::MouseButton(keys::BTN_SIDE, KeyMotion::Release),
            ]
        );
    }

    #[test]
    fn chord_requires_matching_modifier() {
        let mut key = KeyAssignment::mapped("g2", 3, ActionKind::Keyboard, keys::KEY_B);
        key.modifier_key = 0x01;
        let mut map = KeyMap::new();
        map.insert(0x08, key);
        let (engine, sink) = engine(map);

        engine.handle_report(&report(0x08, 0x00, false)).unwrap();
        assert!(sink.events().is_empty());

        engine.handle_report(&report(0x00, 0x01, false)).unwrap();
        engine.handle_report(&report(0x08, 0x01, false)).unwrap();
        assert_eq!(
            sink.events(),
            vec![Emitted::Key(keys::KEY_B, KeyMotion::OneShot)]
        );
    }

    #[test]
    fn plain_key_dropped_while_modifier_held_unless_retained() {
        let mut map = KeyMap::new();
        map.insert(
            0x01,
            KeyAssignment::mapped("plain", 0, ActionKind::Keyboard, keys::KEY_A),
        );
        let mut retained = KeyAssignment::mapped("kept", 1, ActionKind::Keyboard, keys::KEY_B);
        retained.retain_original = true;
        map.insert(0x02, retained);
        let (engine, sink) = engine(map);

        engine.handle_report(&report(0x03, 0x02, false)).unwrap();
        assert_eq!(
            sink.events(),
            vec![Emitted::Key(keys::KEY_B, KeyMotion::OneShot)]
        );
    }

    #[test]
    fn dpi_and_sniper_are_returned_to_driver() {
        let mut map = KeyMap::new();
        map.insert(0x01, KeyAssignment::mapped("dpi+", 0, ActionKind::DpiUp, 0));
        map.insert(0x02, KeyAssignment::mapped("sniper", 1, ActionKind::Sniper, 0));
        let (engine, _sink) = engine(map);

        let reqs = engine.handle_report(&report(0x01, 0, false)).unwrap();
        assert_eq!(reqs, vec![DeviceRequest::DpiUp]);
        let reqs = engine.handle_report(&report(0x03, 0, false)).unwrap();
        assert_eq!(reqs, vec![DeviceRequest::Sniper(true)]);
        let reqs = engine.handle_report(&report(0x01, 0, false)).unwrap();
        assert_eq!(reqs, vec![DeviceRequest::Sniper(false)]);
    }

    #[test]
    fn fn_chord_overrides_native_key() {
        let mut map = KeyMap::new();
        map.insert(0x10, KeyAssignment::native("f1", 4));
        let (engine, sink) = engine(map);
        let engine = engine.with_chords(&[(0x10, FnChord::BrightnessUp)]);

        let reqs = engine.handle_report(&report(0x10, 0, true)).unwrap();
        assert_eq!(reqs, vec![DeviceRequest::Chord(FnChord::BrightnessUp)]);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn performance_lock_suppresses_win_key() {
        let mut map = KeyMap::new();
        map.insert(
            0x01,
            KeyAssignment::mapped("win", 0, ActionKind::Keyboard, keys::KEY_LEFTMETA),
        );
        let (engine, sink) = engine(map);
        engine.set_performance_flags(PerformanceFlags {
            disable_win: true,
            ..PerformanceFlags::default()
        });

        engine.handle_report(&report(0x01, 0, false)).unwrap();
        engine.handle_report(&report(0x00, 0, false)).unwrap();
        assert_eq!(sink.events().len(), 1);

        assert!(engine.toggle_performance_lock());
        sink.clear();
        engine.handle_report(&report(0x01, 0, false)).unwrap();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn scroll_and_zoom() {
        let mut map = KeyMap::new();
        map.insert(0x01, KeyAssignment::mapped("up", 0, ActionKind::Scroll, 1));
        map.insert(0x02, KeyAssignment::mapped("zoom-out", 1, ActionKind::Zoom, 2));
        let (engine, sink) = engine(map);
        engine.handle_report(&report(0x01, 0, false)).unwrap();
        engine.handle_report(&report(0x02, 0, false)).unwrap();
        assert_eq!(
            sink.events(),
            vec![
                Emitted::Wheel(1),
                Emitted::Key(keys::KEY_LEFTCTRL, KeyMotion::Press),
                Emitted::Wheel(-1),
                Emitted::Key(keys::KEY_LEFTCTRL, KeyMotion::Release),
            ]
        );
    }

    #[test]
    fn macro_key_plays_from_library() {
        let mut map = KeyMap::new();
        map.insert(0x01, KeyAssignment::mapped("m", 0, ActionKind::Macro, 9));
        let sink = RecordingSink::new();
        let macros = MacroLibrary::new([Macro {
            id: 9,
            name: "a".into(),
            actions: vec![MacroAction::key(keys::KEY_A, false)],
        }]);
        let engine = MappingEngine::new(
            LAYOUT,
            Arc::new(SharedKeyMap::new(map)),
            Arc::new(macros),
            Arc::new(sink.clone()),
            ExitFlag::new(),
        );
        engine.handle_report(&report(0x01, 0, false)).unwrap();
        assert_eq!(
            sink.events(),
            vec![Emitted::Key(keys::KEY_A, KeyMotion::OneShot)]
        );
    }

    #[test]
    fn keymap_update_swaps_whole_map() {
        let shared = SharedKeyMap::new(KeyMap::new());
        let before = shared.load();
        let after = shared.update(|m| {
            m.insert(1, KeyAssignment::native("a", 0));
        });
        assert!(before.is_empty());
        assert_eq!(after.len(), 1);
        assert_eq!(shared.load().len(), 1);
    }

    #[test]
    fn key_assignment_records_are_ordered_by_button_index() {
        let mut map = KeyMap::new();
        let mut chorded = KeyAssignment::mapped("b", 1, ActionKind::Keyboard, keys::KEY_B);
        chorded.modifier_key = 0x03;
        map.insert(0x02, chorded);
        map.insert(0x01, KeyAssignment::native("a", 0));
        map.insert(0x04, KeyAssignment::mapped("c", 2, ActionKind::Keyboard, 1));
        let records = build_key_assignment(&map, 3).unwrap();
        assert_eq!(records, vec![0, 0x01, 1, 0x06, 2, 0x00]);
    }

    #[test]
    fn wrong_key_count_leaves_device_untouched() {
        let (transport, handle) = mock::transport();
        let mut map = KeyMap::new();
        map.insert(0x01, KeyAssignment::native("a", 0));
        let err = upload_key_map(&transport, Address::wired(), &map, 6).unwrap_err();
        assert!(matches!(
            err,
            Error::KeyCountMismatch {
                expected: 6,
                actual: 1
            }
        ));
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn upload_streams_records_with_write_then_write_next() {
        let (transport, handle) = mock::transport();
        let map: KeyMap = (0..40u8)
            .map(|i| (1u64 << i, KeyAssignment::native("k", i)))
            .collect();
        let frames = upload_key_map(&transport, Address::wired(), &map, 40).unwrap();
        // 4-byte envelope + 80 bytes of records = 84 bytes -> 2 chunks.
        assert_eq!(frames, 2);
        let writes = handle.writes();
        assert_eq!(&writes[0][2..5], &[0x0d, 0x01, endpoints::KEY_ASSIGNMENT]);
        assert_eq!(&writes[1][2..8], &[0x06, 0x01, 80, 0x00, 0x0d, 0x00]);
        assert_eq!(&writes[2][2..4], cmd::WRITE_NEXT);
        assert_eq!(&writes[3][2..5], cmd::CLOSE_ENDPOINT);
    }
}
