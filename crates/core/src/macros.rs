//! Macro playback and held-action tracking.
//!
//! Playback runs synchronously on the listener thread. Actions marked `hold`
//! are pressed and remembered in the [`MacroTracker`]; the next physical
//! button transition releases them in ascending step order before anything
//! else is dispatched.

use crate::error::Result;
use crate::input::{self, InputSink, KeyMotion};
use crate::state::ExitFlag;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Kind of a single macro step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacroActionKind {
    Key,
    Mouse,
    Delay,
    Text,
}

/// One step of a macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroAction {
    pub kind: MacroActionKind,
    /// Key code or mouse button code.
    #[serde(default)]
    pub command: u16,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub hold: bool,
    /// Extra iterations for mouse and text steps; 0 runs once.
    #[serde(default)]
    pub repeat: u32,
    #[serde(default)]
    pub repeat_delay_ms: u64,
}

impl MacroAction {
    pub fn key(code: u16, hold: bool) -> Self {
        Self::new(MacroActionKind::Key, code, hold)
    }

    pub fn mouse(code: u16, hold: bool) -> Self {
        Self::new(MacroActionKind::Mouse, code, hold)
    }

    pub fn delay(ms: u64) -> Self {
        Self {
            delay_ms: ms,
            ..Self::new(MacroActionKind::Delay, 0, false)
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::new(MacroActionKind::Text, 0, false)
        }
    }

    fn new(kind: MacroActionKind, command: u16, hold: bool) -> Self {
        Self {
            kind,
            command,
            delay_ms: 0,
            text: String::new(),
            hold,
            repeat: 0,
            repeat_delay_ms: 0,
        }
    }
}

/// A stored macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macro {
    pub id: u16,
    pub name: String,
    pub actions: Vec<MacroAction>,
}

/// A synthetic press waiting for its release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeldAction {
    Key(u16),
    MouseButton(u16),
}

impl HeldAction {
    fn release(self, sink: &dyn InputSink) -> Result<()> {
        match self {
            Self::Key(code) => sink.emit_key(code, KeyMotion::Release),
            Self::MouseButton(code) => sink.emit_mouse_button(code, KeyMotion::Release),
        }
    }
}

/// Held macro actions keyed by step index.
#[derive(Debug, Default)]
pub struct MacroTracker {
    held: Mutex<BTreeMap<usize, HeldAction>>,
}

impl MacroTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self, step: usize, action: HeldAction) {
        self.held.lock().insert(step, action);
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    /// Take every held action in ascending step order.
    pub fn drain(&self) -> Vec<HeldAction> {
        let held = std::mem::take(&mut *self.held.lock());
        held.into_values().collect()
    }

    /// Release everything held. Events are emitted after the lock is dropped.
    pub fn release_all(&self, sink: &dyn InputSink) -> Result<usize> {
        let snapshot = self.drain();
        for action in &snapshot {
            action.release(sink)?;
        }
        if !snapshot.is_empty() {
            debug!(count = snapshot.len(), "Released held macro actions");
        }
        Ok(snapshot.len())
    }
}

/// Executes macros against an input sink.
pub struct MacroPlayer {
    sink: Arc<dyn InputSink>,
    tracker: Arc<MacroTracker>,
}

impl std::fmt::Debug for MacroPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroPlayer")
            .field("held", &self.tracker.len())
            .finish()
    }
}

impl MacroPlayer {
    pub fn new(sink: Arc<dyn InputSink>, tracker: Arc<MacroTracker>) -> Self {
        Self { sink, tracker }
    }

    pub fn tracker(&self) -> &Arc<MacroTracker> {
        &self.tracker
    }

    /// Play `m` to completion, or until `exit` is raised between steps.
    pub fn play(&self, m: &Macro, exit: &ExitFlag) -> Result<()> {
        debug!(id = m.id, name = %m.name, steps = m.actions.len(), "Playing macro");
        let sink = self.sink.as_ref();

        for (step, action) in m.actions.iter().enumerate() {
            if exit.is_set() {
                debug!(id = m.id, step, "Macro interrupted by shutdown");
                break;
            }
            trace!(step, kind = ?action.kind, command = action.command, "Macro step");

            match action.kind {
                MacroActionKind::Key => {
                    if action.hold {
                        sink.emit_key(action.command, KeyMotion::Press)?;
                        self.tracker.hold(step, HeldAction::Key(action.command));
                    } else {
                        sink.emit_key(action.command, KeyMotion::OneShot)?;
                    }
                }
                MacroActionKind::Mouse => {
                    if action.hold {
                        sink.emit_mouse_button(action.command, KeyMotion::Press)?;
                        self.tracker
                            .hold(step, HeldAction::MouseButton(action.command));
                    } else {
                        repeat(action, exit, || {
                            sink.emit_mouse_button(action.command, KeyMotion::OneShot)
                        })?;
                    }
                }
                MacroActionKind::Delay => thread::sleep(Duration::from_millis(action.delay_ms)),
                MacroActionKind::Text => {
                    repeat(action, exit, || input::type_text(sink, &action.text))?;
                }
            }
        }
        Ok(())
    }
}

fn repeat(action: &MacroAction, exit: &ExitFlag, mut f: impl FnMut() -> Result<()>) -> Result<()> {
    for i in 0..=action.repeat {
        if i > 0 {
            if exit.is_set() {
                break;
            }
            thread::sleep(Duration::from_millis(action.repeat_delay_ms));
        }
        f()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::keys;
    use crate::input::mock::{Emitted, RecordingSink};

    fn player() -> (MacroPlayer, RecordingSink) {
        let sink = RecordingSink::new();
        let player = MacroPlayer::new(Arc::new(sink.clone()), Arc::new(MacroTracker::new()));
        (player, sink)
    }

    #[test]
    fn held_keys_are_tracked_and_released_in_step_order() {
        let (player, sink) = player();
        let m = Macro {
            id: 1,
            name: "ab".into(),
            actions: vec![
                MacroAction::key(keys::KEY_A, true),
                MacroAction::delay(5),
                MacroAction::key(keys::KEY_B, true),
            ],
        };
        player.play(&m, &ExitFlag::new()).unwrap();
        assert_eq!(player.tracker().len(), 2);

        sink.clear();
        let released = player.tracker().release_all(&sink).unwrap();
        assert_eq!(released, 2);
        assert_eq!(
            sink.events(),
            vec![
                Emitted::Key(keys::KEY_A, KeyMotion::Release),
                Emitted::Key(keys::KEY_B, KeyMotion::Release),
            ]
        );
        assert!(player.tracker().is_empty());
    }

    #[test]
    fn drain_is_ordered_by_step_not_insertion() {
        let tracker = MacroTracker::new();
        tracker.hold(5, HeldAction::Key(3));
        tracker.hold(1, HeldAction::MouseButton(keys::BTN_LEFT));
        tracker.hold(3, HeldAction::Key(4));
        assert_eq!(
            tracker.drain(),
            vec![
                HeldAction::MouseButton(keys::BTN_LEFT),
                HeldAction::Key(4),
                HeldAction::Key(3),
            ]
        );
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn mouse_repeat_runs_extra_iterations() {
        let (player, sink) = player();
        let mut click = MacroAction::mouse(keys::BTN_LEFT, false);
        click.repeat = 2;
        let m = Macro {
            id: 2,
            name: "triple".into(),
            actions: vec![click],
        };
        player.play(&m, &ExitFlag::new()).unwrap();
        assert_eq!(sink.events().len(), 3);
        assert!(player.tracker().is_empty());
    }

    #[test]
    fn text_step_types_characters() {
        let (player, sink) = player();
        let m = Macro {
            id: 3,
            name: "text".into(),
            actions: vec![MacroAction::text("ab")],
        };
        player.play(&m, &ExitFlag::new()).unwrap();
        assert_eq!(
            sink.events(),
            vec![
                Emitted::Key(keys::KEY_A, KeyMotion::OneShot),
                Emitted::Key(keys::KEY_B, KeyMotion::OneShot),
            ]
        );
    }

    #[test]
    fn exit_flag_stops_playback() {
        let (player, sink) = player();
        let exit = ExitFlag::new();
        exit.set();
        let m = Macro {
            id: 4,
            name: "never".into(),
            actions: vec![MacroAction::key(keys::KEY_A, false)],
        };
        player.play(&m, &exit).unwrap();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn macro_json_uses_defaults() {
        let json = r#"{"id":7,"name":"x","actions":[{"kind":"delay","delay_ms":20},{"kind":"key","command":30}]}"#;
        let m: Macro = serde_json::from_str(json).unwrap();
        assert_eq!(m.actions[0], MacroAction::delay(20));
        assert_eq!(m.actions[1], MacroAction::key(30, false));
    }
}
