//! Input simulation: turning console mouse/keyboard events into OS-level
//! injections.
//!
//! The translation layer is platform-neutral and fully testable: events are
//! expanded into a sequence of abstract [`InputOp`]s (normalized mouse
//! coordinates, virtual-key presses) which the platform sink then injects.
//! In session 0 the ops never exist here; the raw events are forwarded over
//! the bridge and expanded inside the user's session instead.

use crate::protocol::{KeyAction, KeyEventPayload, Modifier, MouseAction, MouseEventPayload};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("injection failed: {0}")]
    Inject(String),
    #[error("no display to resolve coordinates against")]
    NoDisplay,
    #[error("bridge unavailable: {0}")]
    Bridge(String),
    #[error("input injection is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Middle,
    Right,
}

impl Button {
    /// Protocol button codes: 0 = left, 1 = middle, 2 = right; anything
    /// else is treated as left.
    pub fn from_code(code: u8) -> Button {
        match code {
            1 => Button::Middle,
            2 => Button::Right,
            _ => Button::Left,
        }
    }
}

/// One OS-level injection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOp {
    /// Cursor move in normalized absolute space (0..=65535 per axis).
    MouseMove { nx: u16, ny: u16 },
    MouseButton { button: Button, down: bool },
    Key { vk: u16, down: bool },
}

/// Map a web-platform key name to a Windows virtual-key code.
/// Matching is case-insensitive; unknown names return `None`.
pub fn virtual_key(name: &str) -> Option<u16> {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphabetic() {
            return Some(0x41 + (c.to_ascii_uppercase() as u16 - 'A' as u16));
        }
        if c.is_ascii_digit() {
            return Some(0x30 + (c as u16 - '0' as u16));
        }
        if c == ' ' {
            return Some(0x20);
        }
        return None;
    }

    let code = match name.to_ascii_lowercase().as_str() {
        "enter" => 0x0D,
        "tab" => 0x09,
        "escape" => 0x1B,
        "backspace" => 0x08,
        "delete" => 0x2E,
        "insert" => 0x2D,
        "home" => 0x24,
        "end" => 0x23,
        "pageup" => 0x21,
        "pagedown" => 0x22,
        "arrowleft" => 0x25,
        "arrowup" => 0x26,
        "arrowright" => 0x27,
        "arrowdown" => 0x28,
        "space" => 0x20,
        "capslock" => 0x14,
        "numlock" => 0x90,
        "scrolllock" => 0x91,
        "printscreen" => 0x2C,
        "pause" => 0x13,
        "contextmenu" => 0x5D,
        "control" | "ctrl" => 0x11,
        "alt" => 0x12,
        "shift" => 0x10,
        "meta" => 0x5B,
        "f1" => 0x70,
        "f2" => 0x71,
        "f3" => 0x72,
        "f4" => 0x73,
        "f5" => 0x74,
        "f6" => 0x75,
        "f7" => 0x76,
        "f8" => 0x77,
        "f9" => 0x78,
        "f10" => 0x79,
        "f11" => 0x7A,
        "f12" => 0x7B,
        _ => return None,
    };
    Some(code)
}

fn modifier_key(modifier: Modifier) -> u16 {
    match modifier {
        Modifier::Ctrl => 0x11,
        Modifier::Alt => 0x12,
        Modifier::Shift => 0x10,
        Modifier::Meta => 0x5B,
    }
}

/// Map an absolute pixel coordinate to normalized 0..=65535 space.
fn normalize(value: i32, extent: i32) -> u16 {
    let span = (extent - 1).max(1) as i64;
    let scaled = (value.clamp(0, extent - 1) as i64 * 65535) / span;
    scaled as u16
}

/// Expand a mouse event into injection ops. The cursor is always positioned
/// first; `click` is down+up and `dblclick` repeats the pair with no
/// inter-click delay.
pub fn mouse_ops(event: &MouseEventPayload, screen: (i32, i32)) -> Vec<InputOp> {
    let (width, height) = screen;
    let button = Button::from_code(event.button);
    let mut ops = vec![InputOp::MouseMove {
        nx: normalize(event.x, width),
        ny: normalize(event.y, height),
    }];

    match event.action {
        MouseAction::Move => {}
        MouseAction::Down => ops.push(InputOp::MouseButton { button, down: true }),
        MouseAction::Up => ops.push(InputOp::MouseButton {
            button,
            down: false,
        }),
        MouseAction::Click => {
            ops.push(InputOp::MouseButton { button, down: true });
            ops.push(InputOp::MouseButton {
                button,
                down: false,
            });
        }
        MouseAction::DblClick => {
            for _ in 0..2 {
                ops.push(InputOp::MouseButton { button, down: true });
                ops.push(InputOp::MouseButton {
                    button,
                    down: false,
                });
            }
        }
    }
    ops
}

/// Expand a key event into injection ops. On `down` the modifiers are
/// pressed before the main key; on `up` the main key is released first.
/// Unknown key names produce no ops (logged by the caller-facing wrappers).
pub fn key_ops(event: &KeyEventPayload) -> Vec<InputOp> {
    let Some(vk) = virtual_key(&event.key) else {
        warn!("ignoring unknown key name {:?}", event.key);
        return Vec::new();
    };

    let mut ops = Vec::with_capacity(event.modifiers.len() + 1);
    match event.action {
        KeyAction::Down => {
            for modifier in &event.modifiers {
                ops.push(InputOp::Key {
                    vk: modifier_key(*modifier),
                    down: true,
                });
            }
            ops.push(InputOp::Key { vk, down: true });
        }
        KeyAction::Up => {
            ops.push(InputOp::Key { vk, down: false });
            for modifier in &event.modifiers {
                ops.push(InputOp::Key {
                    vk: modifier_key(*modifier),
                    down: false,
                });
            }
        }
    }
    ops
}

/// Direct in-session simulator.
pub struct Simulator;

impl Simulator {
    pub fn new() -> Simulator {
        Simulator
    }

    pub fn mouse(&self, event: &MouseEventPayload) -> Result<(), InputError> {
        let screen = crate::platform::primary_screen_size().ok_or(InputError::NoDisplay)?;
        crate::platform::inject(&mouse_ops(event, screen))
    }

    pub fn key(&self, event: &KeyEventPayload) -> Result<(), InputError> {
        let ops = key_ops(event);
        if ops.is_empty() {
            return Ok(());
        }
        crate::platform::inject(&ops)
    }
}

/// Where dispatched input events go: straight into this session, or across
/// the session-0 bridge.
pub enum InputSink {
    Direct(Simulator),
    #[cfg(windows)]
    Bridge(std::sync::Arc<crate::bridge::SessionBridge>),
}

impl InputSink {
    pub async fn mouse(&self, event: MouseEventPayload) -> Result<(), InputError> {
        match self {
            InputSink::Direct(simulator) => simulator.mouse(&event),
            #[cfg(windows)]
            InputSink::Bridge(bridge) => bridge.send_mouse(&event).await,
        }
    }

    pub async fn key(&self, event: KeyEventPayload) -> Result<(), InputError> {
        match self {
            InputSink::Direct(simulator) => simulator.key(&event),
            #[cfg(windows)]
            InputSink::Bridge(bridge) => bridge.send_key(&event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_and_digits_map_to_their_ranges() {
        assert_eq!(virtual_key("a"), Some(0x41));
        assert_eq!(virtual_key("Z"), Some(0x5A));
        assert_eq!(virtual_key("0"), Some(0x30));
        assert_eq!(virtual_key("9"), Some(0x39));
    }

    #[test]
    fn named_keys_match_the_documented_codes() {
        let expected = [
            ("Enter", 0x0D),
            ("Tab", 0x09),
            ("Escape", 0x1B),
            ("Backspace", 0x08),
            ("Delete", 0x2E),
            ("Insert", 0x2D),
            ("Home", 0x24),
            ("End", 0x23),
            ("PageUp", 0x21),
            ("PageDown", 0x22),
            ("ArrowLeft", 0x25),
            ("ArrowUp", 0x26),
            ("ArrowRight", 0x27),
            ("ArrowDown", 0x28),
            ("CapsLock", 0x14),
            ("NumLock", 0x90),
            ("ScrollLock", 0x91),
            ("PrintScreen", 0x2C),
            ("Pause", 0x13),
            ("ContextMenu", 0x5D),
            ("Control", 0x11),
            ("Alt", 0x12),
            ("Shift", 0x10),
            ("Meta", 0x5B),
            ("F1", 0x70),
            ("F5", 0x74),
            ("F12", 0x7B),
            (" ", 0x20),
        ];
        for (name, code) in expected {
            assert_eq!(virtual_key(name), Some(code), "key {name:?}");
        }
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(virtual_key("ENTER"), virtual_key("enter"));
        assert_eq!(virtual_key("arrowLEFT"), Some(0x25));
        assert_eq!(virtual_key("f11"), Some(0x7A));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(virtual_key("NoSuchKey"), None);
        assert_eq!(virtual_key("€"), None);
        assert_eq!(virtual_key(""), None);
    }

    #[test]
    fn click_expands_to_move_down_up() {
        let event = MouseEventPayload {
            x: 0,
            y: 0,
            button: 0,
            action: MouseAction::Click,
        };
        let ops = mouse_ops(&event, (1920, 1080));
        assert_eq!(
            ops,
            vec![
                InputOp::MouseMove { nx: 0, ny: 0 },
                InputOp::MouseButton {
                    button: Button::Left,
                    down: true
                },
                InputOp::MouseButton {
                    button: Button::Left,
                    down: false
                },
            ]
        );
    }

    #[test]
    fn dblclick_repeats_the_pair() {
        let event = MouseEventPayload {
            x: 10,
            y: 10,
            button: 2,
            action: MouseAction::DblClick,
        };
        let ops = mouse_ops(&event, (1920, 1080));
        assert_eq!(ops.len(), 5);
        let downs = ops
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    InputOp::MouseButton {
                        button: Button::Right,
                        down: true
                    }
                )
            })
            .count();
        assert_eq!(downs, 2);
    }

    #[test]
    fn coordinates_normalize_to_the_full_range() {
        let event = MouseEventPayload {
            x: 1919,
            y: 1079,
            button: 0,
            action: MouseAction::Move,
        };
        let ops = mouse_ops(&event, (1920, 1080));
        assert_eq!(
            ops,
            vec![InputOp::MouseMove {
                nx: 65535,
                ny: 65535
            }]
        );

        // out-of-range input clamps instead of wrapping
        let event = MouseEventPayload {
            x: -50,
            y: 99999,
            button: 0,
            action: MouseAction::Move,
        };
        let ops = mouse_ops(&event, (1920, 1080));
        assert_eq!(
            ops,
            vec![InputOp::MouseMove {
                nx: 0,
                ny: 65535
            }]
        );
    }

    #[test]
    fn unusual_button_codes_fall_back_to_left() {
        assert_eq!(Button::from_code(0), Button::Left);
        assert_eq!(Button::from_code(1), Button::Middle);
        assert_eq!(Button::from_code(2), Button::Right);
        assert_eq!(Button::from_code(7), Button::Left);
    }

    #[test]
    fn modifiers_wrap_the_main_key() {
        let down = KeyEventPayload {
            key: "s".into(),
            action: KeyAction::Down,
            modifiers: vec![Modifier::Ctrl, Modifier::Shift],
        };
        assert_eq!(
            key_ops(&down),
            vec![
                InputOp::Key {
                    vk: 0x11,
                    down: true
                },
                InputOp::Key {
                    vk: 0x10,
                    down: true
                },
                InputOp::Key {
                    vk: 0x53,
                    down: true
                },
            ]
        );

        let up = KeyEventPayload {
            key: "s".into(),
            action: KeyAction::Up,
            modifiers: vec![Modifier::Ctrl, Modifier::Shift],
        };
        assert_eq!(
            key_ops(&up),
            vec![
                InputOp::Key {
                    vk: 0x53,
                    down: false
                },
                InputOp::Key {
                    vk: 0x11,
                    down: false
                },
                InputOp::Key {
                    vk: 0x10,
                    down: false
                },
            ]
        );
    }

    #[test]
    fn modifier_as_main_key_is_pressed_exactly_once() {
        let event = KeyEventPayload {
            key: "Shift".into(),
            action: KeyAction::Down,
            modifiers: vec![],
        };
        assert_eq!(
            key_ops(&event),
            vec![InputOp::Key {
                vk: 0x10,
                down: true
            }]
        );
    }

    #[test]
    fn unknown_key_produces_no_ops() {
        let event = KeyEventPayload {
            key: "Hyper".into(),
            action: KeyAction::Down,
            modifiers: vec![Modifier::Ctrl],
        };
        assert!(key_ops(&event).is_empty());
    }
}
