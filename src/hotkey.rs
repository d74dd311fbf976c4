//! Global hold-to-talk hotkey via evdev.
//!
//! Watches every input device that carries the trigger key and translates raw
//! key-down/key-up into `Pressed`/`Released` intents for the controller.
//! Autorepeat events are ignored, so holding the chord produces exactly one
//! `Pressed`.

use std::collections::HashSet;

use anyhow::{Context, Result};
use evdev::{EventSummary, KeyCode};
use tokio::sync::mpsc;

use crate::messages::HotkeyEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Super,
}

impl Modifier {
    fn matches(self, code: KeyCode) -> bool {
        match self {
            Modifier::Ctrl => code == KeyCode::KEY_LEFTCTRL || code == KeyCode::KEY_RIGHTCTRL,
            Modifier::Alt => code == KeyCode::KEY_LEFTALT || code == KeyCode::KEY_RIGHTALT,
            Modifier::Shift => code == KeyCode::KEY_LEFTSHIFT || code == KeyCode::KEY_RIGHTSHIFT,
            Modifier::Super => code == KeyCode::KEY_LEFTMETA || code == KeyCode::KEY_RIGHTMETA,
        }
    }
}

/// A parsed hotkey binding: zero or more modifiers plus one trigger key.
#[derive(Debug, Clone, PartialEq)]
pub struct Chord {
    pub modifiers: Vec<Modifier>,
    pub trigger: KeyCode,
}

impl Chord {
    fn satisfied(&self, held: &HashSet<KeyCode>) -> bool {
        held.contains(&self.trigger)
            && self
                .modifiers
                .iter()
                .all(|m| held.iter().any(|&code| m.matches(code)))
    }

    fn involves(&self, code: KeyCode) -> bool {
        code == self.trigger || self.modifiers.iter().any(|m| m.matches(code))
    }
}

/// Parse a "CTRL+ALT+SPACE" style binding. The last token is the trigger key;
/// everything before it must be a modifier.
pub fn parse_chord(spec: &str) -> Result<Chord> {
    let tokens: Vec<&str> = spec
        .split('+')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    let (&trigger_name, modifier_names) = tokens
        .split_last()
        .context("hotkey cannot be empty")?;

    let mut modifiers = Vec::new();
    for name in modifier_names {
        modifiers.push(
            parse_modifier(name)
                .with_context(|| format!("'{name}' is not a modifier in hotkey '{spec}'"))?,
        );
    }

    let trigger = parse_key(trigger_name)
        .with_context(|| format!("unknown key '{trigger_name}' in hotkey '{spec}'"))?;

    Ok(Chord { modifiers, trigger })
}

fn parse_modifier(name: &str) -> Option<Modifier> {
    match name.to_ascii_uppercase().as_str() {
        "CTRL" | "CONTROL" => Some(Modifier::Ctrl),
        "ALT" => Some(Modifier::Alt),
        "SHIFT" => Some(Modifier::Shift),
        "SUPER" | "LOGO" | "META" | "CMD" => Some(Modifier::Super),
        _ => None,
    }
}

fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_ascii_uppercase().as_str() {
        "A" => KeyCode::KEY_A,
        "B" => KeyCode::KEY_B,
        "C" => KeyCode::KEY_C,
        "D" => KeyCode::KEY_D,
        "E" => KeyCode::KEY_E,
        "F" => KeyCode::KEY_F,
        "G" => KeyCode::KEY_G,
        "H" => KeyCode::KEY_H,
        "I" => KeyCode::KEY_I,
        "J" => KeyCode::KEY_J,
        "K" => KeyCode::KEY_K,
        "L" => KeyCode::KEY_L,
        "M" => KeyCode::KEY_M,
        "N" => KeyCode::KEY_N,
        "O" => KeyCode::KEY_O,
        "P" => KeyCode::KEY_P,
        "Q" => KeyCode::KEY_Q,
        "R" => KeyCode::KEY_R,
        "S" => KeyCode::KEY_S,
        "T" => KeyCode::KEY_T,
        "U" => KeyCode::KEY_U,
        "V" => KeyCode::KEY_V,
        "W" => KeyCode::KEY_W,
        "X" => KeyCode::KEY_X,
        "Y" => KeyCode::KEY_Y,
        "Z" => KeyCode::KEY_Z,
        "0" => KeyCode::KEY_0,
        "1" => KeyCode::KEY_1,
        "2" => KeyCode::KEY_2,
        "3" => KeyCode::KEY_3,
        "4" => KeyCode::KEY_4,
        "5" => KeyCode::KEY_5,
        "6" => KeyCode::KEY_6,
        "7" => KeyCode::KEY_7,
        "8" => KeyCode::KEY_8,
        "9" => KeyCode::KEY_9,
        "SPACE" => KeyCode::KEY_SPACE,
        "ENTER" | "RETURN" => KeyCode::KEY_ENTER,
        "TAB" => KeyCode::KEY_TAB,
        "ESC" | "ESCAPE" => KeyCode::KEY_ESC,
        "BACKSPACE" => KeyCode::KEY_BACKSPACE,
        "F1" => KeyCode::KEY_F1,
        "F2" => KeyCode::KEY_F2,
        "F3" => KeyCode::KEY_F3,
        "F4" => KeyCode::KEY_F4,
        "F5" => KeyCode::KEY_F5,
        "F6" => KeyCode::KEY_F6,
        "F7" => KeyCode::KEY_F7,
        "F8" => KeyCode::KEY_F8,
        "F9" => KeyCode::KEY_F9,
        "F10" => KeyCode::KEY_F10,
        "F11" => KeyCode::KEY_F11,
        "F12" => KeyCode::KEY_F12,
        _ => return None,
    };
    Some(key)
}

/// Monitor every device that can produce the chord's trigger key and emit
/// hold-to-talk transitions.
///
/// Key events from all devices are merged into one stream so a modifier on
/// the laptop keyboard plus a trigger on an external one still works.
pub async fn monitor_keyboards(chord: Chord, tx: mpsc::Sender<HotkeyEvent>) -> Result<()> {
    let (key_tx, key_rx) = mpsc::channel(64);

    let mut monitored = 0usize;
    for (path, device) in evdev::enumerate() {
        let has_trigger = device
            .supported_keys()
            .is_some_and(|keys| keys.contains(chord.trigger));
        if !has_trigger {
            continue;
        }

        let name = device.name().unwrap_or("unknown").to_string();
        let stream = match device.into_event_stream() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Cannot open input device {:?} ({}): {}", path, name, e);
                continue;
            }
        };

        tracing::info!("Monitoring input device {:?} ({})", path, name);
        monitored += 1;

        let key_tx = key_tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                match stream.next_event().await {
                    Ok(event) => {
                        if let EventSummary::Key(_, code, value) = event.destructure() {
                            if key_tx.send((code, value)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Input device {:?} read failed: {}", path, e);
                        break;
                    }
                }
            }
        });
    }
    drop(key_tx);

    if monitored == 0 {
        return Err(anyhow::anyhow!(
            "no input devices with the hotkey trigger found (is the user in the 'input' group?)"
        ));
    }

    track_chord(chord, key_rx, tx).await;
    Ok(())
}

/// Fold raw key transitions into chord engage/release. Value 1 is key-down,
/// 0 is key-up, 2 is autorepeat.
async fn track_chord(
    chord: Chord,
    mut key_rx: mpsc::Receiver<(KeyCode, i32)>,
    tx: mpsc::Sender<HotkeyEvent>,
) {
    let mut held: HashSet<KeyCode> = HashSet::new();
    let mut engaged = false;

    while let Some((code, value)) = key_rx.recv().await {
        match value {
            1 => {
                held.insert(code);
                if !engaged && chord.satisfied(&held) {
                    engaged = true;
                    tracing::debug!("Hotkey engaged");
                    if tx.send(HotkeyEvent::Pressed).await.is_err() {
                        break;
                    }
                }
            }
            0 => {
                held.remove(&code);
                if engaged && chord.involves(code) {
                    engaged = false;
                    tracing::debug!("Hotkey released");
                    if tx.send(HotkeyEvent::Released).await.is_err() {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modifier_chord() {
        let chord = parse_chord("CTRL+ALT+SPACE").unwrap();
        assert_eq!(chord.modifiers, vec![Modifier::Ctrl, Modifier::Alt]);
        assert_eq!(chord.trigger, KeyCode::KEY_SPACE);
    }

    #[test]
    fn parses_bare_key_and_is_case_insensitive() {
        assert_eq!(parse_chord("F9").unwrap().trigger, KeyCode::KEY_F9);
        let chord = parse_chord("super+g").unwrap();
        assert_eq!(chord.modifiers, vec![Modifier::Super]);
        assert_eq!(chord.trigger, KeyCode::KEY_G);
    }

    #[test]
    fn rejects_unknown_tokens() {
        assert!(parse_chord("").is_err());
        assert!(parse_chord("NOT A CHORD").is_err());
        assert!(parse_chord("CTRL+WOBBLE").is_err());
        // A key in modifier position is an error too.
        assert!(parse_chord("G+CTRL").is_err());
    }

    #[test]
    fn chord_satisfaction_accepts_either_side_modifier() {
        let chord = parse_chord("CTRL+SPACE").unwrap();
        let mut held = HashSet::new();

        held.insert(KeyCode::KEY_SPACE);
        assert!(!chord.satisfied(&held));

        held.insert(KeyCode::KEY_RIGHTCTRL);
        assert!(chord.satisfied(&held));

        assert!(chord.involves(KeyCode::KEY_LEFTCTRL));
        assert!(chord.involves(KeyCode::KEY_SPACE));
        assert!(!chord.involves(KeyCode::KEY_A));
    }

    #[tokio::test]
    async fn track_chord_emits_press_and_release_once() {
        let chord = parse_chord("CTRL+SPACE").unwrap();
        let (key_tx, key_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        let tracker = tokio::spawn(track_chord(chord, key_rx, tx));

        key_tx.send((KeyCode::KEY_LEFTCTRL, 1)).await.unwrap();
        key_tx.send((KeyCode::KEY_SPACE, 1)).await.unwrap();
        // Autorepeat while held must not re-trigger.
        key_tx.send((KeyCode::KEY_SPACE, 2)).await.unwrap();
        key_tx.send((KeyCode::KEY_SPACE, 0)).await.unwrap();
        // Releasing the modifier after disengage emits nothing further.
        key_tx.send((KeyCode::KEY_LEFTCTRL, 0)).await.unwrap();
        drop(key_tx);

        assert_eq!(rx.recv().await, Some(HotkeyEvent::Pressed));
        assert_eq!(rx.recv().await, Some(HotkeyEvent::Released));
        assert_eq!(rx.recv().await, None);
        tracker.await.unwrap();
    }
}
