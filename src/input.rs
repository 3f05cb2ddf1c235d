//! Operator input: gamepad button snapshots mapped to playback events.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::playback::PlaybackEvent;

/// Gamepad buttons, by role rather than by device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    A,
    B,
    X,
    Y,
    LeftBumper,
    RightBumper,
    Back,
    Start,
}

/// The set of buttons held down in one joystick message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonSnapshot {
    pressed: BTreeSet<Button>,
}

impl ButtonSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, button: Button) -> Self {
        self.pressed.insert(button);
        self
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.pressed.contains(&button)
    }
}

impl FromIterator<Button> for ButtonSnapshot {
    fn from_iter<I: IntoIterator<Item = Button>>(iter: I) -> Self {
        Self {
            pressed: iter.into_iter().collect(),
        }
    }
}

/// Which buttons drive playback.
///
/// The dead-man button must be held for playback to continue: releasing it pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerMapping {
    pub deadman: Button,
    pub acknowledge: Button,
}

impl Default for ControllerMapping {
    fn default() -> Self {
        Self {
            deadman: Button::RightBumper,
            acknowledge: Button::X,
        }
    }
}

impl ControllerMapping {
    /// Events carried by one snapshot, in the order they must be applied.
    ///
    /// A snapshot always carries the dead-man event first, so a single message
    /// can recover from a fault but never recover and resume at once.
    pub fn events(&self, snapshot: &ButtonSnapshot) -> Vec<PlaybackEvent> {
        let mut events = Vec::with_capacity(2);
        if snapshot.is_pressed(self.deadman) {
            events.push(PlaybackEvent::Resume);
        } else {
            events.push(PlaybackEvent::Pause);
        }
        if snapshot.is_pressed(self.acknowledge) {
            events.push(PlaybackEvent::Acknowledge);
        }
        events
    }
}

/// One item of the operator input stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorInput {
    /// Raw button state from the gamepad.
    Buttons(ButtonSnapshot),
    /// An already decoded playback event (keyboard, remote UI).
    Event(PlaybackEvent),
}

impl OperatorInput {
    pub fn events(&self, mapping: &ControllerMapping) -> Vec<PlaybackEvent> {
        match self {
            OperatorInput::Buttons(snapshot) => mapping.events(snapshot),
            OperatorInput::Event(event) => vec![*event],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Publisher;
    use crate::playback::{Playback, PlaybackState};

    fn apply(playback: &mut Playback, mapping: &ControllerMapping, snapshot: ButtonSnapshot) {
        for event in mapping.events(&snapshot) {
            playback.handle(event);
        }
    }

    #[test]
    fn test_deadman_held_resumes() {
        let mapping = ControllerMapping::default();
        let held = ButtonSnapshot::new().with(Button::RightBumper);
        assert_eq!(mapping.events(&held), vec![PlaybackEvent::Resume]);
        assert_eq!(
            mapping.events(&ButtonSnapshot::new()),
            vec![PlaybackEvent::Pause]
        );
    }

    #[test]
    fn test_acknowledge_comes_last() {
        let mapping = ControllerMapping::default();
        let both: ButtonSnapshot = [Button::X, Button::RightBumper].into_iter().collect();
        assert_eq!(
            mapping.events(&both),
            vec![PlaybackEvent::Resume, PlaybackEvent::Acknowledge]
        );
    }

    #[test]
    fn test_recovery_needs_two_messages() {
        let mapping = ControllerMapping::default();
        let (commands, _rx) = Publisher::channel("/cmd", 16);
        let mut playback = Playback::new(commands);
        playback.handle(PlaybackEvent::Fault);

        let both: ButtonSnapshot = [Button::X, Button::RightBumper].into_iter().collect();
        apply(&mut playback, &mapping, both.clone());
        assert_eq!(playback.state(), PlaybackState::Pause);

        apply(&mut playback, &mapping, both);
        assert_eq!(playback.state(), PlaybackState::Play);

        apply(&mut playback, &mapping, ButtonSnapshot::new());
        assert_eq!(playback.state(), PlaybackState::Pause);
    }

    #[test]
    fn test_custom_mapping_from_json() {
        let mapping: ControllerMapping =
            serde_json::from_str(r#"{"deadman": "left_bumper"}"#).unwrap();
        assert_eq!(mapping.deadman, Button::LeftBumper);
        assert_eq!(mapping.acknowledge, Button::X);
    }

    #[test]
    fn test_direct_event_passthrough() {
        let mapping = ControllerMapping::default();
        let input = OperatorInput::Event(PlaybackEvent::Acknowledge);
        assert_eq!(input.events(&mapping), vec![PlaybackEvent::Acknowledge]);
    }
}
