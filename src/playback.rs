//! PLAY / PAUSE / ERROR state machine around the sim clock.

use crate::clock::SimClock;
use crate::geometry::Twist;
use crate::output::Publisher;

/// Current playback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    Play,
    #[default]
    Pause,
    Error,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Play => write!(f, "PLAY"),
            PlaybackState::Pause => write!(f, "PAUSE"),
            PlaybackState::Error => write!(f, "ERROR"),
        }
    }
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Operator asks to (re)start playback.
    Resume,
    /// Operator asks to stop playback.
    Pause,
    /// Operator acknowledges a fault.
    Acknowledge,
    /// The correction pipeline failed.
    Fault,
}

/// Playback state plus the clock it drives.
///
/// Stopping playback always sends one idle command on the command output.
#[derive(Debug)]
pub struct Playback {
    state: PlaybackState,
    clock: SimClock,
    commands: Publisher<Twist>,
}

impl Playback {
    pub fn new(commands: Publisher<Twist>) -> Self {
        Self {
            state: PlaybackState::Pause,
            clock: SimClock::new(),
            commands,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn sim_time(&self) -> f64 {
        self.clock.sim_time()
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Apply `event`. Returns the new state if a transition happened.
    ///
    /// Events that make no sense in the current state are ignored.
    pub fn handle(&mut self, event: PlaybackEvent) -> Option<PlaybackState> {
        let next = match (self.state, event) {
            (PlaybackState::Error, PlaybackEvent::Fault) => return None,
            (_, PlaybackEvent::Fault) => {
                tracing::warn!("Switching to emergency mode.");
                self.pause_playback();
                PlaybackState::Error
            }
            (PlaybackState::Play, PlaybackEvent::Pause) => {
                tracing::info!("Stopping playback.");
                self.pause_playback();
                PlaybackState::Pause
            }
            (PlaybackState::Pause, PlaybackEvent::Resume) => {
                tracing::info!("Starting playback at {:.3}s.", self.clock.sim_time());
                self.clock.start();
                PlaybackState::Play
            }
            (PlaybackState::Error, PlaybackEvent::Acknowledge) => {
                tracing::info!("Attempting recovery.");
                PlaybackState::Pause
            }
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    fn pause_playback(&mut self) {
        self.commands.publish(Twist::idle());
        let paused_at = self.clock.pause();
        tracing::info!("Paused at: {:.3}s", paused_at);
    }
}
