//! Recorded command and pose timelines with forward-only cursors.

use crate::geometry::{Pose, Twist};

/// A value recorded at a point of the teach timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    /// Seconds since the start of the teach run.
    pub stamp: f64,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn new(stamp: f64, value: T) -> Self {
        Self { stamp, value }
    }
}

pub type TimedCommand = Stamped<Twist>;
pub type TimedPose = Stamped<Pose>;

/// An ordered sequence plus a read cursor that only moves forward.
#[derive(Debug, Clone)]
pub struct Timeline<T> {
    entries: Vec<Stamped<T>>,
    cursor: usize,
}

impl<T> Timeline<T> {
    pub fn new(entries: Vec<Stamped<T>>) -> Self {
        Self { entries, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// True once the cursor rests on the final entry (or there is none).
    pub fn at_end(&self) -> bool {
        self.cursor + 1 >= self.entries.len()
    }

    /// Stamp of the last recorded entry.
    pub fn last_stamp(&self) -> Option<f64> {
        self.entries.last().map(|e| e.stamp)
    }

    /// Move forward while the next entry is stamped before `horizon`, then
    /// return the entry under the cursor.
    pub fn advance_to(&mut self, horizon: f64) -> Option<&Stamped<T>> {
        while !self.at_end() && self.entries[self.cursor + 1].stamp < horizon {
            self.cursor += 1;
        }
        self.entries.get(self.cursor)
    }

    pub fn current(&self) -> Option<&Stamped<T>> {
        self.entries.get(self.cursor)
    }
}

/// The teach run held in memory: commands and poses by time.
#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    commands: Timeline<Twist>,
    poses: Timeline<Pose>,
    /// Feed-forward horizon applied to command lookups, in seconds.
    lookahead: f64,
}

impl TrajectoryStore {
    pub fn new(commands: Vec<TimedCommand>, poses: Vec<TimedPose>) -> Self {
        Self {
            commands: Timeline::new(commands),
            poses: Timeline::new(poses),
            lookahead: 0.0,
        }
    }

    pub fn with_lookahead(mut self, lookahead: f64) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }

    pub fn set_lookahead(&mut self, lookahead: f64) {
        self.lookahead = lookahead;
    }

    /// Command to play at `time`, looking `lookahead` seconds ahead.
    pub fn command_at(&mut self, time: f64) -> Option<Twist> {
        let horizon = time + self.lookahead;
        self.commands.advance_to(horizon).map(|e| e.value)
    }

    /// Reference pose at `time`.
    pub fn pose_at(&mut self, time: f64) -> Option<Pose> {
        self.poses.advance_to(time).map(|e| e.value)
    }

    /// No command left to play past the current one.
    pub fn is_exhausted(&self) -> bool {
        self.commands.at_end()
    }

    pub fn commands(&self) -> &Timeline<Twist> {
        &self.commands
    }

    pub fn poses(&self) -> &Timeline<Pose> {
        &self.poses
    }

    /// Duration of the recorded command stream in seconds.
    pub fn duration(&self) -> f64 {
        self.commands.last_stamp().unwrap_or(0.0)
    }
}
