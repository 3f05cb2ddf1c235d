//! Command correction from registration errors.

use serde::{Deserialize, Serialize};

use crate::geometry::{PoseError, Twist};

/// Tunable gains and limits of the command corrector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectorParams {
    /// Forward speed correction per meter of along-track error.
    pub gain_along_track: f64,
    /// Yaw rate correction per meter of cross-track error.
    pub gain_cross_track: f64,
    /// Yaw rate correction per radian of heading error.
    pub gain_heading: f64,
    /// Absolute limit on the corrected forward speed (m/s).
    pub max_linear_speed: f64,
    /// Absolute limit on the corrected yaw rate (rad/s).
    pub max_angular_speed: f64,
}

impl Default for CorrectorParams {
    fn default() -> Self {
        Self {
            gain_along_track: 0.1,
            gain_cross_track: 0.3,
            gain_heading: 0.6,
            max_linear_speed: 1.0,
            max_angular_speed: 1.5,
        }
    }
}

/// Turns a recorded command into the command actually sent to the robot.
///
/// `update_error` is only ever called by the correction pipeline while it holds
/// the match guard.
pub trait CommandCorrector: Send {
    fn correct_command(&mut self, command: Twist) -> Twist;

    fn update_error(&mut self, error: &PoseError);

    fn update_params(&mut self, params: &CorrectorParams);
}

/// Plays recorded commands unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl CommandCorrector for Passthrough {
    fn correct_command(&mut self, command: Twist) -> Twist {
        command
    }

    fn update_error(&mut self, _error: &PoseError) {}

    fn update_params(&mut self, _params: &CorrectorParams) {}
}

/// Proportional correction on the latest pose error.
#[derive(Debug, Clone, Default)]
pub struct ProportionalCorrector {
    params: CorrectorParams,
    error: PoseError,
    updates: u64,
}

impl ProportionalCorrector {
    pub fn new(params: CorrectorParams) -> Self {
        Self {
            params,
            error: PoseError::default(),
            updates: 0,
        }
    }

    pub fn error(&self) -> &PoseError {
        &self.error
    }

    pub fn params(&self) -> &CorrectorParams {
        &self.params
    }

    /// Number of error updates received so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl CommandCorrector for ProportionalCorrector {
    fn correct_command(&mut self, command: Twist) -> Twist {
        // An idle command stays idle: never creep while the teach run stood still.
        if command.is_idle() {
            return command;
        }

        let p = &self.params;
        let e = &self.error;
        let direction = if command.linear.x < 0.0 { -1.0 } else { 1.0 };

        let mut out = command;
        out.linear.x = (command.linear.x - p.gain_along_track * e.x)
            .clamp(-p.max_linear_speed, p.max_linear_speed);
        out.angular.z = (command.angular.z
            - direction * p.gain_cross_track * e.y
            - p.gain_heading * e.heading)
            .clamp(-p.max_angular_speed, p.max_angular_speed);
        out
    }

    fn update_error(&mut self, error: &PoseError) {
        self.error = *error;
        self.updates += 1;
    }

    fn update_params(&mut self, params: &CorrectorParams) {
        self.params = *params;
    }
}
