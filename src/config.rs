//! Startup configuration and runtime-tunable parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::corrector::CorrectorParams;
use crate::input::ControllerMapping;

/// Errors loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Parameters that may change while playback runs. Applied on next use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatParams {
    /// Feed-forward horizon for command lookup, in seconds.
    pub lookahead: f64,
    pub corrector: CorrectorParams,
}

impl Default for RepeatParams {
    fn default() -> Self {
        Self {
            lookahead: 0.0,
            corrector: CorrectorParams::default(),
        }
    }
}

/// Everything fixed at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    /// Directory holding the teach records.
    pub working_directory: PathBuf,

    pub source_topic: String,
    pub command_topic: String,
    pub reference_pose_topic: String,
    pub error_topic: String,
    pub anchor_switch_topic: String,
    pub joy_topic: String,
    pub matching_service: String,

    pub lidar_frame: String,
    pub robot_frame: String,
    pub world_frame: String,

    /// Main loop frequency in Hz.
    pub loop_rate_hz: f64,
    /// Bounded wait for the lidar → robot transform at startup, in seconds.
    pub transform_timeout_secs: f64,

    pub scan_queue: usize,
    pub input_queue: usize,
    pub output_queue: usize,

    pub commands_file: String,
    pub poses_file: String,
    pub anchors_file: String,

    /// Weight of orientation in the anchor distance, meters per radian.
    pub anchor_angular_weight: f64,

    pub buttons: ControllerMapping,
    /// Initial values of the runtime parameters.
    pub params: RepeatParams,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("."),
            source_topic: "/cloud".to_string(),
            command_topic: "/teach_repeat/desired_command".to_string(),
            reference_pose_topic: "/teach_repeat/reference_pose".to_string(),
            error_topic: "/teach_repeat/raw_error".to_string(),
            anchor_switch_topic: "/teach_repeat/ap_switch".to_string(),
            joy_topic: "/joy".to_string(),
            matching_service: "/match_clouds".to_string(),
            lidar_frame: "/velodyne".to_string(),
            robot_frame: "/base_link".to_string(),
            world_frame: "/odom".to_string(),
            loop_rate_hz: 100.0,
            transform_timeout_secs: 5.0,
            scan_queue: 10,
            input_queue: 1000,
            output_queue: 1000,
            commands_file: "speeds.sl".to_string(),
            poses_file: "positions.pl".to_string(),
            anchors_file: "anchorPoints.apd".to_string(),
            anchor_angular_weight: 0.1,
            buttons: ControllerMapping::default(),
            params: RepeatParams::default(),
        }
    }
}

impl RepeatConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let period = Some(self.loop_rate_hz)
            .filter(|rate| *rate > 0.0)
            .and_then(|rate| Duration::try_from_secs_f64(1.0 / rate).ok())
            .filter(|period| !period.is_zero());
        if period.is_none() {
            return Err(ConfigError::Invalid(format!(
                "loop_rate_hz must be positive with a non-zero period, got {}",
                self.loop_rate_hz
            )));
        }
        if Duration::try_from_secs_f64(self.transform_timeout_secs).is_err() {
            return Err(ConfigError::Invalid(format!(
                "transform_timeout_secs must be a non-negative duration, got {}",
                self.transform_timeout_secs
            )));
        }
        for (name, value) in [
            ("scan_queue", self.scan_queue),
            ("input_queue", self.input_queue),
            ("output_queue", self.output_queue),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        if !self.params.lookahead.is_finite() {
            return Err(ConfigError::Invalid("lookahead must be finite".to_string()));
        }
        Ok(())
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.loop_rate_hz)
    }

    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.transform_timeout_secs)
    }

    pub fn commands_path(&self) -> PathBuf {
        self.working_directory.join(&self.commands_file)
    }

    pub fn poses_path(&self) -> PathBuf {
        self.working_directory.join(&self.poses_file)
    }

    pub fn anchors_path(&self) -> PathBuf {
        self.working_directory.join(&self.anchors_file)
    }
}
