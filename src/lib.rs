//! Repeat side of a teach-and-repeat navigation system.
//!
//! A teach run records timed velocity commands, timed reference poses and a
//! sequence of anchor points, each with the point cloud seen there. This crate
//! replays that run:
//!
//! - A virtual playback clock drives lookup of the recorded commands and poses.
//! - Live scans are registered against the current anchor's reference cloud and
//!   the resulting pose error feeds a command corrector.
//! - A PLAY / PAUSE / ERROR state machine is driven by operator input and by
//!   registration failures. Stopping always sends an idle command.
//!
//! # Quick Start
//!
//! ```ignore
//! use teach_repeat::{Repeat, RepeatConfig, RepeatInputs, Registration, MatchError, PointCloud};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = RepeatConfig::default().with_working_directory("/data/teach1");
//! let (repeat, mut outputs) = Repeat::builder(config.clone())
//!     .matcher(|reading: &PointCloud, reference: &PointCloud| my_icp(reading, reference))
//!     .build()
//!     .await?;
//!
//! let (inputs, handles) = RepeatInputs::channels(&config);
//! let summary = repeat.run(inputs, CancellationToken::new()).await;
//! ```
//!
//! Transport is left to the caller: inputs and outputs are plain `tokio`
//! channels.

pub mod anchor;
pub mod clock;
pub mod config;
pub mod correction;
pub mod corrector;
pub mod error;
pub mod frames;
pub mod geometry;
pub mod input;
pub mod matcher;
pub mod output;
pub mod playback;
pub mod records;
pub mod repeat;
pub mod trajectory;

pub use anchor::{AnchorPoint, AnchorSwitch, AnchorTracker};
pub use clock::SimClock;
pub use config::{ConfigError, RepeatConfig, RepeatParams};
pub use correction::{CorrectionPipeline, ScanOutcome};
pub use corrector::{CommandCorrector, CorrectorParams, Passthrough, ProportionalCorrector};
pub use error::RepeatError;
pub use frames::{resolve_transform, FrameSource, StaticFrames};
pub use geometry::{PointCloud, Pose, PoseDistance, PoseError, Twist, WeightedDistance};
pub use input::{Button, ButtonSnapshot, ControllerMapping, OperatorInput};
pub use matcher::{CloudMatcher, MatchError, MatchGuard, Registration};
pub use output::{ErrorReport, Publisher, ReferencePose, RepeatOutputStreams, RepeatOutputs};
pub use playback::{Playback, PlaybackEvent, PlaybackState};
pub use records::RecordError;
pub use repeat::{Repeat, RepeatBuilder, RepeatInputHandles, RepeatInputs, RunSummary, StepReport};
pub use trajectory::{Stamped, TimedCommand, TimedPose, Timeline, TrajectoryStore};
