//! The repeat core: shared state, construction and the fixed-rate main loop.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::anchor::{AnchorPoint, AnchorSwitch, AnchorTracker};
use crate::config::{RepeatConfig, RepeatParams};
use crate::correction::CorrectionPipeline;
use crate::corrector::{CommandCorrector, ProportionalCorrector};
use crate::error::RepeatError;
use crate::frames::{resolve_transform, FrameSource};
use crate::geometry::{PointCloud, Pose, PoseDistance, Twist, WeightedDistance};
use crate::input::OperatorInput;
use crate::matcher::CloudMatcher;
use crate::output::{ReferencePose, RepeatOutputStreams, RepeatOutputs};
use crate::playback::{Playback, PlaybackEvent, PlaybackState};
use crate::records;
use crate::trajectory::TrajectoryStore;

/// Lock `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the main loop and correction tasks.
///
/// Lock order: playback, then trajectory, then anchors or corrector.
pub(crate) struct Core {
    pub(crate) playback: Mutex<Playback>,
    pub(crate) trajectory: Mutex<TrajectoryStore>,
    pub(crate) anchors: Mutex<AnchorTracker>,
    pub(crate) corrector: Mutex<Box<dyn CommandCorrector>>,
    pub(crate) outputs: RepeatOutputs,
}

impl Core {
    pub(crate) fn new(
        outputs: RepeatOutputs,
        trajectory: TrajectoryStore,
        anchors: AnchorTracker,
        corrector: Box<dyn CommandCorrector>,
    ) -> Self {
        Self {
            playback: Mutex::new(Playback::new(outputs.commands.clone())),
            trajectory: Mutex::new(trajectory),
            anchors: Mutex::new(anchors),
            corrector: Mutex::new(corrector),
            outputs,
        }
    }
}

/// Receiving ends consumed by [`Repeat::run`].
#[derive(Debug)]
pub struct RepeatInputs {
    pub scans: mpsc::Receiver<PointCloud>,
    pub operator: mpsc::Receiver<OperatorInput>,
    pub params: watch::Receiver<RepeatParams>,
}

/// Sending ends for feeding a running core.
#[derive(Debug, Clone)]
pub struct RepeatInputHandles {
    pub scans: mpsc::Sender<PointCloud>,
    pub operator: mpsc::Sender<OperatorInput>,
    pub params: Arc<watch::Sender<RepeatParams>>,
}

impl RepeatInputs {
    /// Create input channels sized from `config`. The parameter channel
    /// starts at `config.params`.
    pub fn channels(config: &RepeatConfig) -> (Self, RepeatInputHandles) {
        let (scans_tx, scans) = mpsc::channel(config.scan_queue);
        let (operator_tx, operator) = mpsc::channel(config.input_queue);
        let (params_tx, params) = watch::channel(config.params);
        (
            Self {
                scans,
                operator,
                params,
            },
            RepeatInputHandles {
                scans: scans_tx,
                operator: operator_tx,
                params: Arc::new(params_tx),
            },
        )
    }
}

/// What one main loop cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub sim_time: f64,
    pub state: PlaybackState,
    /// Corrected command, if one was published.
    pub command: Option<Twist>,
    pub reference_pose: Option<Pose>,
    pub anchor_switch: Option<AnchorSwitch>,
    /// The last recorded command has been reached; nothing was done.
    pub finished: bool,
}

/// Totals logged and returned when the main loop exits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub cycles: u64,
    pub commands_published: u64,
    pub scans_accepted: u64,
    pub scans_dropped: u64,
    pub anchor_switches: u64,
    pub final_state: PlaybackState,
    pub sim_time: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    cycles: u64,
    commands_published: u64,
    anchor_switches: u64,
}

/// Assembles a [`Repeat`] from configuration and injected backends.
pub struct RepeatBuilder {
    config: RepeatConfig,
    matcher: Option<Arc<dyn CloudMatcher>>,
    corrector: Option<Box<dyn CommandCorrector>>,
    distance: Option<Box<dyn PoseDistance>>,
    frames: Option<Arc<dyn FrameSource>>,
    lidar_to_robot: Option<Pose>,
    trajectory: Option<TrajectoryStore>,
    anchors: Option<Vec<AnchorPoint>>,
}

impl RepeatBuilder {
    pub fn new(config: RepeatConfig) -> Self {
        Self {
            config,
            matcher: None,
            corrector: None,
            distance: None,
            frames: None,
            lidar_to_robot: None,
            trajectory: None,
            anchors: None,
        }
    }

    /// Registration backend. Required.
    pub fn matcher(mut self, matcher: impl CloudMatcher + 'static) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    /// Defaults to a [`ProportionalCorrector`] with the configured gains.
    pub fn corrector(mut self, corrector: impl CommandCorrector + 'static) -> Self {
        self.corrector = Some(Box::new(corrector));
        self
    }

    /// Anchor distance metric. Defaults to [`WeightedDistance`].
    pub fn distance(mut self, distance: impl PoseDistance + 'static) -> Self {
        self.distance = Some(Box::new(distance));
        self
    }

    /// Frame source for the lidar to robot transform.
    pub fn frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Use a known lidar to robot transform instead of looking it up.
    pub fn lidar_to_robot(mut self, transform: Pose) -> Self {
        self.lidar_to_robot = Some(transform);
        self
    }

    /// Use an in-memory trajectory instead of loading it from disk.
    pub fn trajectory(mut self, trajectory: TrajectoryStore) -> Self {
        self.trajectory = Some(trajectory);
        self
    }

    /// Use in-memory anchors instead of loading them from disk.
    pub fn anchors(mut self, anchors: Vec<AnchorPoint>) -> Self {
        self.anchors = Some(anchors);
        self
    }

    pub async fn build(self) -> Result<(Repeat, RepeatOutputStreams), RepeatError> {
        let config = self.config;
        config.validate()?;
        let matcher = self.matcher.ok_or(RepeatError::MissingMatcher)?;

        let trajectory = match self.trajectory {
            Some(trajectory) => trajectory,
            None => load_trajectory(&config),
        };
        let anchors = match self.anchors {
            Some(anchors) => anchors,
            None => load_anchors(&config),
        };
        tracing::info!(
            "Loaded {} commands ({:.1}s), {} poses, {} anchor points",
            trajectory.commands().len(),
            trajectory.duration(),
            trajectory.poses().len(),
            anchors.len()
        );

        let lidar_to_robot = match (self.lidar_to_robot, self.frames) {
            (Some(transform), _) => transform,
            (None, Some(frames)) => {
                resolve_transform(
                    &*frames,
                    &config.robot_frame,
                    &config.lidar_frame,
                    config.transform_timeout(),
                )
                .await
            }
            (None, None) => {
                tracing::info!(
                    "No frame source, using identity for {} -> {}",
                    config.lidar_frame,
                    config.robot_frame
                );
                Pose::identity()
            }
        };
        tracing::info!(
            "Reference poses are in {}, scans in {}",
            config.world_frame,
            config.lidar_frame
        );

        let distance = self.distance.unwrap_or_else(|| {
            Box::new(WeightedDistance {
                angular_weight: config.anchor_angular_weight,
            })
        });
        let corrector = self
            .corrector
            .unwrap_or_else(|| Box::new(ProportionalCorrector::new(config.params.corrector)));

        let (outputs, streams) = RepeatOutputs::channels(&config);
        let core = Arc::new(Core::new(
            outputs,
            trajectory,
            AnchorTracker::with_boxed_distance(anchors, distance),
            corrector,
        ));
        let pipeline = CorrectionPipeline::new(Arc::clone(&core), matcher, lidar_to_robot)
            .with_service(&config.matching_service);

        let repeat = Repeat {
            config,
            core,
            pipeline,
            counters: Counters::default(),
        };
        repeat.apply_params(&repeat.config.params);
        Ok((repeat, streams))
    }
}

fn load_trajectory(config: &RepeatConfig) -> TrajectoryStore {
    let commands = records::load_commands(&config.commands_path()).unwrap_or_else(|e| {
        tracing::error!("Failed to load commands: {}", e);
        Vec::new()
    });
    let poses = records::load_poses(&config.poses_path()).unwrap_or_else(|e| {
        tracing::error!("Failed to load poses: {}", e);
        Vec::new()
    });
    TrajectoryStore::new(commands, poses)
}

fn load_anchors(config: &RepeatConfig) -> Vec<AnchorPoint> {
    records::load_anchor_points(&config.anchors_path()).unwrap_or_else(|e| {
        tracing::error!("Failed to load anchor points: {}", e);
        Vec::new()
    })
}

/// The repeat core.
pub struct Repeat {
    config: RepeatConfig,
    core: Arc<Core>,
    pipeline: CorrectionPipeline,
    counters: Counters,
}

impl Repeat {
    pub fn builder(config: RepeatConfig) -> RepeatBuilder {
        RepeatBuilder::new(config)
    }

    pub fn config(&self) -> &RepeatConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &CorrectionPipeline {
        &self.pipeline
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.core.playback).state()
    }

    pub fn sim_time(&self) -> f64 {
        lock(&self.core.playback).sim_time()
    }

    /// True once the command cursor sits on the last recorded command.
    pub fn is_finished(&self) -> bool {
        lock(&self.core.trajectory).is_exhausted()
    }

    /// Run one main loop cycle.
    pub fn step(&mut self) -> StepReport {
        let playback = lock(&self.core.playback);
        let sim_time = playback.sim_time();
        let state = playback.state();
        let mut trajectory = lock(&self.core.trajectory);

        let mut report = StepReport {
            sim_time,
            state,
            command: None,
            reference_pose: None,
            anchor_switch: None,
            finished: false,
        };
        if trajectory.is_exhausted() {
            report.finished = true;
            return report;
        }
        self.counters.cycles += 1;

        let pose = trajectory.pose_at(sim_time);
        if let Some(pose) = pose {
            let switch = lock(&self.core.anchors).advance_if_closer(&pose, sim_time);
            if let Some(switch) = switch {
                tracing::info!(
                    "Switching to anchor point {} at {:.3}s",
                    switch.anchor,
                    sim_time
                );
                self.counters.anchor_switches += 1;
                self.core.outputs.anchor_switches.publish(switch.clone());
                report.anchor_switch = Some(switch);
            }
        }

        if state == PlaybackState::Play {
            if let Some(command) = trajectory.command_at(sim_time) {
                let corrected = lock(&self.core.corrector).correct_command(command);
                self.core.outputs.commands.publish(corrected);
                self.counters.commands_published += 1;
                report.command = Some(corrected);
            }
        }

        if let Some(pose) = pose {
            self.core
                .outputs
                .reference_poses
                .publish(ReferencePose { sim_time, pose });
            report.reference_pose = Some(pose);
        }
        report
    }

    pub fn handle_input(&self, input: &OperatorInput) {
        for event in input.events(&self.config.buttons) {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&self, event: PlaybackEvent) -> Option<PlaybackState> {
        let next = lock(&self.core.playback).handle(event);
        if let Some(state) = next {
            tracing::debug!("{:?} -> {}", event, state);
        }
        next
    }

    /// Apply runtime parameters. They take effect on next use.
    pub fn apply_params(&self, params: &RepeatParams) {
        lock(&self.core.trajectory).set_lookahead(params.lookahead);
        lock(&self.core.corrector).update_params(&params.corrector);
        tracing::debug!("Applied parameters: {:?}", params);
    }

    /// Hand a scan to the correction pipeline.
    pub fn submit_scan(&self, scan: PointCloud) {
        self.pipeline.submit(scan);
    }

    pub fn summary(&self) -> RunSummary {
        let playback = lock(&self.core.playback);
        RunSummary {
            cycles: self.counters.cycles,
            commands_published: self.counters.commands_published,
            scans_accepted: self.pipeline.guard().accepted(),
            scans_dropped: self.pipeline.guard().dropped(),
            anchor_switches: self.counters.anchor_switches,
            final_state: playback.state(),
            sim_time: playback.sim_time(),
        }
    }

    /// Run the main loop until the trajectory ends or `cancel` fires.
    ///
    /// On exit the scan input is closed and any in-flight registration is
    /// awaited before the summary is returned.
    pub async fn run(mut self, mut inputs: RepeatInputs, cancel: CancellationToken) -> RunSummary {
        let mut ticker = tokio::time::interval(self.config.loop_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut scans_open = true;
        let mut operator_open = true;
        let mut params_open = true;

        tracing::info!(
            "Repeat running at {} Hz from {}, scans from {}, operator input from {}",
            self.config.loop_rate_hz,
            self.config.working_directory.display(),
            self.config.source_topic,
            self.config.joy_topic
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Repeat cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    if self.step().finished {
                        tracing::info!("Reached the end of the recorded commands");
                        break;
                    }
                }

                changed = inputs.params.changed(), if params_open => match changed {
                    Ok(()) => {
                        let params = *inputs.params.borrow_and_update();
                        self.apply_params(&params);
                    }
                    Err(_) => params_open = false,
                },

                input = inputs.operator.recv(), if operator_open => match input {
                    Some(input) => self.handle_input(&input),
                    None => operator_open = false,
                },

                scan = inputs.scans.recv(), if scans_open => match scan {
                    Some(scan) => self.submit_scan(scan),
                    None => scans_open = false,
                },
            }
        }

        inputs.scans.close();
        self.pipeline.shutdown().await;

        let summary = self.summary();
        tracing::info!(
            "Repeat finished in {} after {} cycles at {:.3}s: {} commands, \
             {} anchor switches, {} scans matched, {} dropped",
            summary.final_state,
            summary.cycles,
            summary.sim_time,
            summary.commands_published,
            summary.anchor_switches,
            summary.scans_accepted,
            summary.scans_dropped
        );
        summary
    }
}
