//! Output streams produced by the repeat core.
//!
//! Each stream is a bounded `broadcast` channel. Publishing never blocks: a
//! full queue evicts its oldest message, so the newest one (in particular the
//! idle command sent on every stop) always reaches a lagging subscriber.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::anchor::AnchorSwitch;
use crate::config::RepeatConfig;
use crate::geometry::{Pose, PoseError, Twist};

/// Reference pose of the teach run at a sim time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePose {
    pub sim_time: f64,
    pub pose: Pose,
}

/// Pose error computed from one successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub sim_time: f64,
    /// Anchor whose reference cloud the scan was matched against.
    pub anchor: String,
    pub error: PoseError,
}

/// Non-blocking sending half of a named output stream.
#[derive(Debug, Clone)]
pub struct Publisher<T> {
    topic: String,
    tx: broadcast::Sender<T>,
    capacity: usize,
}

impl<T: Clone> Publisher<T> {
    pub fn new(topic: impl Into<String>, tx: broadcast::Sender<T>, capacity: usize) -> Self {
        Self {
            topic: topic.into(),
            tx,
            capacity,
        }
    }

    /// Create a publisher and its receiving half. `capacity` must be non-zero.
    pub fn channel(topic: impl Into<String>, capacity: usize) -> (Self, broadcast::Receiver<T>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self::new(topic, tx, capacity), rx)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue `msg`, evicting the oldest queued message if the queue is full.
    ///
    /// Returns false only when nobody is subscribed.
    pub fn publish(&self, msg: T) -> bool {
        if self.tx.len() >= self.capacity {
            tracing::warn!(
                "{}: output queue full, dropping oldest message",
                self.topic
            );
        }
        match self.tx.send(msg) {
            Ok(_) => true,
            Err(_) => {
                tracing::trace!("{}: no subscriber", self.topic);
                false
            }
        }
    }
}

/// Take every message currently queued on `rx`, skipping past evicted ones.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(msg) => out.push(msg),
            Err(TryRecvError::Lagged(missed)) => {
                tracing::debug!("Subscriber lagged, {} messages evicted", missed);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    out
}

/// Publishers for every output of the core.
#[derive(Debug, Clone)]
pub struct RepeatOutputs {
    pub commands: Publisher<Twist>,
    pub reference_poses: Publisher<ReferencePose>,
    pub anchor_switches: Publisher<AnchorSwitch>,
    pub errors: Publisher<ErrorReport>,
}

/// Receiving halves matching [`RepeatOutputs`].
#[derive(Debug)]
pub struct RepeatOutputStreams {
    pub commands: broadcast::Receiver<Twist>,
    pub reference_poses: broadcast::Receiver<ReferencePose>,
    pub anchor_switches: broadcast::Receiver<AnchorSwitch>,
    pub errors: broadcast::Receiver<ErrorReport>,
}

impl RepeatOutputs {
    /// Create all output channels, named after the topics in `config`.
    pub fn channels(config: &RepeatConfig) -> (Self, RepeatOutputStreams) {
        let capacity = config.output_queue;
        let (commands, commands_rx) = Publisher::channel(&config.command_topic, capacity);
        let (reference_poses, poses_rx) =
            Publisher::channel(&config.reference_pose_topic, capacity);
        let (anchor_switches, switches_rx) =
            Publisher::channel(&config.anchor_switch_topic, capacity);
        let (errors, errors_rx) = Publisher::channel(&config.error_topic, capacity);

        (
            Self {
                commands,
                reference_poses,
                anchor_switches,
                errors,
            },
            RepeatOutputStreams {
                commands: commands_rx,
                reference_poses: poses_rx,
                anchor_switches: switches_rx,
                errors: errors_rx,
            },
        )
    }
}

impl RepeatOutputStreams {
    /// Drain every command currently queued.
    pub fn drain_commands(&mut self) -> Vec<Twist> {
        drain(&mut self.commands)
    }
}
