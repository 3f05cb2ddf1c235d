//! Anchor points along the taught path and the nearest-anchor walk.

use std::sync::Arc;
use std::time::SystemTime;

use crate::geometry::{PointCloud, Pose, PoseDistance, WeightedDistance};

/// A waypoint with the reference scan recorded there during teach.
#[derive(Debug, Clone)]
pub struct AnchorPoint {
    name: String,
    pose: Pose,
    cloud: Arc<PointCloud>,
}

impl AnchorPoint {
    pub fn new(name: impl Into<String>, pose: Pose, cloud: PointCloud) -> Self {
        Self {
            name: name.into(),
            pose,
            cloud: Arc::new(cloud),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn cloud(&self) -> &Arc<PointCloud> {
        &self.cloud
    }
}

/// Notification emitted when the tracker moves to the next anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSwitch {
    /// Wall-clock time of the switch.
    pub stamp: SystemTime,
    /// Sim time at which the switch happened.
    pub sim_time: f64,
    /// Name of the anchor that became current.
    pub anchor: String,
}

/// Forward-only cursor over the anchor sequence.
pub struct AnchorTracker {
    anchors: Vec<AnchorPoint>,
    cursor: usize,
    distance: Box<dyn PoseDistance>,
}

impl AnchorTracker {
    pub fn new(anchors: Vec<AnchorPoint>) -> Self {
        Self::with_distance(anchors, WeightedDistance::default())
    }

    pub fn with_distance(anchors: Vec<AnchorPoint>, distance: impl PoseDistance + 'static) -> Self {
        Self::with_boxed_distance(anchors, Box::new(distance))
    }

    pub fn with_boxed_distance(anchors: Vec<AnchorPoint>, distance: Box<dyn PoseDistance>) -> Self {
        Self {
            anchors,
            cursor: 0,
            distance,
        }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&AnchorPoint> {
        self.anchors.get(self.cursor)
    }

    fn next(&self) -> Option<&AnchorPoint> {
        self.anchors.get(self.cursor + 1)
    }

    /// Step to the next anchor if it is at least as close to `pose` as the current one.
    ///
    /// Moves at most one anchor per call. Ties advance.
    pub fn advance_if_closer(&mut self, pose: &Pose, sim_time: f64) -> Option<AnchorSwitch> {
        let current = self.current()?;
        let to_current = self.distance.distance(pose, current.pose());
        let to_next = self
            .next()
            .map(|next| self.distance.distance(pose, next.pose()))
            .unwrap_or(f64::INFINITY);

        if self.next().is_none() || to_next > to_current {
            return None;
        }

        self.cursor += 1;
        let anchor = self.anchors[self.cursor].name().to_string();
        tracing::debug!(
            "Anchor distances: current {:.3}, next {:.3}",
            to_current,
            to_next
        );
        Some(AnchorSwitch {
            stamp: SystemTime::now(),
            sim_time,
            anchor,
        })
    }
}

impl std::fmt::Debug for AnchorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorTracker")
            .field("anchors", &self.anchors.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}
