//! Coordinate frame lookup at startup.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::time::{Duration, Instant};

use crate::geometry::Pose;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Source of rigid transforms between named frames.
pub trait FrameSource: Send + Sync {
    /// Transform taking coordinates in `source` into `target`, if known yet.
    fn lookup(&self, target: &str, source: &str) -> Option<Pose>;
}

/// In-memory transform table. Transforms may be added while a lookup waits.
#[derive(Debug, Default)]
pub struct StaticFrames {
    transforms: RwLock<HashMap<(String, String), Pose>>,
}

impl StaticFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, target: &str, source: &str, transform: Pose) -> Self {
        self.insert(target, source, transform);
        self
    }

    pub fn insert(&self, target: &str, source: &str, transform: Pose) {
        let mut transforms = self
            .transforms
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        transforms.insert((target.to_string(), source.to_string()), transform);
    }
}

impl FrameSource for StaticFrames {
    fn lookup(&self, target: &str, source: &str) -> Option<Pose> {
        if target == source {
            return Some(Pose::identity());
        }
        let transforms = self
            .transforms
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        transforms
            .get(&(target.to_string(), source.to_string()))
            .copied()
            .or_else(|| {
                transforms
                    .get(&(source.to_string(), target.to_string()))
                    .map(|t| t.inverse())
            })
    }
}

/// Wait up to `timeout` for the `source` → `target` transform.
///
/// On timeout a warning is logged and identity is returned.
pub async fn resolve_transform(
    frames: &dyn FrameSource,
    target: &str,
    source: &str,
    timeout: Duration,
) -> Pose {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(transform) = frames.lookup(target, source) {
            tracing::info!("Resolved transform {} -> {}", source, target);
            return transform;
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                "Transform {} -> {} unavailable after {:.1}s, using identity",
                source,
                target,
                timeout.as_secs_f64()
            );
            return Pose::identity();
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::planar_pose;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_resolves_known_transform() {
        let frames =
            StaticFrames::new().with("/base_link", "/velodyne", planar_pose(0.2, 0.0, 0.0));
        let t =
            resolve_transform(&frames, "/base_link", "/velodyne", Duration::from_secs(5)).await;
        assert_eq!(t.translation.vector.x, 0.2);

        let inverse =
            resolve_transform(&frames, "/velodyne", "/base_link", Duration::from_secs(5)).await;
        assert!((inverse.translation.vector.x + 0.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_identity() {
        let frames = StaticFrames::new();
        let start = Instant::now();
        let t =
            resolve_transform(&frames, "/base_link", "/velodyne", Duration::from_secs(5)).await;
        assert_eq!(t, Pose::identity());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_late_transform() {
        let frames = Arc::new(StaticFrames::new());
        let publisher = Arc::clone(&frames);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher.insert("/base_link", "/velodyne", planar_pose(0.0, 0.5, 0.0));
        });

        let t =
            resolve_transform(&*frames, "/base_link", "/velodyne", Duration::from_secs(5)).await;
        assert_eq!(t.translation.vector.y, 0.5);
    }
}
