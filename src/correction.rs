//! Per-scan drift correction.
//!
//! Every incoming scan gets its own task. The scan is moved into the current
//! anchor's frame using the reference pose at sim time, then matched against
//! the anchor's reference cloud if no other match is in flight. Scans that
//! find the matcher busy are dropped, never queued.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::corrector::CommandCorrector;
use crate::geometry::{transform_between, PointCloud, Pose, PoseError};
use crate::matcher::{CloudMatcher, GuardError, MatchError, MatchGuard};
use crate::output::ErrorReport;
use crate::playback::PlaybackEvent;
use crate::repeat::{lock, Core};

/// What happened to one scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Registration succeeded and the corrector was updated.
    Matched(ErrorReport),
    /// Another registration was in flight.
    Dropped,
    /// Registration failed; playback was switched to ERROR.
    Failed,
    /// No reference pose or anchor to match against.
    Skipped,
    /// The pipeline is shutting down.
    Closed,
}

/// Handle to the correction pipeline. Cheap to clone.
#[derive(Clone)]
pub struct CorrectionPipeline {
    core: Arc<Core>,
    matcher: Arc<dyn CloudMatcher>,
    guard: Arc<MatchGuard>,
    /// Fixed transform from the sensor frame to the robot frame.
    lidar_to_robot: Pose,
    /// Name of the registration service, for diagnostics.
    service: Arc<str>,
    tasks: TaskTracker,
}

impl CorrectionPipeline {
    pub(crate) fn new(
        core: Arc<Core>,
        matcher: Arc<dyn CloudMatcher>,
        lidar_to_robot: Pose,
    ) -> Self {
        Self {
            core,
            matcher,
            guard: Arc::new(MatchGuard::new()),
            lidar_to_robot,
            service: Arc::from("registration"),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn with_service(mut self, service: &str) -> Self {
        self.service = Arc::from(service);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn guard(&self) -> &MatchGuard {
        &self.guard
    }

    pub fn lidar_to_robot(&self) -> &Pose {
        &self.lidar_to_robot
    }

    /// Process `scan` on its own task.
    pub fn submit(&self, scan: PointCloud) {
        let pipeline = self.clone();
        self.tasks.spawn(async move {
            pipeline.process(scan).await;
        });
    }

    /// Run the full correction for one scan.
    pub async fn process(&self, scan: PointCloud) -> ScanOutcome {
        let sim_time = lock(&self.core.playback).sim_time();
        let Some(pose) = lock(&self.core.trajectory).pose_at(sim_time) else {
            tracing::debug!("No reference pose at {:.3}s, skipping scan", sim_time);
            return ScanOutcome::Skipped;
        };
        let Some(anchor) = lock(&self.core.anchors).current().cloned() else {
            tracing::debug!("No anchor point loaded, skipping scan");
            return ScanOutcome::Skipped;
        };

        let to_anchor = transform_between(&pose, anchor.pose()) * self.lidar_to_robot;
        let reading = scan.transformed(&to_anchor);

        let permit = match self.guard.try_acquire() {
            Ok(permit) => permit,
            Err(GuardError::Busy) => {
                tracing::info!(
                    "Point matching busy, dropped a cloud ({} dropped so far)",
                    self.guard.dropped()
                );
                return ScanOutcome::Dropped;
            }
            Err(GuardError::Closed) => return ScanOutcome::Closed,
        };

        let matcher = Arc::clone(&self.matcher);
        let reference = Arc::clone(anchor.cloud());
        let result = tokio::task::spawn_blocking(move || matcher.match_clouds(&reading, &reference))
            .await
            .unwrap_or_else(|e| Err(MatchError::Aborted(e.to_string())));

        let outcome = match result {
            Ok(registration) if registration.converged => {
                let error = PoseError::from_transform(&registration.transform);
                lock(&self.core.corrector).update_error(&error);
                let report = ErrorReport {
                    sim_time,
                    anchor: anchor.name().to_string(),
                    error,
                };
                tracing::debug!(
                    "Registration against {}: x {:.3} y {:.3} heading {:.3}",
                    report.anchor,
                    error.x,
                    error.y,
                    error.heading
                );
                self.core.outputs.errors.publish(report.clone());
                ScanOutcome::Matched(report)
            }
            Ok(_) => self.fail(MatchError::NotConverged),
            Err(e) => self.fail(e),
        };

        drop(permit);
        outcome
    }

    fn fail(&self, error: MatchError) -> ScanOutcome {
        tracing::warn!(
            "There was a problem with the point matching service {}: {}",
            self.service,
            error
        );
        lock(&self.core.playback).handle(PlaybackEvent::Fault);
        ScanOutcome::Failed
    }

    /// Stop accepting work and wait until no registration is running.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.guard.drain().await;
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorPoint;
    use crate::config::RepeatConfig;
    use crate::corrector::ProportionalCorrector;
    use crate::geometry::planar_pose;
    use crate::matcher::Registration;
    use crate::output::{RepeatOutputStreams, RepeatOutputs};
    use crate::playback::PlaybackState;
    use crate::trajectory::{Stamped, TrajectoryStore};
    use nalgebra::Point3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Duration;

    fn core(anchor_pose: Pose, robot_pose: Pose) -> (Arc<Core>, RepeatOutputStreams) {
        let (outputs, streams) = RepeatOutputs::channels(&RepeatConfig::default());
        let trajectory = TrajectoryStore::new(vec![], vec![Stamped::new(0.0, robot_pose)]);
        let anchors = vec![AnchorPoint::new(
            "ap0",
            anchor_pose,
            PointCloud::new(0.0, vec![Point3::origin()]),
        )];
        let core = Core::new(
            outputs,
            trajectory,
            crate::anchor::AnchorTracker::new(anchors),
            Box::new(ProportionalCorrector::default()),
        );
        (Arc::new(core), streams)
    }

    fn scan() -> PointCloud {
        PointCloud::new(0.0, vec![Point3::origin()])
    }

    /// A matcher that blocks until released, counting concurrent calls.
    struct GatedMatcher {
        entered: std::sync::mpsc::SyncSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl CloudMatcher for GatedMatcher {
        fn match_clouds(
            &self,
            _reading: &PointCloud,
            _reference: &PointCloud,
        ) -> Result<Registration, MatchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Registration::converged(planar_pose(0.1, 0.0, 0.0)))
        }
    }

    fn gated() -> (
        Arc<GatedMatcher>,
        std::sync::mpsc::Receiver<()>,
        std::sync::mpsc::Sender<()>,
    ) {
        let (entered_tx, entered_rx) = std::sync::mpsc::sync_channel(16);
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let matcher = Arc::new(GatedMatcher {
            entered: entered_tx,
            release: Mutex::new(release_rx),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        (matcher, entered_rx, release_tx)
    }

    #[tokio::test]
    async fn test_scan_is_moved_into_anchor_frame() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let matcher =
            move |reading: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
                *record.lock().unwrap() = Some(reading.clone());
                Ok(Registration::converged(Pose::identity()))
            };

        let (core, _streams) = core(planar_pose(0.0, 0.0, 0.0), planar_pose(1.0, 0.0, 0.0));
        let pipeline =
            CorrectionPipeline::new(core, Arc::new(matcher), planar_pose(0.5, 0.0, 0.0));
        let outcome = pipeline.process(scan()).await;
        assert!(matches!(outcome, ScanOutcome::Matched(_)));

        let reading = seen.lock().unwrap().clone().unwrap();
        assert!((reading.points[0] - Point3::new(1.5, 0.0, 0.0)).norm() < 1e-9);
    }

    #[tokio::test]
    async fn test_success_updates_corrector_and_reports() {
        let matcher = |_: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
            Ok(Registration::converged(planar_pose(0.2, -0.1, 0.0)))
        };
        let (core, mut streams) = core(Pose::identity(), Pose::identity());
        let pipeline =
            CorrectionPipeline::new(Arc::clone(&core), Arc::new(matcher), Pose::identity());

        let outcome = pipeline.process(scan()).await;
        let ScanOutcome::Matched(report) = outcome else {
            panic!("expected a match, got {:?}", outcome);
        };
        assert_eq!(report.anchor, "ap0");
        assert!((report.error.x - 0.2).abs() < 1e-9);

        let published = streams.errors.try_recv().unwrap();
        assert_eq!(published, report);

        // The corrector now steers against the reported cross-track error.
        let corrected =
            lock(&core.corrector).correct_command(crate::geometry::Twist::planar(0.5, 0.0));
        assert!(corrected.angular.z > 0.0);
        assert!(!pipeline.guard().is_busy());
    }

    #[tokio::test]
    async fn test_failure_switches_to_error_and_releases_guard() {
        let matcher = |_: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
            Err(MatchError::Unavailable("/match_clouds".to_string()))
        };
        let (core, mut streams) = core(Pose::identity(), Pose::identity());
        lock(&core.playback).handle(PlaybackEvent::Resume);
        let pipeline =
            CorrectionPipeline::new(Arc::clone(&core), Arc::new(matcher), Pose::identity());

        assert_eq!(pipeline.process(scan()).await, ScanOutcome::Failed);
        assert_eq!(lock(&core.playback).state(), PlaybackState::Error);
        assert!(!pipeline.guard().is_busy());
        assert!(streams.errors.try_recv().is_err());

        let idle = streams.drain_commands();
        assert_eq!(idle.len(), 1);
        assert!(idle[0].is_idle());
    }

    #[tokio::test]
    async fn test_not_converged_is_a_failure() {
        let matcher = |_: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
            Ok(Registration {
                converged: false,
                transform: Pose::identity(),
            })
        };
        let (core, _streams) = core(Pose::identity(), Pose::identity());
        let pipeline =
            CorrectionPipeline::new(Arc::clone(&core), Arc::new(matcher), Pose::identity());
        assert_eq!(pipeline.process(scan()).await, ScanOutcome::Failed);
        assert_eq!(lock(&core.playback).state(), PlaybackState::Error);
    }

    #[tokio::test]
    async fn test_panicking_matcher_is_a_failure() {
        let matcher = |_: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
            panic!("matcher crashed")
        };
        let (core, _streams) = core(Pose::identity(), Pose::identity());
        let pipeline =
            CorrectionPipeline::new(Arc::clone(&core), Arc::new(matcher), Pose::identity());
        assert_eq!(pipeline.process(scan()).await, ScanOutcome::Failed);
        assert!(!pipeline.guard().is_busy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_admits_exactly_one_match() {
        const SCANS: usize = 8;
        let (matcher, entered, release) = gated();
        let (core, _streams) = core(Pose::identity(), Pose::identity());
        let pipeline = CorrectionPipeline::new(core, matcher.clone(), Pose::identity());

        for _ in 0..SCANS {
            pipeline.submit(scan());
        }

        // Every scan has either entered the matcher or been dropped.
        let guard = Arc::clone(&pipeline.guard);
        tokio::time::timeout(Duration::from_secs(5), async {
            while (guard.accepted() + guard.dropped()) < SCANS as u64 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(guard.accepted(), 1);
        assert_eq!(guard.dropped(), (SCANS - 1) as u64);
        tokio::task::spawn_blocking(move || entered.recv().unwrap())
            .await
            .unwrap();

        release.send(()).unwrap();
        pipeline.shutdown().await;
        assert_eq!(matcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_flight_match_completes_after_pause() {
        let (matcher, entered, release) = gated();
        let (core, mut streams) = core(Pose::identity(), Pose::identity());
        lock(&core.playback).handle(PlaybackEvent::Resume);
        let pipeline = CorrectionPipeline::new(Arc::clone(&core), matcher, Pose::identity());

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.process(scan()).await }
        });
        tokio::task::spawn_blocking(move || entered.recv().unwrap())
            .await
            .unwrap();

        // A second scan while the first is running is dropped.
        assert_eq!(pipeline.process(scan()).await, ScanOutcome::Dropped);

        lock(&core.playback).handle(PlaybackEvent::Pause);
        release.send(()).unwrap();

        assert!(matches!(first.await.unwrap(), ScanOutcome::Matched(_)));
        assert!(streams.errors.try_recv().is_ok());
        assert_eq!(lock(&core.playback).state(), PlaybackState::Pause);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_registration() {
        let (matcher, entered, release) = gated();
        let (core, _streams) = core(Pose::identity(), Pose::identity());
        let pipeline = CorrectionPipeline::new(core, matcher.clone(), Pose::identity());

        pipeline.submit(scan());
        tokio::task::spawn_blocking(move || entered.recv().unwrap())
            .await
            .unwrap();

        let shutdown = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());

        release.send(()).unwrap();
        shutdown.await.unwrap();
        assert_eq!(matcher.in_flight.load(Ordering::SeqCst), 0);

        // Scans after shutdown never reach the matcher.
        assert_eq!(pipeline.process(scan()).await, ScanOutcome::Closed);
    }

    #[tokio::test]
    async fn test_no_anchor_skips() {
        let (outputs, _streams) = RepeatOutputs::channels(&RepeatConfig::default());
        let core = Core::new(
            outputs,
            TrajectoryStore::new(vec![], vec![Stamped::new(0.0, Pose::identity())]),
            crate::anchor::AnchorTracker::new(vec![]),
            Box::new(ProportionalCorrector::default()),
        );
        let matcher = |_: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
            Ok(Registration::converged(Pose::identity()))
        };
        let pipeline = CorrectionPipeline::new(Arc::new(core), Arc::new(matcher), Pose::identity());
        assert_eq!(pipeline.process(scan()).await, ScanOutcome::Skipped);
        assert_eq!(pipeline.guard().accepted(), 0);
    }
}
