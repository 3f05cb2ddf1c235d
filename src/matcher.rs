//! Point-cloud registration seam and the single-slot match guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::geometry::{PointCloud, Pose};

/// Result of one registration request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Registration {
    /// Whether the matcher considers the alignment reliable.
    pub converged: bool,
    /// Transform aligning the reading onto the reference.
    pub transform: Pose,
}

impl Registration {
    pub fn converged(transform: Pose) -> Self {
        Self {
            converged: true,
            transform,
        }
    }
}

/// Errors returned by a registration backend.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("registration service unavailable: {0}")]
    Unavailable(String),

    #[error("registration failed: {0}")]
    Failed(String),

    #[error("registration did not converge")]
    NotConverged,

    #[error("registration task aborted: {0}")]
    Aborted(String),
}

/// The registration service: aligns a live reading onto a reference cloud.
///
/// Calls are synchronous and may be slow; the pipeline runs them on the
/// blocking pool.
pub trait CloudMatcher: Send + Sync {
    fn match_clouds(
        &self,
        reading: &PointCloud,
        reference: &PointCloud,
    ) -> Result<Registration, MatchError>;
}

impl<F> CloudMatcher for F
where
    F: Fn(&PointCloud, &PointCloud) -> Result<Registration, MatchError> + Send + Sync,
{
    fn match_clouds(
        &self,
        reading: &PointCloud,
        reference: &PointCloud,
    ) -> Result<Registration, MatchError> {
        self(reading, reference)
    }
}

/// Why a scan could not enter the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("a registration is already in flight")]
    Busy,

    #[error("match guard closed for shutdown")]
    Closed,
}

/// Permit held for the duration of one registration. Dropping it frees the slot.
#[derive(Debug)]
pub struct MatchPermit {
    _permit: OwnedSemaphorePermit,
}

/// Allows at most one registration in flight; all other scans are dropped.
#[derive(Debug)]
pub struct MatchGuard {
    slot: Arc<Semaphore>,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl Default for MatchGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchGuard {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Take the slot without waiting.
    pub fn try_acquire(&self) -> Result<MatchPermit, GuardError> {
        match Arc::clone(&self.slot).try_acquire_owned() {
            Ok(permit) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(MatchPermit { _permit: permit })
            }
            Err(TryAcquireError::NoPermits) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(GuardError::Busy)
            }
            Err(TryAcquireError::Closed) => Err(GuardError::Closed),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Scans that entered the matcher.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Scans dropped because a registration was in flight.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the in-flight registration (if any) to finish, then close the
    /// guard so no later scan can start one.
    pub async fn drain(&self) {
        if let Ok(permit) = self.slot.acquire().await {
            self.slot.close();
            drop(permit);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn test_single_slot() {
        let guard = MatchGuard::new();
        let permit = guard.try_acquire().unwrap();
        assert!(guard.is_busy());
        assert_eq!(guard.try_acquire().unwrap_err(), GuardError::Busy);
        assert_eq!(guard.try_acquire().unwrap_err(), GuardError::Busy);
        drop(permit);

        assert!(!guard.is_busy());
        let _again = guard.try_acquire().unwrap();
        assert_eq!(guard.accepted(), 2);
        assert_eq!(guard.dropped(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_match() {
        let guard = Arc::new(MatchGuard::new());
        let permit = guard.try_acquire().unwrap();

        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&released);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            drop(permit);
        });

        guard.drain().await;
        assert!(released.load(Ordering::SeqCst));
        assert!(guard.is_closed());
        assert_eq!(guard.try_acquire().unwrap_err(), GuardError::Closed);
        // Closed rejections are not counted as busy drops.
        assert_eq!(guard.dropped(), 0);
    }

    #[tokio::test]
    async fn test_drain_when_idle_returns_immediately() {
        let guard = MatchGuard::new();
        guard.drain().await;
        assert!(guard.is_closed());
    }

    #[test]
    fn test_closure_matcher() {
        let matcher = |_: &PointCloud, _: &PointCloud| -> Result<Registration, MatchError> {
            Err(MatchError::NotConverged)
        };
        let err = matcher
            .match_clouds(&PointCloud::default(), &PointCloud::default())
            .unwrap_err();
        assert!(matches!(err, MatchError::NotConverged));
    }
}
