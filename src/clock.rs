//! Virtual playback clock.
//!
//! Sim time only runs while playback is active. Wall time comes from
//! `tokio::time::Instant`, so a paused test runtime drives it deterministically.

use tokio::time::{Duration, Instant};

/// Pausable virtual clock for the teach timeline.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    /// Virtual time accumulated over all finished play segments.
    base: Duration,
    /// Wall instant at which the current play segment began; `None` while stopped.
    started: Option<Instant>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock that resumes from an existing position on the timeline.
    pub fn starting_at(base: Duration) -> Self {
        Self {
            base,
            started: None,
        }
    }

    /// Current sim time in seconds.
    pub fn sim_time(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    fn elapsed(&self) -> Duration {
        match self.started {
            Some(started) => self.base + started.elapsed(),
            None => self.base,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Begin a play segment at the current wall time.
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// End the current play segment, folding its wall duration into the base.
    ///
    /// Returns the sim time at which the clock stopped.
    pub fn pause(&mut self) -> f64 {
        if let Some(started) = self.started.take() {
            self.base += started.elapsed();
        }
        self.base.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sim_time_round_trip() {
        let mut clock = SimClock::new();
        assert_eq!(clock.sim_time(), 0.0);

        clock.start();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let paused_at = clock.pause();
        assert!((paused_at - 1.5).abs() < 1e-6);
        assert!((clock.sim_time() - 1.5).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_clock_does_not_advance() {
        let mut clock = SimClock::new();
        clock.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.pause();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((clock.sim_time() - 1.0).abs() < 1e-6);

        // Pausing again must not pick up the idle wall time.
        clock.pause();
        assert!((clock.sim_time() - 1.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_accumulate() {
        let mut clock = SimClock::new();
        for _ in 0..3 {
            clock.start();
            tokio::time::advance(Duration::from_millis(250)).await;
            clock.pause();
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert!((clock.sim_time() - 0.75).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_clock_reads_live() {
        let mut clock = SimClock::starting_at(Duration::from_secs(3));
        clock.start();
        assert!(clock.is_running());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!((clock.sim_time() - 3.5).abs() < 1e-6);
    }
}
