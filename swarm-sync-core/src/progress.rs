//! Training progress and the round-due policy
//!
//! Each process keeps two [`Progress`] values: `local`, its own
//! authoritative view, and `global`, the last observed consensus view.
//! `global.epoch >= local.epoch` is the steady state; `local.epoch >
//! global.epoch` only holds between a round win and its publication.

use core::time::Duration;

/// Epoch counter plus the samples accumulated toward the next round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    /// Published checkpoint version this view corresponds to
    pub epoch: u64,
    /// Samples accumulated since `epoch` started
    pub samples_accumulated: u64,
}

impl Progress {
    /// Create a progress value
    pub const fn new(epoch: u64, samples_accumulated: u64) -> Self {
        Self {
            epoch,
            samples_accumulated,
        }
    }

    /// Fresh progress at `epoch` with no accumulated samples
    pub const fn at_epoch(epoch: u64) -> Self {
        Self::new(epoch, 0)
    }

    /// Advance the epoch, optionally starting the new epoch empty
    pub fn advance(&mut self, delta_epoch: u64, reset_samples: bool) {
        self.epoch = self.epoch.saturating_add(delta_epoch);
        if reset_samples {
            self.samples_accumulated = 0;
        }
    }

    /// Add locally processed samples
    pub fn record_samples(&mut self, n: u64) {
        self.samples_accumulated = self.samples_accumulated.saturating_add(n);
    }

    /// Whether this view lags a published global view
    pub fn is_behind(&self, global: Option<&Progress>) -> bool {
        global.is_some_and(|g| self.epoch < g.epoch)
    }
}

/// Why a round became due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    /// Accumulated samples reached the batch threshold
    SampleThreshold { samples: u64 },
    /// Time since the last round reached the tick interval
    TickInterval { elapsed: Duration },
}

/// Thresholds that make a round due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundPolicy {
    /// Samples that make a round due
    pub sample_threshold: u64,
    /// Time since the last round that makes a round due
    pub tick_interval: Duration,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            sample_threshold: 25,
            tick_interval: Duration::from_secs(600),
        }
    }
}

impl RoundPolicy {
    /// Decide whether a round is due.
    ///
    /// A lagging peer (`local.epoch < global.epoch`) is never due; it has to
    /// catch up first. When both views are on the same epoch the larger of
    /// the two sample counts is used, so the swarm's collective work counts
    /// toward the threshold.
    pub fn due(
        &self,
        local: &Progress,
        global: Option<&Progress>,
        since_last_round: Duration,
    ) -> Option<DueReason> {
        if local.is_behind(global) {
            return None;
        }

        let samples = match global {
            Some(g) if g.epoch == local.epoch => local.samples_accumulated.max(g.samples_accumulated),
            _ => local.samples_accumulated,
        };
        if samples >= self.sample_threshold {
            return Some(DueReason::SampleThreshold { samples });
        }

        if since_last_round >= self.tick_interval {
            return Some(DueReason::TickInterval {
                elapsed: since_last_round,
            });
        }

        None
    }

    /// Boolean form of [`RoundPolicy::due`]
    pub fn is_round_due(
        &self,
        local: &Progress,
        global: Option<&Progress>,
        since_last_round: Duration,
    ) -> bool {
        self.due(local, global, since_last_round).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RoundPolicy {
        RoundPolicy {
            sample_threshold: 100,
            tick_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn advance_resets_samples_when_asked() {
        let mut p = Progress::new(3, 40);
        p.advance(1, false);
        assert_eq!(p, Progress::new(4, 40));
        p.advance(1, true);
        assert_eq!(p, Progress::new(5, 0));
    }

    #[test]
    fn record_samples_saturates() {
        let mut p = Progress::new(0, u64::MAX - 1);
        p.record_samples(10);
        assert_eq!(p.samples_accumulated, u64::MAX);
    }

    #[test]
    fn due_on_sample_threshold() {
        let local = Progress::new(2, 100);
        assert_eq!(
            policy().due(&local, None, Duration::ZERO),
            Some(DueReason::SampleThreshold { samples: 100 })
        );
        assert!(!policy().is_round_due(&Progress::new(2, 99), None, Duration::ZERO));
    }

    #[test]
    fn due_on_tick_interval() {
        let local = Progress::new(2, 0);
        assert_eq!(
            policy().due(&local, None, Duration::from_secs(61)),
            Some(DueReason::TickInterval {
                elapsed: Duration::from_secs(61)
            })
        );
    }

    #[test]
    fn global_samples_count_on_the_same_epoch() {
        let local = Progress::new(2, 10);
        let global = Progress::new(2, 120);
        assert!(policy().is_round_due(&local, Some(&global), Duration::ZERO));

        // Samples from a different epoch do not count.
        let ahead = Progress::new(1, 500);
        assert!(!policy().is_round_due(&local, Some(&ahead), Duration::ZERO));
    }

    #[test]
    fn lagging_peer_is_never_due() {
        let local = Progress::new(2, 1_000);
        let global = Progress::new(3, 0);
        assert!(local.is_behind(Some(&global)));
        assert_eq!(policy().due(&local, Some(&global), Duration::from_secs(3600)), None);
    }

    #[test]
    fn no_global_means_not_behind() {
        assert!(!Progress::new(0, 0).is_behind(None));
    }
}
