//! Node configuration
//!
//! Every threshold the protocol uses lives in [`SyncConfig`]. Durations are
//! serialized as integer milliseconds so a config file stays readable:
//!
//! ```json
//! { "min_group_size": 4, "round_timeout": 60000, "retry_limit": 5 }
//! ```
//!
//! Missing fields take their defaults.

use std::time::Duration;

use swarm_sync_core::progress::RoundPolicy;
use swarm_sync_core::scoring::ScoringRules;
use swarm_sync_core::{Error, Result};

use crate::retry::RetryPolicy;

/// Configuration for one SwarmSync node
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quorum, counting the local peer
    pub min_group_size: usize,
    /// Budget for one round
    #[serde(with = "duration_ms")]
    pub round_timeout: Duration,
    /// Publish attempts before giving up
    pub retry_limit: u32,
    /// Pause between publish attempts
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Samples that make a round due
    pub round_due_sample_threshold: u64,
    /// Time since the last round that makes a round due
    #[serde(with = "duration_ms")]
    pub round_due_tick_interval: Duration,
    /// Candidate polls before `InsufficientPeers`
    pub group_formation_attempts: u32,
    /// Pause between candidate polls
    #[serde(with = "duration_ms")]
    pub candidate_poll_interval: Duration,
    /// How often a running round is polled
    #[serde(with = "duration_ms")]
    pub round_poll_interval: Duration,
    /// Bound on a single directory or store call
    #[serde(with = "duration_ms")]
    pub directory_timeout: Duration,
    /// Store reads per tag before a load is exhausted
    pub load_attempts: u32,
    /// How long a peer reported as failed scores zero
    #[serde(with = "duration_ms")]
    pub failure_cooldown: Duration,
    /// EMA weight of one completed round in a peer's trust
    pub participation_weight: f32,
    /// Checkpoint blobs kept in the local cache
    pub cache_capacity: usize,
    /// Outer learning rate of the reference model
    pub learning_rate: f32,
    /// Outer momentum of the reference model
    pub momentum: f32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_group_size: 2,
            round_timeout: Duration::from_secs(120),
            retry_limit: 3,
            retry_delay: Duration::from_secs(1),
            round_due_sample_threshold: 25,
            round_due_tick_interval: Duration::from_secs(600),
            group_formation_attempts: 3,
            candidate_poll_interval: Duration::from_millis(500),
            round_poll_interval: Duration::from_secs(1),
            directory_timeout: Duration::from_secs(10),
            load_attempts: 3,
            failure_cooldown: Duration::from_secs(300),
            participation_weight: 0.2,
            cache_capacity: 2,
            learning_rate: 0.7,
            momentum: 0.9,
        }
    }
}

impl SyncConfig {
    /// Start building a configuration from the defaults
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(Error::InvalidConfig(what.to_string()));

        if self.min_group_size == 0 {
            return invalid("min_group_size must be at least 1");
        }
        if self.retry_limit == 0 {
            return invalid("retry_limit must be at least 1");
        }
        if self.load_attempts == 0 {
            return invalid("load_attempts must be at least 1");
        }
        if self.group_formation_attempts == 0 {
            return invalid("group_formation_attempts must be at least 1");
        }
        if self.cache_capacity == 0 {
            return invalid("cache_capacity must be at least 1");
        }
        for (name, value) in [
            ("round_timeout", self.round_timeout),
            ("round_due_tick_interval", self.round_due_tick_interval),
            ("round_poll_interval", self.round_poll_interval),
            ("directory_timeout", self.directory_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if !(self.participation_weight > 0.0 && self.participation_weight <= 1.0) {
            return invalid("participation_weight must be in (0, 1]");
        }
        Ok(())
    }

    /// Round-due thresholds
    pub fn round_policy(&self) -> RoundPolicy {
        RoundPolicy {
            sample_threshold: self.round_due_sample_threshold,
            tick_interval: self.round_due_tick_interval,
        }
    }

    /// Score update parameters
    pub fn scoring_rules(&self) -> ScoringRules {
        ScoringRules {
            participation_weight: self.participation_weight,
            failure_cooldown: self.failure_cooldown,
            ..ScoringRules::default()
        }
    }

    /// Publish retry policy
    pub fn publish_retry(&self) -> RetryPolicy {
        RetryPolicy {
            limit: self.retry_limit,
            delay: self.retry_delay,
        }
    }

    /// Per-tag load retry policy
    pub fn load_retry(&self) -> RetryPolicy {
        RetryPolicy {
            limit: self.load_attempts,
            delay: self.retry_delay,
        }
    }
}

/// Builder for [`SyncConfig`]
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the quorum
    pub fn min_group_size(mut self, size: usize) -> Self {
        self.config.min_group_size = size;
        self
    }

    /// Set the round budget
    pub fn round_timeout(mut self, timeout: Duration) -> Self {
        self.config.round_timeout = timeout;
        self
    }

    /// Set publish retries
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry_limit = limit;
        self
    }

    /// Set the pause between retries
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the sample threshold
    pub fn round_due_sample_threshold(mut self, samples: u64) -> Self {
        self.config.round_due_sample_threshold = samples;
        self
    }

    /// Set the tick interval
    pub fn round_due_tick_interval(mut self, interval: Duration) -> Self {
        self.config.round_due_tick_interval = interval;
        self
    }

    /// Set candidate polling for group formation
    pub fn group_formation(mut self, attempts: u32, poll_interval: Duration) -> Self {
        self.config.group_formation_attempts = attempts;
        self.config.candidate_poll_interval = poll_interval;
        self
    }

    /// Set the round poll interval
    pub fn round_poll_interval(mut self, interval: Duration) -> Self {
        self.config.round_poll_interval = interval;
        self
    }

    /// Set the per-call directory/store bound
    pub fn directory_timeout(mut self, timeout: Duration) -> Self {
        self.config.directory_timeout = timeout;
        self
    }

    /// Set load retries
    pub fn load_attempts(mut self, attempts: u32) -> Self {
        self.config.load_attempts = attempts;
        self
    }

    /// Set the post-failure cool-down
    pub fn failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.failure_cooldown = cooldown;
        self
    }

    /// Set the participation EMA weight
    pub fn participation_weight(mut self, weight: f32) -> Self {
        self.config.participation_weight = weight;
        self
    }

    /// Set the checkpoint cache size
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Set the outer optimizer
    pub fn outer_optimizer(mut self, learning_rate: f32, momentum: f32) -> Self {
        self.config.learning_rate = learning_rate;
        self.config.momentum = momentum;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
