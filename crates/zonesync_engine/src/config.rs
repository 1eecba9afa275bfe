//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;
use zonesync_record::ZoneId;

/// Default number of records sent in one remote write call.
pub const DEFAULT_PUSH_BATCH_LIMIT: usize = 400;

/// Which steps of a cycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDirection {
    /// Pull and push.
    #[default]
    Bidirectional,
    /// Push only; never pulls or subscribes.
    UpstreamOnly,
    /// Pull only; never pushes or creates zones.
    DownstreamOnly,
}

impl SyncDirection {
    /// Returns true if remote changes are pulled.
    pub fn pulls(self) -> bool {
        self != SyncDirection::UpstreamOnly
    }

    /// Returns true if local mutations are pushed.
    pub fn pushes(self) -> bool {
        self != SyncDirection::DownstreamOnly
    }
}

/// How the default-zone pull walks collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullStrategy {
    /// One collection after another, stopping at the first error.
    #[default]
    Sequential,
    /// All collections at once, joined by a fan-out tracker.
    Parallel,
}

/// Which database of the container is synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseScope {
    /// The signed-in user's private database.
    #[default]
    Private,
    /// The container's shared public database.
    Public,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Container identifier.
    pub container: String,
    /// Database within the container.
    pub scope: DatabaseScope,
    /// Zone every collection is stored in.
    pub zone: ZoneId,
    /// Which steps run.
    pub direction: SyncDirection,
    /// Default-zone pull strategy.
    pub pull_strategy: PullStrategy,
    /// Maximum records per remote write call.
    pub push_batch_limit: usize,
    /// Identifier of the push-notification subscription.
    pub subscription_id: String,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncSettings {
    /// Creates settings for a custom zone in the private database.
    pub fn new(container: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            container: container.into(),
            scope: DatabaseScope::Private,
            zone,
            direction: SyncDirection::Bidirectional,
            pull_strategy: PullStrategy::Sequential,
            push_batch_limit: DEFAULT_PUSH_BATCH_LIMIT,
            subscription_id: "private_changes".to_string(),
            retry: RetryConfig::default(),
        }
    }

    /// Creates settings for the public database's default zone.
    pub fn public(container: impl Into<String>) -> Self {
        Self {
            scope: DatabaseScope::Public,
            subscription_id: "public_changes".to_string(),
            ..Self::new(container, ZoneId::default_zone())
        }
    }

    /// Sets the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the default-zone pull strategy.
    pub fn with_pull_strategy(mut self, strategy: PullStrategy) -> Self {
        self.pull_strategy = strategy;
        self
    }

    /// Sets the maximum records per write call.
    pub fn with_push_batch_limit(mut self, limit: usize) -> Self {
        self.push_batch_limit = limit.max(1);
        self
    }

    /// Sets the subscription identifier.
    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = id.into();
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns true if this zone has its own change feed.
    pub fn uses_custom_zone(&self) -> bool {
        !self.zone.is_default()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, `None` for no bound.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for computed delays.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
    /// Floor for throttling errors that carry no server hint.
    pub default_retry_after: Duration,
}

impl RetryConfig {
    /// Creates an unbounded retry configuration.
    pub fn new() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
            default_retry_after: Duration::from_secs(3),
        }
    }

    /// Creates a configuration for tests: no jitter, millisecond delays.
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            add_jitter: false,
            default_retry_after: Duration::from_millis(1),
        }
    }

    /// Bounds the number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Sets the floor for throttling errors without a hint.
    pub fn with_default_retry_after(mut self, delay: Duration) -> Self {
        self.default_retry_after = delay;
        self
    }

    /// Calculates the backoff for a given attempt (0-indexed), without
    /// jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Adds up to 25% jitter to `delay` when enabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.add_jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..0.25);
        delay + delay.mul_f64(factor)
    }

    /// Returns true once `attempts` failures have used up the bound.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
