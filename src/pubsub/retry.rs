//! Retry helpers: jittered exponential backoff for RPC retries and the
//! failure classification used by the pull loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tonic::Code;
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Upper bound on the pull loop's linear backoff.
pub const MAX_PULL_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff with relative jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for the un-jittered delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Relative jitter (0.2 = ±20%).
    pub jitter: f64,
}

impl Backoff {
    /// Backoff taken from the channel configuration.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
            jitter: config.backoff_jitter,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Jittered delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor.max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// How many times a transient failure is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay schedule.
    pub backoff: Backoff,
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// At most `max_attempts` calls in total.
    pub fn bounded(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Retry transient failures until the call succeeds or fails permanently.
    pub fn unbounded(backoff: Backoff) -> Self {
        Self {
            backoff,
            max_attempts: None,
        }
    }

    fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(Backoff::default(), 5)
    }
}

/// Run `op`, retrying transient errors according to `policy`.
///
/// Only errors for which [`Error::is_transient`] holds are retried; every
/// other error is returned immediately.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempts += 1;
                if !e.is_transient() || !policy.allows(attempts) {
                    return Err(e);
                }
                let delay = policy.backoff.delay(attempts - 1);
                warn!(
                    operation,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient RPC failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Classification of a failed pull RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullFailure {
    /// The shared channel is gone or could not carry the call.
    ChannelClosed,
    /// `UNAVAILABLE`.
    Unavailable,
    /// `DEADLINE_EXCEEDED`.
    DeadlineExceeded,
    /// Anything else.
    Other,
}

impl PullFailure {
    /// Classify an error returned by a pull.
    pub fn classify(error: &Error) -> Self {
        match error {
            Error::ChannelClosed | Error::Transport(_) => PullFailure::ChannelClosed,
            Error::Rpc(status) => match status.code() {
                Code::Unavailable => PullFailure::Unavailable,
                Code::DeadlineExceeded => PullFailure::DeadlineExceeded,
                _ => PullFailure::Other,
            },
            _ => PullFailure::Other,
        }
    }

    /// Base delay for this class.
    pub fn base_delay(self) -> Duration {
        match self {
            PullFailure::ChannelClosed => Duration::from_millis(50),
            PullFailure::Unavailable => Duration::from_millis(200),
            PullFailure::DeadlineExceeded => Duration::from_millis(50),
            PullFailure::Other => Duration::from_millis(1000),
        }
    }

    /// Delay after `consecutive_failures` earlier failures: the base delay
    /// times `consecutive_failures + 1`, capped at [`MAX_PULL_BACKOFF`].
    pub fn delay(self, consecutive_failures: u32) -> Duration {
        self.base_delay()
            .saturating_mul(consecutive_failures.saturating_add(1))
            .min(MAX_PULL_BACKOFF)
    }

    /// Metric label for this class.
    pub fn as_str(self) -> &'static str {
        match self {
            PullFailure::ChannelClosed => "channel_closed",
            PullFailure::Unavailable => "unavailable",
            PullFailure::DeadlineExceeded => "deadline_exceeded",
            PullFailure::Other => "other",
        }
    }

    /// Unclassified failures are logged at error level.
    pub fn is_unexpected(self) -> bool {
        self == PullFailure::Other
    }
}
