//! Backoff policy for transient provider faults.
//!
//! Connection resets, 429s and 5xx responses get a bounded number of
//! re-attempts before a loop step gives up; everything else fails on the
//! first try (see [`Error::is_transient`](crate::Error::is_transient)).
//!
//! This module only decides how long to wait between attempts. The agent
//! loop owns the retry bookkeeping itself, which keeps every backoff sleep
//! inside the same cancellation and deadline guard as the completion call it
//! is retrying: a cancelled run never sits out a backoff.

use std::time::Duration;

/// Completion attempts allowed per loop step, the first try included.
pub const DEFAULT_PROVIDER_ATTEMPTS: u32 = 3;

/// Delay bound before the first re-attempt; later bounds double from here.
const FIRST_RETRY_BOUND: Duration = Duration::from_millis(500);

/// A single backoff sleep never exceeds this, whatever the deadline allows.
const DELAY_CEILING: Duration = Duration::from_secs(30);

/// Runs cannot spend more than this fraction of their deadline in one
/// backoff sleep.
const DEADLINE_FRACTION: u32 = 8;

/// Decides whether, and for how long, to back off before re-attempting a
/// failed completion.
///
/// Delay bounds double per attempt and each sleep is drawn uniformly from
/// the upper half of its bound (equal jitter), so concurrent sessions
/// retrying against the same provider spread out instead of stampeding.
/// Bounds are capped both absolutely and relative to the run deadline.
#[derive(Debug, Clone)]
pub struct ProviderRetry {
    attempts: u32,
    max_delay: Duration,
}

impl Default for ProviderRetry {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROVIDER_ATTEMPTS,
            max_delay: DELAY_CEILING,
        }
    }
}

impl ProviderRetry {
    /// Policy allowing `attempts` tries per completion. Zero or one means
    /// transient faults are not retried at all.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Cap each backoff sleep relative to the run deadline, so a flapping
    /// provider cannot spend the whole run sleeping. The agent loop applies
    /// this with [`RunOptions::deadline`](crate::RunOptions).
    pub fn capped_by_deadline(mut self, deadline: Duration) -> Self {
        self.max_delay = self.max_delay.min(deadline / DEADLINE_FRACTION);
        self
    }

    /// Attempts allowed per completion.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// How long to sleep before re-attempt number `attempt` (1 is the first
    /// retry). `None` means the attempt budget is spent and the error is
    /// final.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts {
            return None;
        }
        Some(jittered(self.bound_for(attempt)))
    }

    /// Upper delay bound for a given re-attempt.
    fn bound_for(&self, attempt: u32) -> Duration {
        // Doublings past 2^6 already clear the ceiling.
        let doublings = attempt.saturating_sub(1).min(6);
        FIRST_RETRY_BOUND
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

/// Equal jitter: uniform draw from the upper half of the bound.
fn jittered(bound: Duration) -> Duration {
    let half = bound / 2;
    let spread = half.as_micros() as u64;
    half + Duration::from_micros(rand::random::<u64>() % (spread + 1))
}
