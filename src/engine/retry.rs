use std::time::Duration;

use rand::Rng;

use crate::limits::{BACKOFF_BASE_MS, MAX_ATTEMPTS};
use crate::model::Reservation;

use super::{Disposition, EngineError};

/// Bounded, linearly backed-off retry of admission attempts.
///
/// Linear rather than exponential: a competitor holds the lease for at most
/// one TTL, so waits never need to grow past a few TTLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Add up to one `backoff_base` of random delay so that callers which
    /// collided once do not collide again in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            jitter: true,
        }
    }
}

/// Where the retry state machine goes after attempt `n`.
#[derive(Debug)]
pub enum Step {
    Done(Reservation),
    /// Sleep, then run attempt `n + 1`.
    Backoff { delay: Duration, cause: EngineError },
    /// Terminal failure: overlap, deterministic fault, or `Exhausted`.
    Stop(EngineError),
}

impl RetryPolicy {
    /// Deterministic part of the wait after (0-based) attempt `n`: `base × (n + 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt.saturating_add(1))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter_ms = self.backoff_base.as_millis() as u64;
        if !self.jitter || jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }

    /// Classify the outcome of attempt `attempt` (0-based) and pick the next state.
    pub fn step(&self, attempt: u32, result: Result<Reservation, EngineError>) -> Step {
        let err = match result {
            Ok(reservation) => return Step::Done(reservation),
            Err(e) => e,
        };
        match err.disposition() {
            Disposition::Reject | Disposition::Fail => Step::Stop(err),
            Disposition::Retry if attempt + 1 < self.max_attempts => Step::Backoff {
                delay: self.backoff(attempt),
                cause: err,
            },
            Disposition::Retry => Step::Stop(EngineError::Exhausted {
                attempts: attempt + 1,
                last: Box::new(err),
            }),
        }
    }
}
