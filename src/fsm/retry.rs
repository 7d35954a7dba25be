//! Retry policy for state machine transitions.

use std::time::Duration;

use anyhow::anyhow;
use thiserror::Error;

/// Outcome of a single transition attempt.
///
/// `Unrecoverable` short-circuits retry and is surfaced immediately; it marks
/// invariant violations and missing prerequisites. Everything else is
/// retried under the transition's policy.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("unrecoverable error")]
    Unrecoverable(#[source] anyhow::Error),

    #[error(transparent)]
    Retryable(anyhow::Error),
}

impl TransitionError {
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        TransitionError::Unrecoverable(err.into())
    }

    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        TransitionError::Retryable(err.into())
    }

    pub fn unrecoverable_msg(message: impl Into<String>) -> Self {
        TransitionError::Unrecoverable(anyhow!(message.into()))
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, TransitionError::Unrecoverable(_))
    }
}

/// Exponential backoff configuration. Wait before the first retry is zero;
/// each following retry doubles the wait, capped at `max_wait`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait_increment: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Returns the wait before the next retry, or `None` when attempts are
    /// exhausted.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }

        let wait = if self.attempt == 0 {
            Duration::ZERO
        } else {
            let shift = (self.attempt - 1).min(31);
            self.policy
                .wait_increment
                .saturating_mul(1u32 << shift)
                .min(self.policy.max_wait)
        };

        self.attempt += 1;
        Some(wait)
    }
}
