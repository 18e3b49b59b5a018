// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Retry Policy
//!
//! Every business handler invocation is retried locally before the delivery is
//! negatively acknowledged. The default policy makes 3 attempts, waiting 300ms
//! after the first failure and doubling the wait after each further failure.
//! Any error is retried and only the last one is surfaced.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy making `attempts` attempts (at least one) with exponential
    /// backoff starting at `delay`.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Runs the operation once, without retrying.
    pub fn no_retry() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The wait after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor)
    }

    /// Runs `op` until it succeeds or the attempts are exhausted. Cancelling
    /// `token` stops waiting between attempts and surfaces the last error.
    pub async fn run<F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<(), AmqpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), AmqpError>>,
    {
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if attempt >= self.attempts {
                return Err(err);
            }

            let delay = self.delay_after(attempt);
            warn!(
                error = err.to_string(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "handler failed, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
