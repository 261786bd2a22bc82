// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use rand::Rng;

use crate::constants::{
    SEND_TIMEOUT_MAX_BACKOFF, SEND_TIMEOUT_MAX_JITTER, SEND_TIMEOUT_MAX_RETRIES,
    SEND_TIMEOUT_RETRY_BASE,
};

/// Number of timed out attempts after which the base delay doubles.
const ATTEMPTS_PER_STEP: u32 = 3;

/// Retry schedule for attempts that hit the HTTP client timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: SEND_TIMEOUT_MAX_RETRIES,
            base: SEND_TIMEOUT_RETRY_BASE,
            max_backoff: SEND_TIMEOUT_MAX_BACKOFF,
            max_jitter: SEND_TIMEOUT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            base: self.base.min(self.max_backoff),
            attempts: 0,
        }
    }
}

/// Delay state of one buffer's retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    base: Duration,
    attempts: u32,
}

impl Backoff {
    /// Base delay before the next attempt, advancing the schedule.
    pub fn next_base(&mut self) -> Duration {
        let current = self.base;
        self.attempts += 1;
        if self.attempts % ATTEMPTS_PER_STEP == 0 {
            self.base = self.base.saturating_mul(2);
        }
        self.base = self.base.min(self.policy.max_backoff);
        current
    }

    /// Base delay plus a random jitter in `[0, max_jitter)`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_base();
        let max_jitter = u64::try_from(self.policy.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_jitter == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..max_jitter))
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
