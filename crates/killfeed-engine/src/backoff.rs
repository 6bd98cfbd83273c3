// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-source retry pacing.
//!
//! Each source carries its own [`FailureTracker`]; one unreachable host
//! never delays polling of healthy sources. The delay doubles per
//! consecutive failure up to a fixed ceiling, with a jitter band so a
//! fleet of sources failing against the same host does not retry in
//! lockstep.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a ceiling and proportional jitter.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial_interval: Duration,
    /// Ceiling for the computed delay, before jitter.
    pub maximum_interval: Duration,
    /// Jitter as a fraction of the delay; 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_interval: Duration::from_secs(5),
            maximum_interval: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_interval(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let candidate = self.initial_interval.saturating_mul(factor);
        candidate.min(self.maximum_interval)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    #[must_use]
    pub fn interval(&self, attempt: u32) -> Duration {
        let base = self.base_interval(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Consecutive-failure bookkeeping for one source.
///
/// Past `degraded_threshold` consecutive failures the source is polled at
/// the reduced fixed cadence; a single success resets everything
/// immediately.
#[derive(Clone, Copy, Debug)]
pub struct FailureTracker {
    consecutive: u32,
    degraded_threshold: u32,
}

impl FailureTracker {
    #[must_use]
    pub fn new(degraded_threshold: u32) -> Self {
        FailureTracker {
            consecutive: 0,
            degraded_threshold,
        }
    }

    /// Records a failure and returns the new consecutive count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }

    /// Records a success, clearing the streak.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.consecutive >= self.degraded_threshold
    }
}
