// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-source ingestion counters.
//!
//! One [`SourceStats`] lives in the registry for each source and is shared
//! with that source's poll loop. Counters are plain relaxed atomics: they
//! feed monitoring snapshots, not control flow, with one exception:
//! `consecutive_failures` is also what the scheduler reads when deciding
//! whether a source has crossed the degraded threshold.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::source::SourceState;

/// Monotonic counters for one source.
#[derive(Debug, Default)]
pub struct SourceStats {
    lines_read: AtomicU64,
    events_emitted: AtomicU64,
    malformed_lines: AtomicU64,
    noise_lines: AtomicU64,
    delivery_failures: AtomicU64,
    cycles_skipped: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl SourceStats {
    pub fn add_lines_read(&self, n: u64) {
        self.lines_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_events_emitted(&self, n: u64) {
        self.events_emitted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_malformed(&self, n: u64) {
        self.malformed_lines.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_noise(&self, n: u64) {
        self.noise_lines.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_delivery_failures(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cycles_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) -> u64 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    /// Captures the counters together with the source's current state.
    #[must_use]
    pub fn snapshot(&self, state: SourceState) -> StatsSnapshot {
        StatsSnapshot {
            state,
            lines_read: self.lines_read.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            noise_lines: self.noise_lines.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one source's counters, for the observability
/// surface.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub state: SourceState,
    pub lines_read: u64,
    pub events_emitted: u64,
    pub malformed_lines: u64,
    pub noise_lines: u64,
    pub delivery_failures: u64,
    pub cycles_skipped: u64,
    pub consecutive_failures: u64,
}
