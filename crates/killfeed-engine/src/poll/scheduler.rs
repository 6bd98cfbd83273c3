// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-source poll loops under one supervisor.
//!
//! The scheduler owns exactly one recurring task per active source, which
//! is what serializes all cursor and state mutation for that source:
//! concurrent polls of the same source are structurally impossible. A
//! periodic sync pass reconciles the running set against the registry:
//! new sources get a loop, removed sources get cancelled at their next
//! suspension point, and cursors of sources past the retention window are
//! retired.
//!
//! Failure pacing is per source. Transient errors back off exponentially
//! (with jitter); past the degraded threshold the source is polled at the
//! fixed reduced cadence until one successful cycle restores it.
//! Configuration errors park the loop entirely until the operator updates
//! the source definition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::FailureTracker;
use crate::config::Config;
use crate::cursor::CursorStore;
use crate::error::{EngineError, FailureClass};
use crate::fanout::Dispatcher;
use crate::normalize::Normalizer;
use crate::poll::cycle::{run_poll_cycle, PollContext};
use crate::pool::SessionPool;
use crate::registry::RegistryHandle;
use crate::source::{SourceId, SourceState};

/// Supervisor for all per-source poll loops.
pub struct PollScheduler {
    config: Arc<Config>,
    registry: RegistryHandle,
    cursors: Arc<dyn CursorStore>,
    pool: SessionPool,
    dispatcher: Dispatcher,
    normalizer: Arc<Normalizer>,
    cancel: CancellationToken,
    running: HashMap<SourceId, CancellationToken>,
}

impl PollScheduler {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        registry: RegistryHandle,
        cursors: Arc<dyn CursorStore>,
        pool: SessionPool,
        dispatcher: Dispatcher,
    ) -> Self {
        PollScheduler {
            config,
            registry,
            cursors,
            pool,
            dispatcher,
            normalizer: Arc::new(Normalizer::new()),
            cancel: CancellationToken::new(),
            running: HashMap::new(),
        }
    }

    /// Token that stops the scheduler and every source loop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs sync passes until cancelled.
    pub async fn run(mut self) {
        info!(sync_interval = ?self.config.sync_interval, "poll scheduler started");
        loop {
            self.sync().await;
            tokio::select! {
                () = sleep(self.config.sync_interval) => {}
                () = self.cancel.cancelled() => break,
            }
        }
        for token in self.running.values() {
            token.cancel();
        }
        info!("poll scheduler stopped");
    }

    /// Reconciles running loops with the registry and retires expired
    /// cursors.
    async fn sync(&mut self) {
        let Ok(active) = self.registry.list_active().await else {
            return;
        };

        let active_ids: std::collections::HashSet<SourceId> =
            active.iter().map(|source| source.id.clone()).collect();

        // Cancel loops whose source is gone; the loop observes the token
        // at its next suspension point and exits without committing
        // anything further.
        self.running.retain(|id, token| {
            if active_ids.contains(id) {
                true
            } else {
                debug!(source = %id, "cancelling poll loop for removed source");
                token.cancel();
                false
            }
        });

        // Spawn loops for newly registered sources.
        for source in active {
            if self.running.contains_key(&source.id) {
                continue;
            }
            let Ok(Some(stats)) = self.registry.stats(&source.id).await else {
                continue;
            };
            let token = self.cancel.child_token();
            let ctx = PollContext {
                config: Arc::clone(&self.config),
                registry: self.registry.clone(),
                cursors: Arc::clone(&self.cursors),
                pool: self.pool.clone(),
                dispatcher: self.dispatcher.clone(),
                normalizer: Arc::clone(&self.normalizer),
                stats,
                cancel: token.clone(),
            };
            debug!(source = %source.id, "starting poll loop");
            self.running.insert(source.id.clone(), token);
            tokio::spawn(source_loop(ctx, source.id));
        }

        // Retire cursors of sources removed longer ago than the retention
        // window.
        let retention = chrono::Duration::from_std(self.config.cursor_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = chrono::Utc::now() - retention;
        if let Ok(reaped) = self.registry.reap_removed(cutoff).await {
            for id in reaped {
                if let Err(err) = self.cursors.remove(&id).await {
                    warn!(source = %id, "failed to retire cursor: {err}");
                }
            }
        }
    }
}

/// Recurring poll loop for one source. Ends when the source is removed,
/// the scheduler shuts down, or a configuration error parks it for good.
async fn source_loop(ctx: PollContext, id: SourceId) {
    let mut failures = FailureTracker::new(ctx.config.degraded_threshold);
    let mut next_delay: Option<Duration> = None;

    loop {
        let delay = next_delay.take().unwrap_or_else(|| {
            if failures.is_degraded() {
                ctx.config.degraded_interval
            } else {
                jittered(ctx.config.poll_interval, ctx.config.poll_jitter)
            }
        });
        tokio::select! {
            () = sleep(delay) => {}
            () = ctx.cancel.cancelled() => break,
        }

        let source = match ctx.registry.get(&id).await {
            Ok(Some(source)) if source.state != SourceState::Removed => source,
            Ok(_) => break,
            Err(_) => break,
        };

        match run_poll_cycle(&ctx, &source).await {
            Ok(outcome) => {
                failures.record_success();
                ctx.stats.reset_failures();
                debug!(source = %id, ?outcome, "poll cycle complete");
            }
            Err(EngineError::Cancelled) => break,
            Err(err @ EngineError::AcquireTimeout { .. }) => {
                // Pool saturation is not a source failure: skip this
                // cycle and try again at the normal cadence.
                ctx.stats.incr_cycles_skipped();
                debug!(source = %id, "{err}; cycle skipped");
            }
            Err(err) => match err.failure_class() {
                Some(FailureClass::Transient) => {
                    let attempt = failures.record_failure();
                    ctx.stats.record_failure();
                    if failures.is_degraded() {
                        warn!(
                            source = %id,
                            consecutive = attempt,
                            "source degraded: {err}"
                        );
                        let _ = ctx
                            .registry
                            .set_state(id.clone(), SourceState::Degraded)
                            .await;
                    } else {
                        let backoff = ctx.config.backoff.interval(attempt);
                        warn!(
                            source = %id,
                            attempt,
                            ?backoff,
                            "transient failure, backing off: {err}"
                        );
                        next_delay = Some(backoff);
                    }
                }
                Some(FailureClass::Persistence) => {
                    // The cycle aborted before dispatching; the committed
                    // cursor stands and the next cycle re-reads the range.
                    error!(source = %id, "cursor persistence failed: {err}");
                }
                Some(FailureClass::Configuration) => {
                    error!(
                        source = %id,
                        "configuration error, polling parked until the source is corrected: {err}"
                    );
                    let _ = ctx
                        .registry
                        .set_state(id.clone(), SourceState::Registered)
                        .await;
                    if !park_until_corrected(&ctx, &id, source.generation).await {
                        break;
                    }
                    failures.record_success();
                }
                None => break,
            },
        }
    }
    debug!(source = %id, "poll loop ended");
}

/// Waits until the operator updates the source definition (generation
/// bump) or the source goes away. Returns false when the loop should end.
async fn park_until_corrected(ctx: &PollContext, id: &SourceId, generation: u64) -> bool {
    loop {
        tokio::select! {
            () = sleep(ctx.config.degraded_interval) => {}
            () = ctx.cancel.cancelled() => return false,
        }
        match ctx.registry.get(id).await {
            Ok(Some(source)) if source.state == SourceState::Removed => return false,
            Ok(Some(source)) if source.generation != generation => {
                info!(source = %id, "source definition updated, resuming polling");
                return true;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return false,
        }
    }
}

/// Applies ± `fraction` of uniform jitter to an interval.
fn jittered(interval: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return interval;
    }
    let spread = interval.as_secs_f64() * fraction;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.0))
}
