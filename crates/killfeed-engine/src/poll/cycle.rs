// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One poll cycle for one source.
//!
//! A cycle decides between three modes from the stored cursor and the
//! remote file's fingerprint:
//!
//! - **Backfill** (cursor absent, schema mismatch, rotation, or an
//!   interrupted earlier backfill): read everything, advance the cursor,
//!   suppress dispatch for lines within the connect-time snapshot. Lines
//!   landing beyond the snapshot in the same pass are live.
//! - **Tail**: read from the cursor to EOF, dispatch every event.
//! - **Idle**: nothing new.
//!
//! Rotation/truncation (identity change, or size regressing below the
//! stored offset) is never interpreted as mass deletion: the cursor
//! resets to zero and the cycle re-parses the new content silently.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cursor::{Cursor, CursorLoad, CursorStore, Fingerprint};
use crate::error::EngineError;
use crate::fanout::Dispatcher;
use crate::normalize::{NormalizedEvent, Normalizer, RawLine};
use crate::pool::SessionPool;
use crate::registry::RegistryHandle;
use crate::source::{LogSource, SourceState};
use crate::stats::SourceStats;

/// Everything a poll cycle needs, cloned per source by the scheduler.
#[derive(Clone)]
pub struct PollContext {
    pub config: Arc<Config>,
    pub registry: RegistryHandle,
    pub cursors: Arc<dyn CursorStore>,
    pub pool: SessionPool,
    pub dispatcher: Dispatcher,
    pub normalizer: Arc<Normalizer>,
    pub stats: Arc<SourceStats>,
    pub cancel: CancellationToken,
}

/// What a completed cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No new content.
    Idle,
    /// Silent catch-up pass. `live_events` counts events from lines that
    /// landed beyond the connect-time snapshot during the same pass.
    Backfilled {
        lines: u64,
        live_events: u64,
        rotated: bool,
    },
    /// Live tail batch.
    Tailed { lines: u64, events: u64 },
}

#[derive(Clone, Copy)]
enum Mode {
    Backfill { snapshot: u64 },
    Tail,
}

/// Runs one poll cycle. Exactly one remote read pass per invocation,
/// regardless of how many tenants consume the source.
#[allow(clippy::too_many_lines)]
pub async fn run_poll_cycle(
    ctx: &PollContext,
    source: &LogSource,
) -> Result<CycleOutcome, EngineError> {
    let loaded = ctx.cursors.load(&source.id).await?;

    let guard = tokio::select! {
        () = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
        acquired = ctx.pool.acquire(&source.params) => acquired?,
    };

    let info = guard.stat(&source.params.path).await?;

    let (mut cursor, mode, rotated) = match loaded {
        CursorLoad::Found(cursor) => {
            let identity_changed = cursor.fingerprint.identity != info.identity
                && cursor.fingerprint.identity != 0
                && info.identity != 0;
            if identity_changed || info.size < cursor.offset {
                info!(
                    source = %source.id,
                    stored_offset = cursor.offset,
                    remote_size = info.size,
                    "rotation or truncation detected, restarting silent backfill"
                );
                (
                    Cursor::start_of(info.fingerprint()),
                    Mode::Backfill {
                        snapshot: info.size,
                    },
                    true,
                )
            } else if source.state == SourceState::Backfilling {
                // An interrupted backfill resumes silently; the snapshot
                // moves to the current length so the remainder of the
                // catch-up never floods consumers.
                (
                    cursor,
                    Mode::Backfill {
                        snapshot: info.size,
                    },
                    false,
                )
            } else if info.size == cursor.offset {
                drop(guard);
                if source.state != SourceState::Live {
                    // A successful stat is a successful read: restore a
                    // degraded source (or one freshly resumed after a
                    // restart) to live cadence.
                    ctx.registry
                        .set_state(source.id.clone(), SourceState::Live)
                        .await?;
                }
                return Ok(CycleOutcome::Idle);
            } else {
                (cursor, Mode::Tail, false)
            }
        }
        CursorLoad::Absent => (
            Cursor::start_of(info.fingerprint()),
            Mode::Backfill {
                snapshot: info.size,
            },
            false,
        ),
        CursorLoad::SchemaMismatch => {
            warn!(
                source = %source.id,
                "cursor record from a different schema version, re-deriving via backfill"
            );
            (
                Cursor::start_of(info.fingerprint()),
                Mode::Backfill {
                    snapshot: info.size,
                },
                false,
            )
        }
    };

    if matches!(mode, Mode::Backfill { .. }) && source.state != SourceState::Backfilling {
        ctx.registry
            .set_state(source.id.clone(), SourceState::Backfilling)
            .await?;
    }

    let mut events: Vec<NormalizedEvent> = Vec::new();
    let mut lines: u64 = 0;
    let mut malformed: u64 = 0;
    let mut noise: u64 = 0;
    let mut pending: Vec<u8> = Vec::new();
    let mut read_offset = cursor.offset;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let bytes = guard
            .read_from(&source.params.path, read_offset, ctx.config.max_read_chunk)
            .await?;
        if bytes.is_empty() {
            break;
        }
        read_offset += bytes.len() as u64;
        pending.extend_from_slice(&bytes);

        let mut consumed = 0usize;
        while let Some(nl) = pending[consumed..].iter().position(|b| *b == b'\n') {
            let terminator = consumed + nl;
            let line_end = cursor.offset + (terminator - consumed + 1) as u64;
            let text = String::from_utf8_lossy(&pending[consumed..terminator]).into_owned();
            consumed = terminator + 1;
            cursor.offset = line_end;
            cursor.line += 1;
            lines += 1;

            let raw = RawLine {
                source: source.id.clone(),
                line_no: cursor.line,
                text,
            };
            match ctx.normalizer.normalize(&raw) {
                Ok(Some(event)) => {
                    let live = match mode {
                        Mode::Tail => true,
                        Mode::Backfill { snapshot } => line_end > snapshot,
                    };
                    if live {
                        events.push(event);
                    }
                }
                Ok(None) => noise += 1,
                Err(err) => {
                    malformed += 1;
                    debug!(
                        source = %source.id,
                        line = cursor.line,
                        "skipping malformed line: {err}"
                    );
                }
            }
        }
        pending.drain(..consumed);

        // A line longer than the limit cannot complete within any chunk;
        // consume what is buffered as one malformed line and resync at
        // the next terminator.
        if pending.len() > ctx.config.max_line_bytes {
            cursor.offset += pending.len() as u64;
            cursor.line += 1;
            lines += 1;
            malformed += 1;
            pending.clear();
            warn!(
                source = %source.id,
                line = cursor.line,
                limit = ctx.config.max_line_bytes,
                "oversized line skipped"
            );
        }

        // Backfills over years of history can outlive a flaky session;
        // checkpoint after each chunk so an interruption resumes instead
        // of starting over. No events have been dispatched yet, so every
        // checkpoint is a safe committed cursor.
        if matches!(mode, Mode::Backfill { .. }) {
            cursor.fingerprint = Fingerprint {
                size: info.size.max(cursor.offset),
                identity: info.identity,
            };
            cursor.updated_at = Utc::now();
            ctx.cursors.save(&source.id, &cursor).await?;
        }
    }

    // Release the session slot before parsing results are committed and
    // fanned out; downstream consumers never hold up the pool.
    drop(guard);

    if matches!(mode, Mode::Tail) && lines == 0 {
        if source.state != SourceState::Live {
            ctx.registry
                .set_state(source.id.clone(), SourceState::Live)
                .await?;
        }
        return Ok(CycleOutcome::Idle);
    }

    cursor.fingerprint = Fingerprint {
        size: info.size.max(cursor.offset),
        identity: info.identity,
    };
    cursor.updated_at = Utc::now();
    if ctx.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    ctx.cursors.save(&source.id, &cursor).await?;

    ctx.stats.add_lines_read(lines);
    ctx.stats.add_malformed(malformed);
    ctx.stats.add_noise(noise);

    let event_count = events.len() as u64;
    match mode {
        Mode::Backfill { snapshot } => {
            // A trailing unterminated fragment counts toward catch-up:
            // the held bytes are re-read by the next tail cycle, but they
            // must not keep the source out of `Live`.
            if cursor.offset + pending.len() as u64 >= snapshot {
                ctx.registry
                    .set_state(source.id.clone(), SourceState::Live)
                    .await?;
                info!(
                    source = %source.id,
                    lines,
                    offset = cursor.offset,
                    "backfill complete, source is live"
                );
            }
            if !events.is_empty() {
                ctx.stats.add_events_emitted(event_count);
                ctx.dispatcher.dispatch(&source.id, &events, &ctx.stats).await;
            }
            Ok(CycleOutcome::Backfilled {
                lines,
                live_events: event_count,
                rotated,
            })
        }
        Mode::Tail => {
            if source.state != SourceState::Live {
                ctx.registry
                    .set_state(source.id.clone(), SourceState::Live)
                    .await?;
            }
            ctx.stats.add_events_emitted(event_count);
            ctx.dispatcher.dispatch(&source.id, &events, &ctx.stats).await;
            Ok(CycleOutcome::Tailed {
                lines,
                events: event_count,
            })
        }
    }
}
