// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Killfeed Engine
//!
//! Remote log ingestion and event normalization for multi-tenant game
//! statistics. The engine discovers, connects to, incrementally reads,
//! parses, deduplicates, and fans out events from thousands of remote
//! combat-log sources shared across isolated tenant groups.
//!
//! ## Architecture
//!
//! ```text
//!   Source Registry (actor) ──► Poll Scheduler ──► per-source loops
//!                                                      │
//!                          ┌───────────────────────────┤
//!                          v                           v
//!                    Session Pool                Cursor Store
//!                   (bounded, fair)           (atomic, versioned)
//!                          │                           │
//!                          └────────► Poll Cycle ◄─────┘
//!                                        │
//!                                        v
//!                                    Normalizer
//!                                        │
//!                                        v
//!                                 Fanout Dispatcher ──► EventConsumer
//!                                 (one delivery per tenant)
//! ```
//!
//! The library is organized into these modules:
//! - [`registry`]: source descriptors, tenant links, lifecycle state
//! - [`cursor`]: persisted, versioned, crash-atomic read progress
//! - [`pool`] / [`transport`]: bounded remote sessions behind trait seams
//! - [`poll`]: backfill/tail cycle state machine and the scheduler
//! - [`normalize`]: raw lines into canonical deduplicated events
//! - [`fanout`]: at-least-once per-tenant delivery
//! - [`stats`]: per-source observability counters
//!
//! ## Guarantees
//!
//! - Per source, events are dispatched in strictly increasing
//!   line-position order; no ordering across sources.
//! - One remote read per poll cycle regardless of tenant count.
//! - Historical content is absorbed silently; only lines appended after
//!   the connect-time snapshot dispatch events.
//! - Rotation/truncation resets to a silent backfill, never an event
//!   flood.
//! - Every failure is scoped to one source; nothing crashes the process.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

/// Per-source retry pacing: exponential backoff and failure tracking.
pub mod backoff;

/// Engine configuration from defaults and `KF_*` environment overrides.
pub mod config;

/// Persisted cursor records and the cursor store implementations.
pub mod cursor;

/// Error taxonomy and recovery classification.
pub mod error;

/// Per-tenant event delivery.
pub mod fanout;

/// Canonical event model and line normalization.
pub mod normalize;

/// Backfill/tail poll cycles and the per-source scheduler.
pub mod poll;

/// Bounded session pool shared by all sources.
pub mod pool;

/// Actor-based source registry.
pub mod registry;

/// Source descriptors and lifecycle states.
pub mod source;

/// Per-source observability counters.
pub mod stats;

/// Remote file access traits and the local-filesystem implementation.
pub mod transport;

/// Engine version reported in logs at startup.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs the engine version at INFO level; call once after the tracing
/// subscriber is installed.
pub fn log_build_info() {
    tracing::info!("killfeed-engine version: {}", ENGINE_VERSION);
}
