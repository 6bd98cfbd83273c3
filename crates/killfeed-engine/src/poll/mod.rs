// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Poll orchestration: the per-source cycle state machine and the
//! scheduler that runs one recurring task per source.
//!
//! # Cycle ordering
//!
//! ```text
//!   acquire session ──► stat ──► read to EOF ──► release session
//!        │                                            │
//!        v                                            v
//!   (skip cycle on                          parse ──► save cursor ──► dispatch
//!    pool timeout)                                    (abort before
//!                                                      dispatch on
//!                                                      save failure)
//! ```
//!
//! The session slot is released before fanout, so slow downstream
//! consumers can never starve the connection pool. The cursor is persisted
//! before dispatch, so a crash between the two re-delivers (at-least-once)
//! instead of dropping.

pub mod cycle;
pub mod scheduler;

pub use cycle::{run_poll_cycle, CycleOutcome, PollContext};
pub use scheduler::PollScheduler;
