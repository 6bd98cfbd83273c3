// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the ingestion engine.
//!
//! Every failure in the engine is scoped to a single source's poll cycle;
//! nothing here may abort the process. The [`FailureClass`] classifier is
//! what the scheduler uses to decide recovery:
//!
//! - **Transient**: retried with per-source backoff; past the configured
//!   threshold the source is marked degraded.
//! - **Persistence**: fatal for the current cycle only. The cycle aborts
//!   before dispatching anything, so the next attempt re-reads the same
//!   range against the previously committed cursor.
//! - **Configuration**: the source never leaves `Registered`; operators
//!   must correct the definition before the engine retries.

use std::time::Duration;

use thiserror::Error;

use crate::cursor::CursorStoreError;
use crate::source::SourceId;
use crate::transport::TransportError;

/// How the scheduler should react to a failed poll cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff; counts toward the degraded threshold.
    Transient,
    /// Abort the cycle without dispatch; the committed cursor stays valid.
    Persistence,
    /// Report and stop polling until the source definition is corrected.
    Configuration,
}

/// Errors produced while polling a source.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The remote transport failed (connect, stat, or read).
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// No session slot became available within the acquire timeout.
    ///
    /// This is not a source failure: the cycle is skipped and rescheduled
    /// without touching the source's backoff state.
    #[error("timed out waiting {waited:?} for a session slot")]
    AcquireTimeout { waited: Duration },

    /// The remote read did not complete within the read timeout.
    #[error("remote read timed out after {waited:?}")]
    ReadTimeout { waited: Duration },

    /// The cursor store failed to load or persist a record.
    #[error("cursor store: {0}")]
    CursorStore(#[from] CursorStoreError),

    /// A source definition failed validation.
    #[error("invalid source definition: {reason}")]
    InvalidSource { reason: String },

    /// An operation referenced a source the registry does not know.
    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    /// The registry actor is gone; only seen during shutdown.
    #[error("registry unavailable")]
    RegistryClosed,

    /// The source's poll loop was cancelled mid-cycle.
    #[error("poll cycle cancelled")]
    Cancelled,
}

impl EngineError {
    /// Classifies this error for the scheduler's recovery decision.
    ///
    /// Returns `None` for errors that are neither retried nor reported as
    /// source failures: an acquire timeout just reschedules the cycle, and
    /// cancellation ends the loop.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            EngineError::Transport(err) if err.is_configuration() => {
                Some(FailureClass::Configuration)
            }
            EngineError::Transport(_) | EngineError::ReadTimeout { .. } => {
                Some(FailureClass::Transient)
            }
            EngineError::CursorStore(_) => Some(FailureClass::Persistence),
            EngineError::InvalidSource { .. } => Some(FailureClass::Configuration),
            EngineError::AcquireTimeout { .. }
            | EngineError::Cancelled
            | EngineError::UnknownSource(_)
            | EngineError::RegistryClosed => None,
        }
    }
}
