// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Source descriptors: identity, connection parameters, tenant links, and
//! the lifecycle state machine.
//!
//! A source is one remote log file. Several tenants may share it; the
//! engine reads the file once per poll cycle and fans events out to every
//! currently linked tenant. All mutation goes through the registry actor
//! so tenant-set changes are serialized against dispatch-time resolution.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Unique identifier for a remote log source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        SourceId(value.to_string())
    }
}

/// Identifier of an isolated tenant group consuming events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection parameters for one remote log file.
///
/// The password never appears in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote path of the log file to tail.
    pub path: String,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("path", &self.path)
            .finish()
    }
}

/// Lifecycle state of a source.
///
/// ```text
/// Registered ──► Backfilling ──► Live ◄──► Degraded
///      │                          │
///      └──────────────────────────┴──────► Removed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Known to the registry; no successful connection yet, or the
    /// definition is invalid and awaiting operator correction.
    Registered,
    /// Silent catch-up over pre-existing content is in progress.
    Backfilling,
    /// Tailing newly appended content and dispatching events.
    Live,
    /// Too many consecutive failures; polled at the reduced cadence.
    Degraded,
    /// Last tenant unlinked or source deleted; cursor retained until the
    /// retention window expires.
    Removed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceState::Registered => "registered",
            SourceState::Backfilling => "backfilling",
            SourceState::Live => "live",
            SourceState::Degraded => "degraded",
            SourceState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Descriptor for one remote log source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSource {
    pub id: SourceId,
    pub params: ConnectionParams,
    /// Tenants currently receiving this source's events. Non-empty for
    /// every state except `Removed`.
    pub tenants: BTreeSet<TenantId>,
    pub state: SourceState,
    /// Bumped by the registry on every descriptor update. Poll loops
    /// parked on a configuration error watch this to notice operator
    /// corrections.
    #[serde(default)]
    pub generation: u64,
}

impl LogSource {
    /// Builds a new source in `Registered` state.
    pub fn new(
        id: SourceId,
        params: ConnectionParams,
        tenants: impl IntoIterator<Item = TenantId>,
    ) -> Self {
        LogSource {
            id,
            params,
            tenants: tenants.into_iter().collect(),
            state: SourceState::Registered,
            generation: 0,
        }
    }

    /// Validates the descriptor before registration.
    ///
    /// Rejections here are configuration errors: the registry refuses the
    /// source and nothing is scheduled.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.as_str().is_empty() {
            return Err(EngineError::InvalidSource {
                reason: "source id is empty".to_string(),
            });
        }
        if self.params.host.is_empty() {
            return Err(EngineError::InvalidSource {
                reason: format!("source {} has no host", self.id),
            });
        }
        if self.params.path.is_empty() {
            return Err(EngineError::InvalidSource {
                reason: format!("source {} has no remote path", self.id),
            });
        }
        if self.tenants.is_empty() {
            return Err(EngineError::InvalidSource {
                reason: format!("source {} has no linked tenants", self.id),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn create_test_params() -> ConnectionParams {
        ConnectionParams {
            host: "game-01.example.com".to_string(),
            port: 22,
            username: "logs".to_string(),
            password: "hunter2".to_string(),
            path: "/srv/game/deathlog.csv".to_string(),
        }
    }

    #[test]
    fn test_valid_source_passes_validation() {
        let source = LogSource::new(SourceId::from("srv-1"), create_test_params(), [TenantId(7)]);
        assert!(source.validate().is_ok());
        assert_eq!(source.state, SourceState::Registered);
    }

    #[test]
    fn test_source_without_tenants_is_rejected() {
        let source = LogSource::new(SourceId::from("srv-1"), create_test_params(), []);
        let err = source.validate().unwrap_err();
        assert!(err.to_string().contains("no linked tenants"));
    }

    #[test]
    fn test_source_without_host_is_rejected() {
        let mut params = create_test_params();
        params.host = String::new();
        let source = LogSource::new(SourceId::from("srv-1"), params, [TenantId(7)]);
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_source_without_path_is_rejected() {
        let mut params = create_test_params();
        params.path = String::new();
        let source = LogSource::new(SourceId::from("srv-1"), params, [TenantId(7)]);
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", create_test_params());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SourceState::Backfilling.to_string(), "backfilling");
        assert_eq!(SourceState::Degraded.to_string(), "degraded");
    }
}
