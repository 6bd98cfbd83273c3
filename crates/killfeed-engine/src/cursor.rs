// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persisted read progress, one record per source.
//!
//! A cursor survives process restarts so a source is neither reprocessed
//! nor skipped. The record carries a schema version: on a version bump the
//! store reports a mismatch instead of misinterpreting stale bytes, and the
//! caller re-derives state (a silent re-backfill).
//!
//! # Crash atomicity
//!
//! [`FileCursorStore`] writes the new record to a temporary file in the
//! same directory and renames it over the old one. A restart observes
//! either the prior cursor or the fully updated one, never a torn write.
//! The poll cycle persists the cursor *before* dispatching the batch, so a
//! crash between the two re-delivers (at-least-once) rather than dropping.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::source::SourceId;

/// Current layout version of persisted cursor records.
pub const CURSOR_SCHEMA_VERSION: u32 = 1;

/// Identity signal for the remote file, used to detect rotation and
/// truncation.
///
/// `size` regressing below the stored offset, or `identity` changing,
/// both mean the file we were reading is gone; the caller resets to a
/// silent backfill rather than diffing against stale content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File size in bytes at the last successful poll.
    pub size: u64,
    /// Transport-defined identity (inode where available, otherwise 0).
    pub identity: u64,
}

/// Resumable read position for one source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub version: u32,
    /// Byte offset of the first unconsumed byte. Only ever advanced past
    /// complete (terminated) lines.
    pub offset: u64,
    /// Number of complete lines consumed so far.
    pub line: u64,
    pub fingerprint: Fingerprint,
    pub updated_at: DateTime<Utc>,
}

impl Cursor {
    /// Fresh cursor at the start of a file with the observed fingerprint.
    #[must_use]
    pub fn start_of(fingerprint: Fingerprint) -> Self {
        Cursor {
            version: CURSOR_SCHEMA_VERSION,
            offset: 0,
            line: 0,
            fingerprint,
            updated_at: Utc::now(),
        }
    }
}

/// Result of a cursor load.
#[derive(Clone, Debug, PartialEq)]
pub enum CursorLoad {
    Found(Cursor),
    Absent,
    /// The record exists but was written by a different schema version.
    /// The caller treats the source as freshly registered.
    SchemaMismatch,
}

/// Errors from the cursor store. All of them are persistence failures:
/// the current poll cycle aborts without dispatching and the previously
/// committed cursor remains authoritative.
#[derive(Debug, Error)]
pub enum CursorStoreError {
    #[error("cursor io: {0}")]
    Io(#[from] io::Error),
    #[error("cursor record corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl CursorStoreError {
    pub fn io(err: io::Error) -> Self {
        CursorStoreError::Io(err)
    }
}

/// Storage contract for cursor records.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, id: &SourceId) -> Result<CursorLoad, CursorStoreError>;
    async fn save(&self, id: &SourceId, cursor: &Cursor) -> Result<(), CursorStoreError>;
    async fn remove(&self, id: &SourceId) -> Result<(), CursorStoreError>;
}

/// File-backed store: one JSON record per source under a spool directory.
#[derive(Clone, Debug)]
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileCursorStore { dir: dir.into() }
    }

    fn record_path(&self, id: &SourceId) -> PathBuf {
        // Source ids come from the admin surface; keep the file name safe
        // regardless of what they contain.
        let safe: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, id: &SourceId) -> Result<CursorLoad, CursorStoreError> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CursorLoad::Absent),
            Err(err) => return Err(err.into()),
        };
        // An unreadable record is treated like a schema mismatch: the
        // caller re-derives state with a silent backfill instead of the
        // source wedging on a load error every cycle.
        let cursor: Cursor = match serde_json::from_slice(&bytes) {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!(source = %id, "cursor record unreadable, re-deriving: {err}");
                return Ok(CursorLoad::SchemaMismatch);
            }
        };
        if cursor.version != CURSOR_SCHEMA_VERSION {
            debug!(source = %id, found = cursor.version, "cursor schema mismatch");
            return Ok(CursorLoad::SchemaMismatch);
        }
        Ok(CursorLoad::Found(cursor))
    }

    async fn save(&self, id: &SourceId, cursor: &Cursor) -> Result<(), CursorStoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(cursor)?;
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: &SourceId) -> Result<(), CursorStoreError> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    records: Mutex<HashMap<SourceId, Cursor>>,
}

impl MemoryCursorStore {
    #[must_use]
    pub fn new() -> Self {
        MemoryCursorStore::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, id: &SourceId) -> Result<CursorLoad, CursorStoreError> {
        #[allow(clippy::unwrap_used)]
        let records = self.records.lock().unwrap();
        match records.get(id) {
            Some(cursor) if cursor.version == CURSOR_SCHEMA_VERSION => {
                Ok(CursorLoad::Found(cursor.clone()))
            }
            Some(_) => Ok(CursorLoad::SchemaMismatch),
            None => Ok(CursorLoad::Absent),
        }
    }

    async fn save(&self, id: &SourceId, cursor: &Cursor) -> Result<(), CursorStoreError> {
        #[allow(clippy::unwrap_used)]
        self.records
            .lock()
            .unwrap()
            .insert(id.clone(), cursor.clone());
        Ok(())
    }

    async fn remove(&self, id: &SourceId) -> Result<(), CursorStoreError> {
        #[allow(clippy::unwrap_used)]
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
}
