// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote file access behind a session seam.
//!
//! The engine never talks to a transport directly: poll cycles go through
//! the [`crate::pool::SessionPool`], which owns the global session budget.
//! [`SessionFactory`] is the seam where a production deployment plugs in
//! its file-transfer client; [`LocalSessionFactory`] reads through the
//! local filesystem and backs development runs, while tests drive the same
//! traits with scripted mocks.

use std::fmt;
use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::cursor::Fingerprint;
use crate::source::ConnectionParams;

/// What went wrong at the transport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Host unreachable, connection refused or reset. Transient.
    Unreachable,
    /// Credentials rejected. A configuration error: retrying without
    /// operator correction cannot succeed.
    Auth,
    /// Remote file missing. Transient: game servers recreate their log
    /// after a wipe or restart.
    NotFound,
    /// Any other I/O failure during a read.
    Io,
}

/// Transport-layer failure, tagged with a kind the engine's error
/// taxonomy maps onto recovery classes.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    /// True when retrying is pointless until an operator fixes the source
    /// definition.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.kind == TransportErrorKind::Auth
    }

    fn from_io(err: &io::Error, context: &str) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => TransportErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => TransportErrorKind::Auth,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut => TransportErrorKind::Unreachable,
            _ => TransportErrorKind::Io,
        };
        TransportError::new(kind, format!("{context}: {err}"))
    }
}

/// Size and identity of a remote file, observed at stat time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub size: u64,
    /// Stable identity of the file object (inode where the transport can
    /// observe one, otherwise 0 and detection falls back to size alone).
    pub identity: u64,
}

impl RemoteFileInfo {
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            size: self.size,
            identity: self.identity,
        }
    }
}

/// One live session against a remote host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Stats the remote file.
    async fn stat(&self, path: &str) -> Result<RemoteFileInfo, TransportError>;

    /// Reads up to `max_bytes` starting at `offset`. Returns fewer bytes
    /// only at end of file.
    async fn read_from(
        &self,
        path: &str,
        offset: u64,
        max_bytes: usize,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Produces sessions for the pool. One factory serves every source; the
/// per-source connection parameters select the host.
#[async_trait]
pub trait SessionFactory: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// Session over the local filesystem: the source's `path` names a local
/// file and the host parameters are ignored.
#[derive(Debug)]
pub struct LocalSession;

#[async_trait]
impl RemoteSession for LocalSession {
    async fn stat(&self, path: &str) -> Result<RemoteFileInfo, TransportError> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| TransportError::from_io(&e, "stat"))?;
        Ok(RemoteFileInfo {
            size: meta.len(),
            identity: file_identity(&meta),
        })
    }

    async fn read_from(
        &self,
        path: &str,
        offset: u64,
        max_bytes: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| TransportError::from_io(&e, "open"))?;
        file.seek(io::SeekFrom::Start(offset))
            .await
            .map_err(|e| TransportError::from_io(&e, "seek"))?;
        let mut buf = vec![0u8; max_bytes];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| TransportError::from_io(&e, "read"))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Factory handing out [`LocalSession`]s.
#[derive(Debug, Default)]
pub struct LocalSessionFactory;

#[async_trait]
impl SessionFactory for LocalSessionFactory {
    async fn connect(
        &self,
        _params: &ConnectionParams,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        Ok(Box::new(LocalSession))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_local_stat_reports_size_and_identity() {
        let file = write_test_file(b"one\ntwo\n");
        let session = LocalSession;
        let info = session.stat(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(info.size, 8);
        #[cfg(unix)]
        assert_ne!(info.identity, 0);
    }

    #[tokio::test]
    async fn test_local_read_from_offset() {
        let file = write_test_file(b"one\ntwo\nthree\n");
        let session = LocalSession;
        let bytes = session
            .read_from(file.path().to_str().unwrap(), 4, 1024)
            .await
            .unwrap();
        assert_eq!(bytes, b"two\nthree\n");
    }

    #[tokio::test]
    async fn test_local_read_respects_max_bytes() {
        let file = write_test_file(b"abcdefgh");
        let session = LocalSession;
        let bytes = session
            .read_from(file.path().to_str().unwrap(), 0, 3)
            .await
            .unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[tokio::test]
    async fn test_missing_file_maps_to_not_found() {
        let session = LocalSession;
        let err = session.stat("/nonexistent/deathlog.csv").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::NotFound);
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_auth_errors_are_configuration() {
        let err = TransportError::new(TransportErrorKind::Auth, "denied");
        assert!(err.is_configuration());
    }
}
