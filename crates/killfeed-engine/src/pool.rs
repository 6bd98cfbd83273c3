// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! System-wide bounded session pool.
//!
//! Thousands of registered sources share at most `max_sessions` concurrent
//! remote sessions, independent of source count, so the engine never
//! exhausts remote-host connection limits. Admission is a fair FIFO
//! semaphore: a source stuck in backoff holds no permit, so it cannot
//! starve healthy sources.
//!
//! Acquiring blocks up to the configured timeout. A timeout is *not* a
//! source failure: the poll cycle is skipped and rescheduled. The read
//! timeout is applied around every remote call made through the guard, so
//! a hung host converts into a recoverable per-source failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::trace;

use crate::error::EngineError;
use crate::source::ConnectionParams;
use crate::transport::{RemoteFileInfo, RemoteSession, SessionFactory};

/// Bounded pool of remote sessions shared by all sources.
#[derive(Clone, Debug)]
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    read_timeout: Duration,
}

impl SessionPool {
    #[must_use]
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        max_sessions: usize,
        acquire_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        SessionPool {
            factory,
            permits: Arc::new(Semaphore::new(max_sessions)),
            acquire_timeout,
            read_timeout,
        }
    }

    /// Number of session slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Acquires a session slot and connects to the source's host.
    ///
    /// Fails with [`EngineError::AcquireTimeout`] when the pool stays
    /// saturated past the acquire timeout, and with a transport error when
    /// the connect itself fails (the permit is released either way).
    pub async fn acquire(&self, params: &ConnectionParams) -> Result<SessionGuard, EngineError> {
        let permit = match timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(EngineError::Cancelled),
            Err(_elapsed) => {
                return Err(EngineError::AcquireTimeout {
                    waited: self.acquire_timeout,
                })
            }
        };
        trace!(host = %params.host, "session slot acquired");

        let session = self.factory.connect(params).await?;
        Ok(SessionGuard {
            session,
            read_timeout: self.read_timeout,
            _permit: permit,
        })
    }
}

/// A live session plus its pool permit. Dropping the guard releases the
/// slot; the poll cycle drops it before fanout so slow consumers cannot
/// hold connections hostage.
pub struct SessionGuard {
    session: Box<dyn RemoteSession>,
    read_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionGuard {
    /// Stats the remote file, bounded by the read timeout.
    pub async fn stat(&self, path: &str) -> Result<RemoteFileInfo, EngineError> {
        match timeout(self.read_timeout, self.session.stat(path)).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_elapsed) => Err(EngineError::ReadTimeout {
                waited: self.read_timeout,
            }),
        }
    }

    /// Reads from the remote file, bounded by the read timeout.
    pub async fn read_from(
        &self,
        path: &str,
        offset: u64,
        max_bytes: usize,
    ) -> Result<Vec<u8>, EngineError> {
        match timeout(self.read_timeout, self.session.read_from(path, offset, max_bytes)).await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_elapsed) => Err(EngineError::ReadTimeout {
                waited: self.read_timeout,
            }),
        }
    }
}
