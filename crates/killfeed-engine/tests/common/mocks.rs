// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transport, consumer, and cursor store used by the integration
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use killfeed_engine::cursor::{Cursor, CursorLoad, CursorStore, CursorStoreError};
use killfeed_engine::fanout::{DeliveryError, EventConsumer};
use killfeed_engine::normalize::NormalizedEvent;
use killfeed_engine::source::{ConnectionParams, SourceId, TenantId};
use killfeed_engine::transport::{
    RemoteFileInfo, RemoteSession, SessionFactory, TransportError, TransportErrorKind,
};

struct ScriptedFile {
    content: Vec<u8>,
    identity: u64,
}

/// Scripted remote host: files are plain byte buffers with a controllable
/// identity signal, and connection failures can be injected.
#[derive(Default)]
pub struct ScriptedHost {
    files: Mutex<HashMap<String, ScriptedFile>>,
    next_identity: AtomicU64,
    fail_connects: AtomicU64,
    auth_failure: AtomicBool,
    connect_count: AtomicU64,
    read_count: AtomicU64,
    append_after_read: Mutex<Option<(String, String)>>,
}

impl ScriptedHost {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedHost {
            next_identity: AtomicU64::new(1),
            ..ScriptedHost::default()
        })
    }

    /// Creates or replaces a file, keeping its identity if it exists.
    pub fn write_file(self: &Arc<Self>, path: &str, content: &str) {
        let mut files = self.files.lock().unwrap();
        match files.get_mut(path) {
            Some(file) => file.content = content.as_bytes().to_vec(),
            None => {
                let identity = self.next_identity.fetch_add(1, Ordering::SeqCst);
                files.insert(
                    path.to_string(),
                    ScriptedFile {
                        content: content.as_bytes().to_vec(),
                        identity,
                    },
                );
            }
        }
    }

    /// Appends to a file without touching its identity.
    pub fn append(self: &Arc<Self>, path: &str, content: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get_mut(path) {
            file.content.extend_from_slice(content.as_bytes());
        }
    }

    /// Replaces a file with new content under a new identity, like
    /// logrotate creating a fresh file at the same path.
    pub fn rotate(self: &Arc<Self>, path: &str, content: &str) {
        let identity = self.next_identity.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().insert(
            path.to_string(),
            ScriptedFile {
                content: content.as_bytes().to_vec(),
                identity,
            },
        );
    }

    /// Appends `content` to `path` right after the next non-empty read,
    /// simulating lines landing while a backfill pass is mid-flight.
    pub fn append_after_next_read(self: &Arc<Self>, path: &str, content: &str) {
        *self.append_after_read.lock().unwrap() =
            Some((path.to_string(), content.to_string()));
    }

    /// Fails the next `n` connection attempts with an unreachable error.
    pub fn fail_next_connects(self: &Arc<Self>, n: u64) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Makes every connection attempt fail authentication.
    pub fn set_auth_failure(self: &Arc<Self>, fail: bool) {
        self.auth_failure.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(self: &Arc<Self>) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn read_count(self: &Arc<Self>) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }
}

/// Factory producing sessions against a [`ScriptedHost`].
#[derive(Debug)]
pub struct ScriptedFactory {
    host: Arc<ScriptedHost>,
}

impl ScriptedFactory {
    pub fn new(host: Arc<ScriptedHost>) -> Self {
        ScriptedFactory { host }
    }
}

impl std::fmt::Debug for ScriptedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedHost").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn connect(
        &self,
        _params: &ConnectionParams,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        if self.host.auth_failure.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                TransportErrorKind::Auth,
                "credentials rejected",
            ));
        }
        let remaining = self.host.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.host.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::new(
                TransportErrorKind::Unreachable,
                "connection refused",
            ));
        }
        self.host.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            host: Arc::clone(&self.host),
        }))
    }
}

struct ScriptedSession {
    host: Arc<ScriptedHost>,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn stat(&self, path: &str) -> Result<RemoteFileInfo, TransportError> {
        let files = self.host.files.lock().unwrap();
        files
            .get(path)
            .map(|file| RemoteFileInfo {
                size: file.content.len() as u64,
                identity: file.identity,
            })
            .ok_or_else(|| TransportError::new(TransportErrorKind::NotFound, "no such file"))
    }

    async fn read_from(
        &self,
        path: &str,
        offset: u64,
        max_bytes: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.host.read_count.fetch_add(1, Ordering::SeqCst);
        let result = {
            let files = self.host.files.lock().unwrap();
            let file = files.get(path).ok_or_else(|| {
                TransportError::new(TransportErrorKind::NotFound, "no such file")
            })?;
            let start = (offset as usize).min(file.content.len());
            let end = (start + max_bytes).min(file.content.len());
            file.content[start..end].to_vec()
        };
        if !result.is_empty() {
            let pending = self.host.append_after_read.lock().unwrap().take();
            if let Some((target, content)) = pending {
                if target == path {
                    self.host.append(&target, &content);
                } else {
                    *self.host.append_after_read.lock().unwrap() = Some((target, content));
                }
            }
        }
        Ok(result)
    }
}

/// Consumer recording every delivery in arrival order.
#[derive(Default)]
pub struct CollectingConsumer {
    deliveries: Mutex<Vec<(TenantId, NormalizedEvent)>>,
}

impl CollectingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(CollectingConsumer::default())
    }

    pub fn deliveries(&self) -> Vec<(TenantId, NormalizedEvent)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn deliveries_for(&self, tenant: TenantId) -> Vec<NormalizedEvent> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tenant)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl EventConsumer for CollectingConsumer {
    async fn accept(
        &self,
        event: &NormalizedEvent,
        tenant: TenantId,
    ) -> Result<(), DeliveryError> {
        self.deliveries
            .lock()
            .unwrap()
            .push((tenant, event.clone()));
        Ok(())
    }
}

/// Cursor store wrapper whose saves can be made to fail, for exercising
/// the abort-before-dispatch path.
pub struct FailingCursorStore<S> {
    inner: S,
    fail_saves: AtomicBool,
}

impl<S> FailingCursorStore<S> {
    pub fn new(inner: S) -> Self {
        FailingCursorStore {
            inner,
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: CursorStore> CursorStore for FailingCursorStore<S> {
    async fn load(&self, id: &SourceId) -> Result<CursorLoad, CursorStoreError> {
        self.inner.load(id).await
    }

    async fn save(&self, id: &SourceId, cursor: &Cursor) -> Result<(), CursorStoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CursorStoreError::io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected save failure",
            )));
        }
        self.inner.save(id, cursor).await
    }

    async fn remove(&self, id: &SourceId) -> Result<(), CursorStoreError> {
        self.inner.remove(id).await
    }
}
