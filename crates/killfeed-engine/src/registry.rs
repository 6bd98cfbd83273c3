// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor-based source registry.
//!
//! The registry owns every source descriptor and is the single writer for
//! tenant links and lifecycle state. It follows the actor pattern used by
//! the metrics aggregator service: callers hold a cloneable
//! [`RegistryHandle`] and send commands over a channel; the
//! [`RegistryService`] task owns the state and processes commands one at a
//! time.
//!
//! Sequential command processing is what gives the engine two of its
//! isolation guarantees for free:
//!
//! - tenant-link mutations are serialized against dispatch-time tenant
//!   resolution, so a tenant is never skipped or double-counted mid-cycle;
//! - concurrent modifications of the same source's tenant set cannot
//!   interleave.
//!
//! A removed source stays in the registry (state `Removed`) until the
//! retention window expires, so a quick re-add can resume from the
//! retained cursor; the scheduler reaps expired entries and their cursors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::source::{LogSource, SourceId, SourceState, TenantId};
use crate::stats::{SourceStats, StatsSnapshot};

/// Outcome of a tenant unlink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// Other tenants remain linked; the source keeps running.
    Remaining(usize),
    /// The last tenant was unlinked; the source is now `Removed`.
    SourceRemoved,
}

/// Commands processed by the registry service.
#[derive(Debug)]
enum RegistryCommand {
    Add {
        source: LogSource,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Update {
        source: LogSource,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    LinkTenant {
        id: SourceId,
        tenant: TenantId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    UnlinkTenant {
        id: SourceId,
        tenant: TenantId,
        reply: oneshot::Sender<Result<UnlinkOutcome, EngineError>>,
    },
    Remove {
        id: SourceId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetState {
        id: SourceId,
        state: SourceState,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ResolveTenants {
        id: SourceId,
        reply: oneshot::Sender<Vec<TenantId>>,
    },
    Get {
        id: SourceId,
        reply: oneshot::Sender<Option<LogSource>>,
    },
    ListActive {
        reply: oneshot::Sender<Vec<LogSource>>,
    },
    Stats {
        id: SourceId,
        reply: oneshot::Sender<Option<Arc<SourceStats>>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(SourceId, StatsSnapshot)>>,
    },
    ReapRemoved {
        cutoff: DateTime<Utc>,
        reply: oneshot::Sender<Vec<SourceId>>,
    },
    Shutdown,
}

struct SourceEntry {
    source: LogSource,
    stats: Arc<SourceStats>,
    removed_at: Option<DateTime<Utc>>,
}

/// Cloneable handle for sending commands to the registry service.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        command: RegistryCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::RegistryClosed)?;
        rx.await.map_err(|_| EngineError::RegistryClosed)
    }

    /// Registers a new source. Fails on validation errors or a duplicate
    /// id.
    pub async fn add(&self, source: LogSource) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Add { source, reply }, rx)
            .await?
    }

    /// Replaces the connection parameters and tenant set of an existing
    /// source. Lifecycle state and cursor are untouched.
    pub async fn update(&self, source: LogSource) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Update { source, reply }, rx)
            .await?
    }

    /// Links a tenant to a source. Never restarts backfill: the new
    /// tenant receives events observed from this point forward only.
    pub async fn link_tenant(&self, id: SourceId, tenant: TenantId) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::LinkTenant { id, tenant, reply }, rx)
            .await?
    }

    /// Unlinks a tenant; unlinking the last tenant removes the source.
    pub async fn unlink_tenant(
        &self,
        id: SourceId,
        tenant: TenantId,
    ) -> Result<UnlinkOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::UnlinkTenant { id, tenant, reply }, rx)
            .await?
    }

    /// Removes a source outright; its poll loop is cancelled at the next
    /// suspension point by the scheduler's sync pass.
    pub async fn remove(&self, id: SourceId) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Remove { id, reply }, rx)
            .await?
    }

    /// Transitions a source's lifecycle state.
    pub async fn set_state(&self, id: SourceId, state: SourceState) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::SetState { id, state, reply }, rx)
            .await?
    }

    /// Resolves the tenant set at dispatch time. Unknown or removed
    /// sources resolve to an empty set (the event is dropped, not an
    /// error).
    pub async fn resolve_tenants(&self, id: &SourceId) -> Result<Vec<TenantId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::ResolveTenants {
                id: id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Returns the current descriptor for a source, `Removed` included.
    pub async fn get(&self, id: &SourceId) -> Result<Option<LogSource>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Get {
                id: id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Lists sources eligible for scheduling (everything not `Removed`).
    pub async fn list_active(&self) -> Result<Vec<LogSource>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::ListActive { reply }, rx).await
    }

    /// Returns the shared counters for a source.
    pub async fn stats(&self, id: &SourceId) -> Result<Option<Arc<SourceStats>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            RegistryCommand::Stats {
                id: id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Observability snapshot across all known sources.
    pub async fn snapshot(&self) -> Result<Vec<(SourceId, StatsSnapshot)>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::Snapshot { reply }, rx).await
    }

    /// Drops `Removed` entries older than `cutoff` and returns their ids
    /// so the caller can retire the persisted cursors.
    pub async fn reap_removed(&self, cutoff: DateTime<Utc>) -> Result<Vec<SourceId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(RegistryCommand::ReapRemoved { cutoff, reply }, rx)
            .await
    }

    /// Stops the registry service.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RegistryCommand::Shutdown);
    }
}

/// Registry service owning all source state. Spawn with [`Self::run`].
pub struct RegistryService {
    sources: HashMap<SourceId, SourceEntry>,
    rx: mpsc::UnboundedReceiver<RegistryCommand>,
}

impl RegistryService {
    /// Creates the service and its handle.
    #[must_use]
    pub fn new() -> (Self, RegistryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RegistryService {
                sources: HashMap::new(),
                rx,
            },
            RegistryHandle { tx },
        )
    }

    /// Processes commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("source registry started");
        while let Some(command) = self.rx.recv().await {
            if !self.handle_command(command) {
                break;
            }
        }
        debug!("source registry stopped");
    }

    #[allow(clippy::too_many_lines)]
    fn handle_command(&mut self, command: RegistryCommand) -> bool {
        match command {
            RegistryCommand::Add { source, reply } => {
                let _ = reply.send(self.add(source));
            }
            RegistryCommand::Update { source, reply } => {
                let _ = reply.send(self.update(source));
            }
            RegistryCommand::LinkTenant { id, tenant, reply } => {
                let _ = reply.send(self.link_tenant(&id, tenant));
            }
            RegistryCommand::UnlinkTenant { id, tenant, reply } => {
                let _ = reply.send(self.unlink_tenant(&id, tenant));
            }
            RegistryCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove(&id));
            }
            RegistryCommand::SetState { id, state, reply } => {
                let _ = reply.send(self.set_state(&id, state));
            }
            RegistryCommand::ResolveTenants { id, reply } => {
                let tenants = self
                    .sources
                    .get(&id)
                    .filter(|entry| entry.source.state != SourceState::Removed)
                    .map(|entry| entry.source.tenants.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(tenants);
            }
            RegistryCommand::Get { id, reply } => {
                let source = self.sources.get(&id).map(|entry| entry.source.clone());
                let _ = reply.send(source);
            }
            RegistryCommand::ListActive { reply } => {
                let active = self
                    .sources
                    .values()
                    .filter(|entry| entry.source.state != SourceState::Removed)
                    .map(|entry| entry.source.clone())
                    .collect();
                let _ = reply.send(active);
            }
            RegistryCommand::Stats { id, reply } => {
                let stats = self.sources.get(&id).map(|entry| Arc::clone(&entry.stats));
                let _ = reply.send(stats);
            }
            RegistryCommand::Snapshot { reply } => {
                let mut snapshot: Vec<_> = self
                    .sources
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.stats.snapshot(entry.source.state)))
                    .collect();
                snapshot.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(snapshot);
            }
            RegistryCommand::ReapRemoved { cutoff, reply } => {
                let expired: Vec<SourceId> = self
                    .sources
                    .iter()
                    .filter(|(_, entry)| {
                        entry.removed_at.map_or(false, |removed| removed <= cutoff)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &expired {
                    self.sources.remove(id);
                    info!(source = %id, "reaped removed source");
                }
                let _ = reply.send(expired);
            }
            RegistryCommand::Shutdown => {
                debug!("source registry shutting down");
                return false;
            }
        }
        true
    }

    fn add(&mut self, source: LogSource) -> Result<(), EngineError> {
        source.validate()?;
        if self.sources.contains_key(&source.id) {
            return Err(EngineError::InvalidSource {
                reason: format!("source {} already registered", source.id),
            });
        }
        info!(source = %source.id, tenants = source.tenants.len(), "source registered");
        self.sources.insert(
            source.id.clone(),
            SourceEntry {
                source,
                stats: Arc::new(SourceStats::default()),
                removed_at: None,
            },
        );
        Ok(())
    }

    fn update(&mut self, source: LogSource) -> Result<(), EngineError> {
        source.validate()?;
        let entry = self
            .sources
            .get_mut(&source.id)
            .ok_or_else(|| EngineError::UnknownSource(source.id.clone()))?;
        // State is owned by the lifecycle machinery, not the admin
        // surface; only descriptor fields are replaced.
        entry.source.params = source.params;
        entry.source.tenants = source.tenants;
        entry.source.generation += 1;
        Ok(())
    }

    fn link_tenant(&mut self, id: &SourceId, tenant: TenantId) -> Result<(), EngineError> {
        let entry = self
            .sources
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownSource(id.clone()))?;
        if entry.source.state == SourceState::Removed {
            return Err(EngineError::UnknownSource(id.clone()));
        }
        if entry.source.tenants.insert(tenant) {
            entry.source.generation += 1;
            info!(source = %id, %tenant, "tenant linked");
        }
        Ok(())
    }

    fn unlink_tenant(
        &mut self,
        id: &SourceId,
        tenant: TenantId,
    ) -> Result<UnlinkOutcome, EngineError> {
        let entry = self
            .sources
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownSource(id.clone()))?;
        if entry.source.tenants.remove(&tenant) {
            entry.source.generation += 1;
        } else {
            warn!(source = %id, %tenant, "unlink for tenant that was not linked");
        }
        if entry.source.tenants.is_empty() {
            entry.source.state = SourceState::Removed;
            entry.removed_at = Some(Utc::now());
            info!(source = %id, "last tenant unlinked, source removed");
            return Ok(UnlinkOutcome::SourceRemoved);
        }
        Ok(UnlinkOutcome::Remaining(entry.source.tenants.len()))
    }

    fn remove(&mut self, id: &SourceId) -> Result<(), EngineError> {
        let entry = self
            .sources
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownSource(id.clone()))?;
        entry.source.state = SourceState::Removed;
        entry.removed_at = Some(Utc::now());
        info!(source = %id, "source removed");
        Ok(())
    }

    fn set_state(&mut self, id: &SourceId, state: SourceState) -> Result<(), EngineError> {
        let entry = self
            .sources
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownSource(id.clone()))?;
        // A removed source stays removed; a late state write from an
        // in-flight poll must not resurrect it.
        if entry.source.state == SourceState::Removed {
            return Ok(());
        }
        if entry.source.state != state {
            debug!(source = %id, from = %entry.source.state, to = %state, "state transition");
            entry.source.state = state;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::ConnectionParams;

    fn create_test_source(id: &str, tenants: &[u64]) -> LogSource {
        LogSource::new(
            SourceId::from(id),
            ConnectionParams {
                host: "game-01.example.com".to_string(),
                port: 22,
                username: "logs".to_string(),
                password: "pw".to_string(),
                path: "/srv/game/deathlog.csv".to_string(),
            },
            tenants.iter().copied().map(TenantId),
        )
    }

    fn spawn_registry() -> RegistryHandle {
        let (service, handle) = RegistryService::new();
        tokio::spawn(service.run());
        handle
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();

        let active = registry.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, SourceState::Registered);
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();
        let err = registry
            .add(create_test_source("srv-1", &[8]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_invalid_source_rejected() {
        let registry = spawn_registry();
        let err = registry
            .add(create_test_source("srv-1", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSource { .. }));
    }

    #[tokio::test]
    async fn test_link_tenant_does_not_touch_state() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();
        registry
            .set_state(SourceId::from("srv-1"), SourceState::Live)
            .await
            .unwrap();

        registry
            .link_tenant(SourceId::from("srv-1"), TenantId(8))
            .await
            .unwrap();

        let active = registry.list_active().await.unwrap();
        assert_eq!(active[0].state, SourceState::Live);
        assert_eq!(active[0].tenants.len(), 2);
    }

    #[tokio::test]
    async fn test_unlink_last_tenant_removes_source() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7, 8]))
            .await
            .unwrap();

        let outcome = registry
            .unlink_tenant(SourceId::from("srv-1"), TenantId(7))
            .await
            .unwrap();
        assert_eq!(outcome, UnlinkOutcome::Remaining(1));

        let outcome = registry
            .unlink_tenant(SourceId::from("srv-1"), TenantId(8))
            .await
            .unwrap();
        assert_eq!(outcome, UnlinkOutcome::SourceRemoved);

        assert!(registry.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlinked_tenant_no_longer_resolves() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7, 8]))
            .await
            .unwrap();

        registry
            .unlink_tenant(SourceId::from("srv-1"), TenantId(7))
            .await
            .unwrap();

        let tenants = registry
            .resolve_tenants(&SourceId::from("srv-1"))
            .await
            .unwrap();
        assert_eq!(tenants, vec![TenantId(8)]);
    }

    #[tokio::test]
    async fn test_removed_source_resolves_to_no_tenants() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();
        registry.remove(SourceId::from("srv-1")).await.unwrap();

        let tenants = registry
            .resolve_tenants(&SourceId::from("srv-1"))
            .await
            .unwrap();
        assert!(tenants.is_empty());
    }

    #[tokio::test]
    async fn test_set_state_cannot_resurrect_removed() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();
        registry.remove(SourceId::from("srv-1")).await.unwrap();

        registry
            .set_state(SourceId::from("srv-1"), SourceState::Live)
            .await
            .unwrap();

        assert!(registry.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_replaces_descriptor_not_state() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();
        registry
            .set_state(SourceId::from("srv-1"), SourceState::Backfilling)
            .await
            .unwrap();

        let mut updated = create_test_source("srv-1", &[7, 9]);
        updated.params.host = "game-02.example.com".to_string();
        registry.update(updated).await.unwrap();

        let active = registry.list_active().await.unwrap();
        assert_eq!(active[0].params.host, "game-02.example.com");
        assert_eq!(active[0].state, SourceState::Backfilling);
        assert_eq!(active[0].tenants.len(), 2);
    }

    #[tokio::test]
    async fn test_reap_removed_after_cutoff() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();
        registry.remove(SourceId::from("srv-1")).await.unwrap();

        // Nothing reaped with a cutoff in the past.
        let reaped = registry
            .reap_removed(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(reaped.is_empty());

        // Reaped with a cutoff in the future.
        let reaped = registry
            .reap_removed(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(reaped, vec![SourceId::from("srv-1")]);

        // Entry is gone entirely now.
        assert!(registry
            .stats(&SourceId::from("srv-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_includes_state_and_counters() {
        let registry = spawn_registry();
        registry
            .add(create_test_source("srv-1", &[7]))
            .await
            .unwrap();

        let stats = registry
            .stats(&SourceId::from("srv-1"))
            .await
            .unwrap()
            .unwrap();
        stats.add_lines_read(10);

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1.lines_read, 10);
        assert_eq!(snapshot[0].1.state, SourceState::Registered);
    }
}
