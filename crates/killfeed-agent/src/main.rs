// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Killfeed ingestion agent.
//!
//! Thin wiring around `killfeed-engine`: reads configuration from the
//! environment, loads the source manifest produced by the administration
//! surface, and runs the engine until SIGINT. Normalized events are
//! emitted to stdout as JSON lines, one per `(tenant, event)` delivery;
//! the surrounding system replaces [`StdoutConsumer`] with its own
//! consumer.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use killfeed_engine::config::Config;
use killfeed_engine::cursor::FileCursorStore;
use killfeed_engine::fanout::{DeliveryError, Dispatcher, EventConsumer};
use killfeed_engine::normalize::NormalizedEvent;
use killfeed_engine::poll::PollScheduler;
use killfeed_engine::pool::SessionPool;
use killfeed_engine::registry::RegistryService;
use killfeed_engine::source::{ConnectionParams, LogSource, SourceId, TenantId};
use killfeed_engine::transport::LocalSessionFactory;

const SNAPSHOT_LOG_INTERVAL_SECS: u64 = 60;

/// One source as declared in the manifest file.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    password: String,
    path: String,
    tenants: BTreeSet<u64>,
}

fn default_port() -> u16 {
    22
}

/// Emits each delivery as one JSON line on stdout.
struct StdoutConsumer;

#[async_trait]
impl EventConsumer for StdoutConsumer {
    async fn accept(
        &self,
        event: &NormalizedEvent,
        tenant: TenantId,
    ) -> Result<(), DeliveryError> {
        let line = serde_json::json!({ "tenant": tenant, "event": event });
        println!("{line}");
        Ok(())
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("KF_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    killfeed_engine::log_build_info();

    let config = match Config::new() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("Error creating config on agent startup: {err}");
            return;
        }
    };

    let sources = match load_manifest().await {
        Ok(sources) => sources,
        Err(err) => {
            error!("Error loading source manifest: {err:#}");
            return;
        }
    };

    let cursors = Arc::new(FileCursorStore::new(config.cursor_dir.clone()));
    let pool = SessionPool::new(
        Arc::new(LocalSessionFactory),
        config.max_sessions,
        config.acquire_timeout,
        config.read_timeout,
    );

    let (registry_service, registry) = RegistryService::new();
    tokio::spawn(registry_service.run());

    for source in sources {
        let id = source.id.clone();
        if let Err(err) = registry.add(source).await {
            warn!(source = %id, "skipping source from manifest: {err}");
        }
    }

    let dispatcher = Dispatcher::new(
        registry.clone(),
        Arc::new(StdoutConsumer),
        config.backoff,
        config.dispatch_retry_count,
    );

    let scheduler = PollScheduler::new(
        Arc::clone(&config),
        registry.clone(),
        cursors,
        pool,
        dispatcher,
    );
    let cancel = scheduler.cancel_token();
    let scheduler_task = tokio::spawn(scheduler.run());

    let mut snapshot_interval = interval(Duration::from_secs(SNAPSHOT_LOG_INTERVAL_SECS));
    snapshot_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = snapshot_interval.tick() => {
                if let Ok(snapshot) = registry.snapshot().await {
                    for (id, stats) in snapshot {
                        info!(
                            source = %id,
                            state = %stats.state,
                            lines = stats.lines_read,
                            events = stats.events_emitted,
                            malformed = stats.malformed_lines,
                            failures = stats.consecutive_failures,
                            "source status"
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = scheduler_task.await;
    registry.shutdown();
}

/// Loads the source manifest named by `KF_SOURCES_FILE`.
async fn load_manifest() -> anyhow::Result<Vec<LogSource>> {
    let path =
        env::var("KF_SOURCES_FILE").context("KF_SOURCES_FILE environment variable is not set")?;
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading source manifest {path}"))?;
    let entries: Vec<ManifestEntry> =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing source manifest {path}"))?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            LogSource::new(
                SourceId::new(entry.id),
                ConnectionParams {
                    host: entry.host,
                    port: entry.port,
                    username: entry.username,
                    password: entry.password,
                    path: entry.path,
                },
                entry.tenants.into_iter().map(TenantId),
            )
        })
        .collect())
}
