// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared harness for integration tests: a registry, a scripted remote
//! host, an in-memory cursor store, and a collecting consumer wired
//! together the way the agent binary wires the real thing.

#![allow(dead_code)]

pub mod mocks;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use killfeed_engine::backoff::BackoffPolicy;
use killfeed_engine::config::Config;
use killfeed_engine::cursor::{CursorStore, MemoryCursorStore};
use killfeed_engine::error::EngineError;
use killfeed_engine::fanout::Dispatcher;
use killfeed_engine::normalize::Normalizer;
use killfeed_engine::poll::{run_poll_cycle, CycleOutcome, PollContext};
use killfeed_engine::pool::SessionPool;
use killfeed_engine::registry::{RegistryHandle, RegistryService};
use killfeed_engine::source::{ConnectionParams, LogSource, SourceId, TenantId};

use mocks::{CollectingConsumer, ScriptedFactory, ScriptedHost};

/// Fast-paced configuration for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.poll_interval = Duration::from_millis(20);
    config.poll_jitter = 0.0;
    config.degraded_interval = Duration::from_millis(40);
    config.sync_interval = Duration::from_millis(20);
    config.acquire_timeout = Duration::from_millis(100);
    config.read_timeout = Duration::from_secs(1);
    config.backoff = BackoffPolicy {
        initial_interval: Duration::from_millis(1),
        maximum_interval: Duration::from_millis(4),
        jitter: 0.0,
    };
    config.cursor_retention = Duration::from_secs(0);
    config
}

/// Everything an integration test needs, wired together.
pub struct TestHarness {
    pub config: Arc<Config>,
    pub registry: RegistryHandle,
    pub cursors: Arc<dyn CursorStore>,
    pub pool: SessionPool,
    pub dispatcher: Dispatcher,
    pub consumer: Arc<CollectingConsumer>,
    pub host: Arc<ScriptedHost>,
    pub normalizer: Arc<Normalizer>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(test_config()),
            ScriptedHost::new(),
            Arc::new(MemoryCursorStore::new()),
        )
    }

    /// Builds a harness over existing parts; reusing the host and cursor
    /// store across harnesses simulates a process restart.
    pub fn with_parts(
        config: Arc<Config>,
        host: Arc<ScriptedHost>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let pool = SessionPool::new(
            Arc::new(ScriptedFactory::new(Arc::clone(&host))),
            config.max_sessions,
            config.acquire_timeout,
            config.read_timeout,
        );
        let (service, registry) = RegistryService::new();
        tokio::spawn(service.run());

        let consumer = CollectingConsumer::new();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::clone(&consumer) as Arc<dyn killfeed_engine::fanout::EventConsumer>,
            config.backoff,
            config.dispatch_retry_count,
        );

        TestHarness {
            config,
            registry,
            cursors,
            pool,
            dispatcher,
            consumer,
            host,
            normalizer: Arc::new(Normalizer::new()),
        }
    }

    /// Registers a source against the scripted host.
    pub async fn add_source(&self, id: &str, path: &str, tenants: &[u64]) {
        self.registry
            .add(LogSource::new(
                SourceId::from(id),
                ConnectionParams {
                    host: "game-01.example.com".to_string(),
                    port: 22,
                    username: "logs".to_string(),
                    password: "pw".to_string(),
                    path: path.to_string(),
                },
                tenants.iter().copied().map(TenantId),
            ))
            .await
            .expect("add source");
    }

    /// Builds a poll context for one source.
    pub async fn context(&self, id: &str) -> PollContext {
        let stats = self
            .registry
            .stats(&SourceId::from(id))
            .await
            .expect("registry alive")
            .expect("source registered");
        PollContext {
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            cursors: Arc::clone(&self.cursors),
            pool: self.pool.clone(),
            dispatcher: self.dispatcher.clone(),
            normalizer: Arc::clone(&self.normalizer),
            stats,
            cancel: CancellationToken::new(),
        }
    }

    /// Runs one poll cycle for a source using its current descriptor.
    pub async fn poll(&self, id: &str) -> Result<CycleOutcome, EngineError> {
        let source = self
            .registry
            .get(&SourceId::from(id))
            .await
            .expect("registry alive")
            .expect("source registered");
        let ctx = self.context(id).await;
        run_poll_cycle(&ctx, &source).await
    }
}

/// One killfeed line with a distinct killer/victim pair.
pub fn kill_line(n: u64) -> String {
    format!(
        "2024.05.01-12.{:02}.{:02};Killer{n};k{n:08};Victim{n};v{n:08};AK-SU;{}\n",
        (n / 60) % 60,
        n % 60,
        50 + n % 200,
    )
}

/// A block of `count` killfeed lines starting at `start` (1-based).
pub fn kill_lines(start: u64, count: u64) -> String {
    (start..start + count).map(kill_line).collect()
}
