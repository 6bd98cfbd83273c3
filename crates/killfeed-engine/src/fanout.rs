// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tenant event delivery.
//!
//! The dispatcher resolves a source's tenant set at dispatch time, not at
//! parse time, and hands each event to the downstream consumer once per
//! linked tenant. The source is read exactly once per poll cycle no matter
//! how many tenants share it; only delivery fans out.
//!
//! Delivery is at-least-once: retryable consumer errors are retried with
//! backoff up to a bounded attempt count, and the event's deduplication
//! key lets idempotent consumers discard what they have already seen. A
//! source with zero currently linked tenants drops the event silently;
//! that is a normal outcome during unlink races, not a failure.
//!
//! Events for one source are dispatched in strictly increasing
//! line-position order. Within a single event, tenant deliveries run
//! concurrently; cross-tenant ordering carries no guarantee.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::normalize::NormalizedEvent;
use crate::registry::RegistryHandle;
use crate::source::{SourceId, TenantId};
use crate::stats::SourceStats;

/// Failure returned by a consumer for one delivery.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeliveryError {
    retryable: bool,
    message: String,
}

impl DeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        DeliveryError {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DeliveryError {
            retryable: false,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Downstream consumer contract.
///
/// Implementations must be idempotent per `(dedup_key, tenant)`: after a
/// retried delivery the same event may arrive twice.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn accept(&self, event: &NormalizedEvent, tenant: TenantId)
        -> Result<(), DeliveryError>;
}

/// Fans normalized events out to every tenant linked to their source.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RegistryHandle,
    consumer: Arc<dyn EventConsumer>,
    retry: BackoffPolicy,
    max_attempts: u32,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: RegistryHandle,
        consumer: Arc<dyn EventConsumer>,
        retry: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Dispatcher {
            registry,
            consumer,
            retry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Dispatches a batch of events in order.
    ///
    /// The caller has already released its session slot and committed the
    /// cursor; nothing here can stall the connection pool or un-advance
    /// the cursor.
    pub async fn dispatch(&self, source: &SourceId, events: &[NormalizedEvent], stats: &SourceStats) {
        for event in events {
            let tenants = match self.registry.resolve_tenants(source).await {
                Ok(tenants) => tenants,
                Err(_) => {
                    // Registry gone: shutdown in progress, drop the rest.
                    return;
                }
            };
            if tenants.is_empty() {
                debug!(source = %source, "no linked tenants, dropping event");
                continue;
            }

            let deliveries = tenants.iter().map(|tenant| {
                let tenant = *tenant;
                async move { (tenant, self.deliver(event, tenant).await) }
            });
            for (tenant, result) in join_all(deliveries).await {
                if let Err(err) = result {
                    stats.incr_delivery_failures();
                    warn!(
                        source = %source,
                        %tenant,
                        dedup_key = %event.dedup_key,
                        "delivery failed after retries: {err}"
                    );
                }
            }
        }
    }

    /// Delivers one event to one tenant, retrying retryable errors.
    async fn deliver(&self, event: &NormalizedEvent, tenant: TenantId) -> Result<(), DeliveryError> {
        let mut attempt = 1;
        loop {
            match self.consumer.accept(event, tenant).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    debug!(
                        %tenant,
                        dedup_key = %event.dedup_key,
                        attempt,
                        "retryable delivery error: {err}"
                    );
                    tokio::time::sleep(self.retry.interval(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
