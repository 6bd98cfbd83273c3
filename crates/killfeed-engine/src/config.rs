// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Every knob has a deployment-scale default and a `KF_*` environment
//! override. `Config::new()` fails loudly on an unparsable override rather
//! than silently falling back; a typo in an interval should not change
//! polling behavior unnoticed.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::BackoffPolicy;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_POLL_JITTER: f64 = 0.2;
const DEFAULT_DEGRADED_INTERVAL_SECS: u64 = 300;
const DEFAULT_DEGRADED_THRESHOLD: u32 = 4;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_SESSIONS: usize = 64;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_READ_CHUNK_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 60;
const DEFAULT_DISPATCH_RETRY_COUNT: u32 = 3;
const DEFAULT_CURSOR_RETENTION_SECS: u64 = 24 * 60 * 60;

/// A `KF_*` environment override that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid value for {variable}: {value:?}")]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
}

/// Engine-wide configuration, shared as `Arc<Config>`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base interval between polls of a live source.
    pub poll_interval: Duration,
    /// Jitter applied to the poll interval, as a fraction (0.2 = ±20%),
    /// so sources sharing a host do not poll in synchronized bursts.
    pub poll_jitter: f64,
    /// Fixed reduced cadence for degraded sources.
    pub degraded_interval: Duration,
    /// Consecutive failures before a source is marked degraded.
    pub degraded_threshold: u32,
    /// How often the scheduler reconciles its loops with the registry.
    pub sync_interval: Duration,
    /// System-wide ceiling on concurrent remote sessions.
    pub max_sessions: usize,
    /// How long a poll cycle waits for a session slot before skipping.
    pub acquire_timeout: Duration,
    /// Timeout applied to each remote stat/read call.
    pub read_timeout: Duration,
    /// Largest single remote read.
    pub max_read_chunk: usize,
    /// Lines longer than this are counted malformed and skipped.
    pub max_line_bytes: usize,
    /// Per-source reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Delivery attempts per event and tenant before giving up.
    pub dispatch_retry_count: u32,
    /// Directory for persisted cursor records.
    pub cursor_dir: PathBuf,
    /// How long a removed source's cursor is retained before deletion.
    pub cursor_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_jitter: DEFAULT_POLL_JITTER,
            degraded_interval: Duration::from_secs(DEFAULT_DEGRADED_INTERVAL_SECS),
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_read_chunk: DEFAULT_MAX_READ_CHUNK_BYTES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            backoff: BackoffPolicy {
                initial_interval: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
                maximum_interval: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
                jitter: DEFAULT_POLL_JITTER,
            },
            dispatch_retry_count: DEFAULT_DISPATCH_RETRY_COUNT,
            cursor_dir: PathBuf::from("./cursors"),
            cursor_retention: Duration::from_secs(DEFAULT_CURSOR_RETENTION_SECS),
        }
    }
}

impl Config {
    /// Builds the configuration from defaults and `KF_*` overrides.
    pub fn new() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(secs) = env_parse::<u64>("KF_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(jitter) = env_parse::<f64>("KF_POLL_JITTER")? {
            config.poll_jitter = jitter.clamp(0.0, 1.0);
        }
        if let Some(secs) = env_parse::<u64>("KF_DEGRADED_INTERVAL_SECS")? {
            config.degraded_interval = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse::<u32>("KF_DEGRADED_THRESHOLD")? {
            config.degraded_threshold = threshold.max(1);
        }
        if let Some(secs) = env_parse::<u64>("KF_SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(sessions) = env_parse::<usize>("KF_MAX_SESSIONS")? {
            config.max_sessions = sessions.max(1);
        }
        if let Some(secs) = env_parse::<u64>("KF_ACQUIRE_TIMEOUT_SECS")? {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("KF_READ_TIMEOUT_SECS")? {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<usize>("KF_MAX_READ_CHUNK_BYTES")? {
            config.max_read_chunk = bytes.max(4096);
        }
        if let Some(bytes) = env_parse::<usize>("KF_MAX_LINE_BYTES")? {
            config.max_line_bytes = bytes.max(256);
        }
        if let Some(secs) = env_parse::<u64>("KF_BACKOFF_BASE_SECS")? {
            config.backoff.initial_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("KF_BACKOFF_CAP_SECS")? {
            config.backoff.maximum_interval = Duration::from_secs(secs);
        }
        if let Some(count) = env_parse::<u32>("KF_DISPATCH_RETRY_COUNT")? {
            config.dispatch_retry_count = count.max(1);
        }
        if let Ok(dir) = env::var("KF_CURSOR_DIR") {
            config.cursor_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("KF_CURSOR_RETENTION_SECS")? {
            config.cursor_retention = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(variable: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(variable) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError { variable, value }),
        Err(_) => Ok(None),
    }
}
