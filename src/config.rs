//! Construction parameters for the pool, window and fleet backends.
//!
//! Every struct deserializes with defaults for missing fields, so a backend
//! can be configured from a partial JSON document, and every struct has a
//! `validate` that rejects nonsensical values instead of clamping them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SamplerError;

/// Worker pool sizing shared by the local multi-worker backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads in the pool.
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
}

/// One worker per available CPU.
pub fn default_n_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(n_workers: usize) -> Self {
        Self { n_workers }
    }

    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.n_workers == 0 {
            return Err(SamplerError::config("n_workers must be at least 1"));
        }
        Ok(())
    }
}

/// Sliding-window dispatch parameters for the future and cluster backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Maximum number of submitted units in flight at any time.
    #[serde(default = "default_client_max_jobs")]
    pub client_max_jobs: usize,
    /// Number of work items bundled into one submitted unit.
    #[serde(default = "default_batchsize")]
    pub batchsize: usize,
    /// Resubmissions allowed for a unit lost to a transient transport failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_client_max_jobs() -> usize {
    200
}

fn default_batchsize() -> usize {
    1
}

fn default_max_retries() -> usize {
    3
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            client_max_jobs: default_client_max_jobs(),
            batchsize: default_batchsize(),
            max_retries: default_max_retries(),
        }
    }
}

impl WindowConfig {
    pub fn new(client_max_jobs: usize, batchsize: usize) -> Self {
        Self {
            client_max_jobs,
            batchsize,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.client_max_jobs == 0 {
            return Err(SamplerError::config("client_max_jobs must be at least 1"));
        }
        if self.batchsize == 0 {
            return Err(SamplerError::config("batchsize must be at least 1"));
        }
        Ok(())
    }
}

/// Connection, lease and worker settings for the Redis fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Broker host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker port. `0` lets a self-managed broker pick any free port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Key namespace shared by the coordinator and its workers.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Lease on every generation key, so a crashed coordinator leaks nothing for long.
    #[serde(default = "default_key_ttl_secs")]
    pub key_ttl_secs: u64,
    /// How long a claimed work item may stay unreported before its slot in the
    /// speculation budget is handed back to the fleet.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// A generation in which no work item is claimed or reported for this long
    /// fails with a transport error instead of waiting for its keys to expire.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Interval for bounded polling (idle workers, result waits, drain checks).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Attempts for idempotent broker commands hit by transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Connection attempts while waiting for a freshly started broker.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,
    /// Upper bound on waiting for in-flight stragglers after a generation completes.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// In-process workers started alongside a self-managed broker.
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    /// Broker executable used by the server starter.
    #[serde(default = "default_redis_server")]
    pub redis_server: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_prefix() -> String {
    "abc".to_string()
}

fn default_key_ttl_secs() -> u64 {
    3600
}

fn default_lease_secs() -> u64 {
    60
}

fn default_stall_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_connect_attempts() -> usize {
    100
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_redis_server() -> String {
    "redis-server".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            prefix: default_prefix(),
            key_ttl_secs: default_key_ttl_secs(),
            lease_secs: default_lease_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            connect_attempts: default_connect_attempts(),
            drain_timeout_ms: default_drain_timeout_ms(),
            n_workers: default_n_workers(),
            redis_server: default_redis_server(),
        }
    }
}

impl RedisConfig {
    /// Defaults for a self-managed broker: any free port, local workers.
    pub fn self_managed() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    /// `redis://host:port/` connection URL.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn lease_ms(&self) -> u64 {
        self.lease_secs.saturating_mul(1000)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.host.is_empty() {
            return Err(SamplerError::config("redis host must not be empty"));
        }
        if self.prefix.is_empty() || self.prefix.contains(char::is_whitespace) {
            return Err(SamplerError::config(
                "redis prefix must be non-empty and contain no whitespace",
            ));
        }
        if self.key_ttl_secs == 0 {
            return Err(SamplerError::config("key_ttl_secs must be at least 1"));
        }
        if self.lease_secs == 0 {
            return Err(SamplerError::config("lease_secs must be at least 1"));
        }
        if self.stall_timeout_secs <= self.lease_secs {
            return Err(SamplerError::config(
                "stall_timeout_secs must exceed lease_secs, or a lost claim reads as a stall",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SamplerError::config("poll_interval_ms must be at least 1"));
        }
        if self.connect_attempts == 0 {
            return Err(SamplerError::config("connect_attempts must be at least 1"));
        }
        Ok(())
    }
}
