//! Pool configuration.
//!
//! Configuration values are plain data with sensible defaults. They derive
//! serde traits so that applications can embed them in their own settings
//! files; [`PoolConfig::from_toml_str`] covers the common case.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default prefix for worker thread names
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "conflux-worker";

/// Which kind of worker backs a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolBackend {
    /// OS threads sharing the caller's memory
    #[default]
    Thread,

    /// Forked OS processes; inputs and outputs are serialized
    Process,
}

/// Backend kind and size of a call-scoped pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Kind of worker to run tasks on
    pub backend: PoolBackend,

    /// Number of workers; must be positive
    pub workers: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: PoolBackend::Thread,
            workers: num_cpus::get(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl PoolConfig {
    /// A thread-backed configuration with `workers` workers
    pub fn threads(workers: usize) -> Self {
        Self {
            backend: PoolBackend::Thread,
            workers,
            ..Default::default()
        }
    }

    /// A process-backed configuration with `workers` workers
    pub fn processes(workers: usize) -> Self {
        Self {
            backend: PoolBackend::Process,
            workers,
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML, filling missing keys with defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no pool can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig(
                "worker count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn thread_pool_config(&self) -> ThreadPoolConfig {
        ThreadPoolConfig {
            max_threads: self.workers,
            thread_name_prefix: self.thread_name_prefix.clone(),
            ..Default::default()
        }
    }
}

/// Configuration for the thread pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// Maximum number of queued tasks before submission blocks
    pub queue_size: usize,

    /// Number of worker threads
    pub max_threads: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,

    /// Whether to collect performance statistics
    pub collect_stats: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            max_threads: num_cpus::get(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            collect_stats: true,
        }
    }
}

/// Default upper bound on threads started by the ordered runner.
pub fn default_thread_cap() -> usize {
    num_cpus::get().max(1) * 4
}
