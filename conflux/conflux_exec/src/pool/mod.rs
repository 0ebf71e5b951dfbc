//! Worker pools behind one submission interface.
//!
//! - [`ThreadPool`]: named OS threads sharing the caller's memory
//! - [`ProcessPool`]: forked OS processes exchanging serialized values
//! - [`WorkerPool`]: a call-scoped pool of either kind, chosen by
//!   [`PoolBackend`], that hands out a [`TaskFuture`] per submission

#[cfg(unix)]
pub mod process;
pub mod thread;

#[cfg(unix)]
pub use process::ProcessPool;
pub use thread::{ThreadPool, ThreadPoolStats};

use crate::config::{PoolBackend, PoolConfig};
use crate::error::{catch_task, Error, Result};
use crate::future::{task_pair, TaskFuture};
use crossbeam_channel::Sender;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type SharedFn<I, R> = Arc<dyn Fn(I) -> R + Send + Sync + 'static>;

enum Backend<I, R> {
    Thread {
        pool: ThreadPool,
        func: SharedFn<I, R>,
    },
    #[cfg(unix)]
    Process {
        pool: ProcessPool<I, R>,
        encode: fn(&I) -> Result<Vec<u8>>,
    },
}

#[cfg(unix)]
fn encode_json<I: Serialize>(input: &I) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(input)?)
}

/// A pool that applies one function to every submitted input.
///
/// Each submission yields exactly one [`TaskFuture`]. Once
/// [`shutdown`](Self::shutdown) has been called every further submission
/// fails with [`Error::PoolState`]; [`join`](Self::join) consumes the pool,
/// so it can never be used again after draining.
///
/// Only the process backend moves values across a process boundary, so
/// only [`new`](Self::new) asks for serde bounds. [`threads`](Self::threads)
/// accepts any `Send` input and output, including shared handles.
pub struct WorkerPool<I, R> {
    backend: Backend<I, R>,
    next_id: AtomicUsize,
}

impl<I, R> WorkerPool<I, R>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    /// Build a pool of the configured kind and size running `func`.
    pub fn new<F>(config: &PoolConfig, func: F) -> Result<Self>
    where
        F: Fn(I) -> R + Send + Sync + 'static,
    {
        match config.backend {
            PoolBackend::Thread => Self::threads(config, func),
            #[cfg(unix)]
            PoolBackend::Process => {
                config.validate()?;
                debug!("Building process pool with {} workers", config.workers);
                let pool = ProcessPool::spawn(config.workers, &config.thread_name_prefix, &func)?;
                Ok(Self::with_backend(Backend::Process {
                    pool,
                    encode: encode_json::<I>,
                }))
            }
            #[cfg(not(unix))]
            PoolBackend::Process => Err(Error::Unsupported(
                "process pools require a Unix host".to_string(),
            )),
        }
    }
}

impl<I, R> WorkerPool<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    /// Build a thread pool of the configured size running `func`.
    ///
    /// Fails with [`Error::InvalidConfig`] if `config` asks for processes.
    pub fn threads<F>(config: &PoolConfig, func: F) -> Result<Self>
    where
        F: Fn(I) -> R + Send + Sync + 'static,
    {
        config.validate()?;
        if config.backend != PoolBackend::Thread {
            return Err(Error::InvalidConfig(
                "a thread-only pool cannot use the process backend".to_string(),
            ));
        }

        debug!("Building thread pool with {} workers", config.workers);
        Ok(Self::with_backend(Backend::Thread {
            pool: ThreadPool::with_config(config.thread_pool_config())?,
            func: Arc::new(func),
        }))
    }

    fn with_backend(backend: Backend<I, R>) -> Self {
        Self {
            backend,
            next_id: AtomicUsize::new(0),
        }
    }

    /// Submit one input; its outcome is retrieved through the future.
    pub fn submit(&self, input: I) -> Result<TaskFuture<R>> {
        self.submit_inner(input, None)
    }

    /// Submit one input and announce its id on `notify` when it completes.
    pub(crate) fn submit_notify(&self, input: I, notify: Sender<usize>) -> Result<TaskFuture<R>> {
        self.submit_inner(input, Some(notify))
    }

    fn submit_inner(&self, input: I, notify: Option<Sender<usize>>) -> Result<TaskFuture<R>> {
        if self.is_shutting_down() {
            return Err(Error::PoolState("pool is shut down".to_string()));
        }

        match &self.backend {
            Backend::Thread { pool, func } => {
                let (future, completer) = task_pair(self.next_id(), notify);
                let func = Arc::clone(func);
                pool.execute(move || completer.complete(catch_task(|| func(input))))?;
                Ok(future)
            }
            #[cfg(unix)]
            Backend::Process { pool, encode } => {
                let payload = encode(&input)?;
                let id = self.next_id();
                let (future, completer) = task_pair(id, notify);
                pool.submit_encoded(id, payload, completer)?;
                Ok(future)
            }
        }
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of submissions accepted so far
    pub fn submitted(&self) -> usize {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Which backend this pool runs on
    pub fn backend(&self) -> PoolBackend {
        match &self.backend {
            Backend::Thread { .. } => PoolBackend::Thread,
            #[cfg(unix)]
            Backend::Process { .. } => PoolBackend::Process,
        }
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        match &self.backend {
            Backend::Thread { pool, .. } => pool.worker_count(),
            #[cfg(unix)]
            Backend::Process { pool, .. } => pool.worker_count(),
        }
    }

    /// Stop accepting submissions. Work already submitted still runs.
    pub fn shutdown(&self) {
        match &self.backend {
            Backend::Thread { pool, .. } => pool.shutdown(),
            #[cfg(unix)]
            Backend::Process { pool, .. } => pool.shutdown(),
        }
    }

    /// Whether the pool has stopped accepting submissions
    pub fn is_shutting_down(&self) -> bool {
        match &self.backend {
            Backend::Thread { pool, .. } => pool.is_shutting_down(),
            #[cfg(unix)]
            Backend::Process { pool, .. } => pool.is_shutting_down(),
        }
    }

    /// Shut down and block until every submitted task has finished.
    pub fn join(self) {
        match self.backend {
            Backend::Thread { pool, .. } => pool.shutdown_and_join(),
            #[cfg(unix)]
            Backend::Process { pool, .. } => pool.shutdown_and_join(),
        }
    }
}
