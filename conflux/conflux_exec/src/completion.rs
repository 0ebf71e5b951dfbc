//! Completion-order collection of task results.
//!
//! [`submit_all`] submits a batch of [`TaskSpec`]s to a call-scoped pool,
//! drains and joins the pool, then hands back an [`AsCompleted`] iterator
//! that yields each future in the order its task finished.

use crate::config::PoolConfig;
use crate::error::Result;
use crate::future::TaskFuture;
use crate::pool::WorkerPool;
use crossbeam_channel::{unbounded, Receiver};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default worker count of the submit shortcuts
pub const DEFAULT_SUBMIT_WORKERS: usize = 10;

/// Positional and keyword arguments for one call of a task function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec<A, K = ()> {
    /// Positional arguments
    pub args: A,

    /// Keyword arguments
    pub kwargs: K,
}

impl<A> TaskSpec<A> {
    /// A task with positional arguments only
    pub fn new(args: A) -> Self {
        Self { args, kwargs: () }
    }
}

impl<A, K> TaskSpec<A, K> {
    /// A task with positional and keyword arguments
    pub fn with_kwargs(args: A, kwargs: K) -> Self {
        Self { args, kwargs }
    }
}

/// Futures of a finished batch, in completion order
pub struct AsCompleted<R> {
    pending: HashMap<usize, TaskFuture<R>>,
    done: Receiver<usize>,
}

impl<R> AsCompleted<R> {
    /// Number of futures not yet yielded
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl<R> Iterator for AsCompleted<R> {
    type Item = TaskFuture<R>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.pending.is_empty() {
            let id = self.done.recv().ok()?;
            if let Some(future) = self.pending.remove(&id) {
                return Some(future);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.pending.len()))
    }
}

/// Run `func` over every task on a fresh pool and collect futures by completion.
///
/// The pool is shut down and joined before this returns, so every yielded
/// future is already resolved. A task that panicked only reports
/// [`Error::TaskFailure`](crate::Error::TaskFailure) when its future's
/// result is taken.
pub fn submit_all<A, K, R, F, T>(config: &PoolConfig, func: F, tasks: T) -> Result<AsCompleted<R>>
where
    A: Serialize + DeserializeOwned + Send + 'static,
    K: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(A, K) -> R + Send + Sync + 'static,
    T: IntoIterator<Item = TaskSpec<A, K>>,
{
    let pool = WorkerPool::new(config, move |spec: TaskSpec<A, K>| {
        func(spec.args, spec.kwargs)
    })?;
    collect_completed(pool, tasks)
}

fn collect_completed<A, K, R, T>(pool: WorkerPool<TaskSpec<A, K>, R>, tasks: T) -> Result<AsCompleted<R>>
where
    A: Send + 'static,
    K: Send + 'static,
    R: Send + 'static,
    T: IntoIterator<Item = TaskSpec<A, K>>,
{
    let (notify, done) = unbounded();

    let mut pending = HashMap::new();
    for spec in tasks {
        let future = pool.submit_notify(spec, notify.clone())?;
        pending.insert(future.id(), future);
    }

    debug!("Submitted {} tasks; waiting for the pool to drain", pending.len());
    pool.join();

    Ok(AsCompleted { pending, done })
}

/// [`submit_all`] on a thread pool with `max_workers` threads.
///
/// Arguments and results stay in shared memory, so they only need to be
/// `Send`.
pub fn multi_thread_submit<A, K, R, F, T>(
    func: F,
    tasks: T,
    max_workers: usize,
) -> Result<AsCompleted<R>>
where
    A: Send + 'static,
    K: Send + 'static,
    R: Send + 'static,
    F: Fn(A, K) -> R + Send + Sync + 'static,
    T: IntoIterator<Item = TaskSpec<A, K>>,
{
    let pool = WorkerPool::threads(&PoolConfig::threads(max_workers), move |spec: TaskSpec<A, K>| {
        func(spec.args, spec.kwargs)
    })?;
    collect_completed(pool, tasks)
}

/// [`submit_all`] on a process pool with `max_workers` processes
pub fn multi_process_submit<A, K, R, F, T>(
    func: F,
    tasks: T,
    max_workers: usize,
) -> Result<AsCompleted<R>>
where
    A: Serialize + DeserializeOwned + Send + 'static,
    K: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(A, K) -> R + Send + Sync + 'static,
    T: IntoIterator<Item = TaskSpec<A, K>>,
{
    submit_all(&PoolConfig::processes(max_workers), func, tasks)
}
