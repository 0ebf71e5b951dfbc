#![deny(warnings)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Conflux Exec
//!
//! Concurrent task execution for the Conflux toolkit.
//!
//! This crate provides:
//!
//! - Thread and process worker pools behind one submission interface
//! - Batch submission with results yielded in completion order
//! - An ordered parallel runner for heterogeneous task lists
//! - A pool-based map with pre-bound keyword arguments
//! - Subprocess execution with timeouts and environment merging
//! - An asynchronous timed counter
//!
//! Every batch operation builds a private pool for the duration of the
//! call and drains it before returning. Failures inside a task are
//! captured on that task's [`TaskFuture`] and surface only when its outcome
//! is taken.

/// Completion-order collection of batch results
pub mod completion;

/// Pool configuration
pub mod config;

/// Asynchronous arithmetic counter
pub mod counter;

/// Error types
pub mod error;

/// Handles on submitted tasks
pub mod future;

/// Pool-based map with keyword binding
pub mod map;

/// Ordered parallel runner
pub mod ordered;

/// Thread and process worker pools
pub mod pool;

/// Accumulating stopwatch
pub mod stopwatch;

/// External command execution
pub mod subprocess;

pub use completion::{multi_process_submit, multi_thread_submit, submit_all, AsCompleted, TaskSpec};
pub use config::{PoolBackend, PoolConfig, ThreadPoolConfig};
pub use counter::{acount, Counter, Step};
pub use error::{Error, Result};
pub use future::TaskFuture;
pub use map::{map, map_async, map_threads, run_in_pool, BoundTask, MapHandle, MapOptions, MapOutput, Target};
pub use ordered::run_threaded;
pub use pool::{ThreadPool, WorkerPool};
pub use stopwatch::Stopwatch;
pub use subprocess::{run, run_blocking, Capture, CommandLine, ProcessResult, RunOptions};
