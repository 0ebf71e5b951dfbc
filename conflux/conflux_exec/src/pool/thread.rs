//! Thread pool implementation for parallel execution.
//!
//! Workers pull jobs from a shared bounded channel. Shutting the pool down
//! closes the channel: jobs already queued still run, and each worker exits
//! once the queue is drained.

use crate::config::ThreadPoolConfig;
use crate::error::{panic_message, Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Statistics about the thread pool
#[derive(Debug, Default, Clone)]
pub struct ThreadPoolStats {
    /// Number of jobs queued
    pub tasks_queued: usize,

    /// Number of jobs completed
    pub tasks_completed: usize,

    /// Number of jobs that panicked
    pub tasks_panicked: usize,

    /// Total job execution time (microseconds)
    pub total_execution_time_us: u64,

    /// Maximum job execution time (microseconds)
    pub max_execution_time_us: u64,
}

#[derive(Default)]
struct StatsCounters {
    tasks_queued: AtomicUsize,
    tasks_completed: AtomicUsize,
    tasks_panicked: AtomicUsize,
    total_execution_time_us: AtomicUsize,
    max_execution_time_us: AtomicUsize,
}

impl StatsCounters {
    fn record_execution(&self, exec_time_us: usize) {
        self.total_execution_time_us
            .fetch_add(exec_time_us, Ordering::Relaxed);

        // Update max execution time using compare-and-swap
        let mut current_max = self.max_execution_time_us.load(Ordering::Relaxed);
        while exec_time_us > current_max {
            match self.max_execution_time_us.compare_exchange(
                current_max,
                exec_time_us,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_max = actual,
            }
        }
    }
}

/// A queued closure
struct Job {
    func: Box<dyn FnOnce() + Send + 'static>,
    enqueued_at: Instant,
}

/// A fixed-size pool of named worker threads
pub struct ThreadPool {
    /// Sending half of the job queue; `None` once shut down
    task_sender: Mutex<Option<Sender<Job>>>,

    /// Worker threads
    workers: Vec<JoinHandle<()>>,

    is_shutting_down: AtomicBool,

    stats: Arc<StatsCounters>,

    config: ThreadPoolConfig,
}

impl ThreadPool {
    /// Create a new thread pool with `threads` workers and default settings
    pub fn new(threads: usize) -> Result<Self> {
        let config = ThreadPoolConfig {
            max_threads: threads,
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Create a new thread pool with the specified configuration
    pub fn with_config(config: ThreadPoolConfig) -> Result<Self> {
        if config.max_threads == 0 {
            return Err(Error::InvalidConfig(
                "thread pool needs at least one worker".to_string(),
            ));
        }

        let (task_sender, task_receiver) = bounded(config.queue_size.max(1));
        let stats = Arc::new(StatsCounters::default());

        info!(
            "Creating thread pool with {} workers and queue size {}",
            config.max_threads, config.queue_size
        );

        let mut workers = Vec::with_capacity(config.max_threads);

        for id in 0..config.max_threads {
            let receiver = task_receiver.clone();
            let stats = Arc::clone(&stats);
            let collect_stats = config.collect_stats;

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || Self::worker_loop(id, receiver, stats, collect_stats));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", id, e);
                    // Close the queue so the workers already running exit
                    drop(task_sender);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(Self {
            task_sender: Mutex::new(Some(task_sender)),
            workers,
            is_shutting_down: AtomicBool::new(false),
            stats,
            config,
        })
    }

    /// Worker thread main loop; returns once the queue is closed and empty
    fn worker_loop(
        id: usize,
        receiver: Receiver<Job>,
        stats: Arc<StatsCounters>,
        collect_stats: bool,
    ) {
        debug!("Worker {}: Starting", id);

        for job in receiver.iter() {
            trace!(
                "Worker {}: Executing job (queue time: {:.2}ms)",
                id,
                job.enqueued_at.elapsed().as_micros() as f64 / 1000.0
            );

            let exec_start = Instant::now();
            let func = job.func;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(func));
            let exec_time = exec_start.elapsed();

            if collect_stats {
                stats.record_execution(exec_time.as_micros() as usize);
            }

            match result {
                Ok(()) => {
                    trace!(
                        "Worker {}: Job completed in {:.2}ms",
                        id,
                        exec_time.as_micros() as f64 / 1000.0
                    );
                    if collect_stats {
                        stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    error!("Worker {}: Job panicked: {}", id, panic_message(e.as_ref()));
                    if collect_stats {
                        stats.tasks_panicked.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        debug!("Worker {}: Shutting down", id);
    }

    /// Queue a closure, blocking while the queue is full.
    ///
    /// Fails with [`Error::PoolState`] once the pool has been shut down.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.task_sender.lock().clone();
        let Some(sender) = sender else {
            return Err(Error::PoolState(
                "thread pool is shut down".to_string(),
            ));
        };

        let job = Job {
            func: Box::new(f),
            enqueued_at: Instant::now(),
        };

        sender
            .send(job)
            .map_err(|_| Error::PoolState("thread pool is shut down".to_string()))?;

        if self.config.collect_stats {
            self.stats.tasks_queued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Get current statistics for the thread pool
    pub fn get_stats(&self) -> ThreadPoolStats {
        if !self.config.collect_stats {
            return ThreadPoolStats::default();
        }

        ThreadPoolStats {
            tasks_queued: self.stats.tasks_queued.load(Ordering::Relaxed),
            tasks_completed: self.stats.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: self.stats.tasks_panicked.load(Ordering::Relaxed),
            total_execution_time_us: self.stats.total_execution_time_us.load(Ordering::Relaxed)
                as u64,
            max_execution_time_us: self.stats.max_execution_time_us.load(Ordering::Relaxed)
                as u64,
        }
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        if self.task_sender.lock().take().is_some() {
            info!("Shutting down thread pool");
        }
        self.is_shutting_down.store(true, Ordering::Relaxed);
    }

    /// Shut down the thread pool and wait for every queued job to finish
    pub fn shutdown_and_join(mut self) {
        self.join_workers();
    }

    fn join_workers(&mut self) {
        self.shutdown();

        if self.workers.is_empty() {
            return;
        }

        for worker in self.workers.drain(..) {
            worker.join().unwrap_or_else(|e| {
                error!("Worker thread panicked during shutdown: {:?}", e);
            });
        }

        info!("Thread pool shutdown complete");
    }

    /// Get the number of worker threads
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Check if the thread pool is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn wait_for_finished(pool: &ThreadPool, expected: usize) {
        loop {
            let stats = pool.get_stats();
            if stats.tasks_completed + stats.tasks_panicked >= expected {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_thread_pool_basic() {
        let pool = ThreadPool::new(4).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        pool.execute(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown_and_join();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(move || {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown_and_join();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_thread_pool_panic_handling() {
        let pool = ThreadPool::new(1).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        pool.execute(|| {
            panic!("This task should panic");
        })
        .unwrap();

        // The same worker must survive the panic
        pool.execute(move || {
            flag_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

        wait_for_finished(&pool, 2);

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(pool.get_stats().tasks_panicked, 1);
    }

    #[test]
    fn test_execute_after_shutdown_fails() {
        let pool = ThreadPool::new(2).unwrap();
        pool.shutdown();

        let result = pool.execute(|| {});
        assert!(matches!(result, Err(Error::PoolState(_))));
        assert!(pool.is_shutting_down());
    }

    #[test]
    fn test_thread_pool_stats() {
        let pool = ThreadPool::new(1).unwrap();

        for _ in 0..5 {
            pool.execute(|| {
                thread::sleep(Duration::from_millis(10));
            })
            .unwrap();
        }

        pool.execute(|| {
            panic!("This task should panic");
        })
        .unwrap();

        wait_for_finished(&pool, 6);

        let stats = pool.get_stats();
        assert_eq!(stats.tasks_queued, 6);
        assert_eq!(stats.tasks_completed, 5);
        assert_eq!(stats.tasks_panicked, 1);
        assert!(stats.total_execution_time_us > 0);
        assert!(stats.max_execution_time_us > 0);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            ThreadPool::new(0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_worker_names_use_prefix() {
        let config = ThreadPoolConfig {
            max_threads: 1,
            thread_name_prefix: "named".to_string(),
            ..Default::default()
        };
        let pool = ThreadPool::with_config(config).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);

        pool.execute(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-0"));
        assert_eq!(pool.worker_count(), 1);
    }
}
