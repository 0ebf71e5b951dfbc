//! Ordered parallel runner.
//!
//! Runs a fixed list of `(function, arguments)` pairs on a private thread
//! pool and returns one outcome per pair, in input order.

use crate::config::{default_thread_cap, ThreadPoolConfig};
use crate::error::{catch_task, Error, Result};
use crate::future::{task_pair, TaskFuture};
use crate::pool::ThreadPool;
use log::debug;

/// Run every task concurrently and return outcomes in submission order.
///
/// `output[i]` is the outcome of `tasks[i]`; a task that panicked leaves
/// [`Error::TaskFailure`] at its own position without disturbing the
/// others. `max_threads` caps the pool size and defaults to one thread per
/// task, bounded by [`default_thread_cap`]. All threads are joined before
/// this returns.
pub fn run_threaded<F, A, R>(tasks: Vec<(F, A)>, max_threads: Option<usize>) -> Result<Vec<Result<R>>>
where
    F: FnOnce(A) -> R + Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let threads = match max_threads {
        Some(0) => {
            return Err(Error::InvalidConfig(
                "max_threads must be positive".to_string(),
            ))
        }
        Some(cap) => cap.min(tasks.len()),
        None => tasks.len().min(default_thread_cap()),
    };

    debug!("Running {} tasks on {} threads", tasks.len(), threads);

    let pool = ThreadPool::with_config(ThreadPoolConfig {
        max_threads: threads,
        queue_size: tasks.len(),
        ..Default::default()
    })?;

    let mut futures: Vec<TaskFuture<R>> = Vec::with_capacity(tasks.len());
    for (id, (func, args)) in tasks.into_iter().enumerate() {
        let (future, completer) = task_pair(id, None);
        pool.execute(move || completer.complete(catch_task(move || func(args))))?;
        futures.push(future);
    }

    pool.shutdown_and_join();

    Ok(futures.into_iter().map(TaskFuture::result).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    type BoxedTask = Box<dyn FnOnce((i64, i64)) -> i64 + Send>;

    fn increment(x: u8) -> u8 {
        x + 1
    }

    #[test]
    fn test_results_follow_input_order() {
        // Reverse sleeps so completion order is the opposite of input order
        let tasks: Vec<_> = (0..6u64)
            .map(|i| {
                (
                    |(i, delay): (u64, u64)| {
                        thread::sleep(Duration::from_millis(delay));
                        i * i
                    },
                    (i, (6 - i) * 10),
                )
            })
            .collect();

        let results = run_threaded(tasks, None).unwrap();
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 4, 9, 16, 25]);
    }

    #[test]
    fn test_heterogeneous_functions() {
        let tasks: Vec<(BoxedTask, (i64, i64))> = vec![
            (Box::new(|(a, b): (i64, i64)| a + b), (2, 3)),
            (Box::new(|(a, b): (i64, i64)| a * b), (2, 3)),
            (Box::new(|(a, b): (i64, i64)| a - b), (2, 3)),
        ];

        let values: Vec<i64> = run_threaded(tasks, Some(2))
            .unwrap()
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(values, vec![5, 6, -1]);
    }

    #[test]
    fn test_failure_stays_at_its_position() {
        let tasks: Vec<(BoxedTask, (i64, i64))> = vec![
            (Box::new(|(a, b): (i64, i64)| a / b), (10, 2)),
            (Box::new(|(a, b): (i64, i64)| a / b), (10, 0)),
            (Box::new(|(a, b): (i64, i64)| a / b), (9, 3)),
        ];

        let results = run_threaded(tasks, None).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 5);
        assert!(matches!(&results[1], Err(Error::TaskFailure(msg)) if msg.contains("divide by zero")));
        assert_eq!(*results[2].as_ref().unwrap(), 3);

        // Collecting surfaces the first failure in input order
        let collected: Result<Vec<i64>> = results.into_iter().collect();
        assert!(matches!(collected, Err(Error::TaskFailure(_))));
    }

    #[test]
    fn test_empty_and_zero_cap() {
        let empty: Vec<(fn(u8) -> u8, u8)> = Vec::new();
        assert!(run_threaded(empty, None).unwrap().is_empty());

        let tasks = vec![(increment, 1u8)];
        assert!(matches!(
            run_threaded(tasks, Some(0)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_more_threads_than_tasks() {
        let tasks = vec![(increment, 1u8), (increment, 2u8)];
        let values: Vec<u8> = run_threaded(tasks, Some(64))
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(values, vec![2, 3]);
    }
}
