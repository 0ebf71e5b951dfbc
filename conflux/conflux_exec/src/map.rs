//! Pool-based map executor.
//!
//! Maps a [`Target`] over an iterable on a call-scoped thread or process
//! pool. Fixed keyword arguments are bound ahead of time with
//! [`BoundTask`], so the pool only ever sees a one-argument callable.
//!
//! Both modes drain and join the pool before returning. In asynchronous
//! mode the caller gets a [`MapHandle`] instead of blocking on the results.

use crate::config::PoolConfig;
use crate::error::Result;
use crate::future::TaskFuture;
use crate::pool::WorkerPool;
use crate::stopwatch::Stopwatch;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Worker count used by [`MapOptions::default`]
pub const DEFAULT_MAP_WORKERS: usize = 4;

/// A callable that can be mapped over inputs of type `I`.
pub trait Target<I>: Send + Sync + 'static {
    /// Value produced per input
    type Output;

    /// Apply the target to one input
    fn call(&self, input: I) -> Self::Output;
}

impl<I, R, F> Target<I> for F
where
    F: Fn(I) -> R + Send + Sync + 'static,
{
    type Output = R;

    fn call(&self, input: I) -> R {
        self(input)
    }
}

/// A function with its keyword arguments fixed in advance.
///
/// Calling the bound task with `input` runs `func(input, &kwargs)`.
#[derive(Debug, Clone)]
pub struct BoundTask<F, K> {
    func: F,
    kwargs: K,
}

impl<F, K> BoundTask<F, K> {
    /// Bind `kwargs` to `func`
    pub fn new(func: F, kwargs: K) -> Self {
        Self { func, kwargs }
    }

    /// The bound keyword arguments
    pub fn kwargs(&self) -> &K {
        &self.kwargs
    }
}

impl<I, R, F, K> Target<I> for BoundTask<F, K>
where
    F: Fn(I, &K) -> R + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    type Output = R;

    fn call(&self, input: I) -> R {
        (self.func)(input, &self.kwargs)
    }
}

/// How a map should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    /// Backend kind and worker count
    pub pool: PoolConfig,

    /// Return a [`MapHandle`] instead of the finished results
    pub asynchronous: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::threads(DEFAULT_MAP_WORKERS),
            asynchronous: false,
        }
    }
}

/// Results of a map, in input order
pub struct MapHandle<R> {
    futures: Vec<TaskFuture<R>>,
}

impl<R> MapHandle<R> {
    /// Number of inputs that were mapped
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// Whether the map had no inputs
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// Whether every item has finished
    pub fn ready(&self) -> bool {
        self.futures.iter().all(TaskFuture::is_done)
    }

    /// Block until every item has finished
    pub fn wait(&self) {
        for future in &self.futures {
            future.wait();
        }
    }

    /// Block until every item has finished or `timeout` elapses.
    ///
    /// Returns `true` if every item finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.futures.iter().all(|future| {
            let left = deadline.saturating_duration_since(Instant::now());
            future.wait_timeout(left)
        })
    }

    /// Take the results in input order.
    ///
    /// The first failed item, in input order, is returned as the error.
    pub fn get(self) -> Result<Vec<R>> {
        self.futures.into_iter().map(TaskFuture::result).collect()
    }

    /// Take every item's outcome in input order
    pub fn outcomes(self) -> Vec<Result<R>> {
        self.futures.into_iter().map(TaskFuture::result).collect()
    }
}

/// What [`run_in_pool`] hands back
pub enum MapOutput<R> {
    /// Synchronous mode: the finished results
    Ready(Vec<R>),

    /// Asynchronous mode: a handle on the results
    Pending(MapHandle<R>),
}

impl<R> MapOutput<R> {
    /// The results in input order, whichever mode produced them
    pub fn into_results(self) -> Result<Vec<R>> {
        match self {
            Self::Ready(values) => Ok(values),
            Self::Pending(handle) => handle.get(),
        }
    }
}

/// Map `target` over `inputs` in the mode selected by `options`.
pub fn run_in_pool<T, I, It>(target: T, inputs: It, options: &MapOptions) -> Result<MapOutput<T::Output>>
where
    T: Target<I>,
    I: Serialize + DeserializeOwned + Send + 'static,
    T::Output: Serialize + DeserializeOwned + Send + 'static,
    It: IntoIterator<Item = I>,
{
    let handle = map_async(target, inputs, &options.pool)?;
    if options.asynchronous {
        Ok(MapOutput::Pending(handle))
    } else {
        handle.get().map(MapOutput::Ready)
    }
}

/// Map and block for the ordered results.
pub fn map<T, I, It>(target: T, inputs: It, config: &PoolConfig) -> Result<Vec<T::Output>>
where
    T: Target<I>,
    I: Serialize + DeserializeOwned + Send + 'static,
    T::Output: Serialize + DeserializeOwned + Send + 'static,
    It: IntoIterator<Item = I>,
{
    map_async(target, inputs, config)?.get()
}

/// Dispatch every input, drain the pool and return a handle on the results.
pub fn map_async<T, I, It>(target: T, inputs: It, config: &PoolConfig) -> Result<MapHandle<T::Output>>
where
    T: Target<I>,
    I: Serialize + DeserializeOwned + Send + 'static,
    T::Output: Serialize + DeserializeOwned + Send + 'static,
    It: IntoIterator<Item = I>,
{
    let watch = Stopwatch::started();
    let pool = WorkerPool::new(config, move |input: I| target.call(input))?;
    drain(pool, inputs, watch)
}

/// Map on a thread pool and block for the ordered results.
///
/// Inputs and outputs never leave the process, so they only need to be
/// `Send`; shared handles such as `Arc<Mutex<_>>` can be mapped directly.
pub fn map_threads<T, I, It>(target: T, inputs: It, workers: usize) -> Result<Vec<T::Output>>
where
    T: Target<I>,
    I: Send + 'static,
    T::Output: Send + 'static,
    It: IntoIterator<Item = I>,
{
    let watch = Stopwatch::started();
    let pool = WorkerPool::threads(&PoolConfig::threads(workers), move |input: I| {
        target.call(input)
    })?;
    drain(pool, inputs, watch)?.get()
}

fn drain<I, R, It>(pool: WorkerPool<I, R>, inputs: It, mut watch: Stopwatch) -> Result<MapHandle<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    It: IntoIterator<Item = I>,
{
    let backend = pool.backend();
    let futures = inputs
        .into_iter()
        .map(|input| pool.submit(input))
        .collect::<Result<Vec<_>>>()?;

    pool.join();
    let elapsed = watch.stop()?;

    debug!(
        "Mapped {} items on {:?} pool in {:.2}ms",
        futures.len(),
        backend,
        elapsed.as_micros() as f64 / 1000.0
    );

    Ok(MapHandle { futures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn square(x: i64) -> i64 {
        x * x
    }

    #[test]
    fn test_sync_map_threaded() {
        let output = run_in_pool(square, vec![1, 2, 3, 4, 5], &MapOptions::default()).unwrap();
        match output {
            MapOutput::Ready(values) => assert_eq!(values, vec![1, 4, 9, 16, 25]),
            MapOutput::Pending(_) => panic!("expected finished results"),
        }
    }

    #[test]
    fn test_async_map_returns_ready_handle() {
        let options = MapOptions {
            asynchronous: true,
            ..Default::default()
        };

        let output = run_in_pool(square, 1..=5, &options).unwrap();
        let MapOutput::Pending(handle) = output else {
            panic!("expected a handle");
        };

        // The pool has already drained by the time the handle is returned
        assert!(handle.ready());
        assert_eq!(handle.len(), 5);
        assert!(handle.wait_timeout(Duration::from_millis(1)));
        assert_eq!(handle.get().unwrap(), vec![1, 4, 9, 16, 25]);
    }

    #[test]
    fn test_bound_kwargs() {
        let scale = BoundTask::new(|x: i64, factor: &i64| x * factor, 10);
        assert_eq!(*scale.kwargs(), 10);

        let values = map(scale, vec![1, 2, 3], &PoolConfig::threads(2)).unwrap();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn test_first_failure_in_input_order() {
        let checked = |x: i64| {
            if x % 2 == 0 {
                panic!("even input {}", x);
            }
            x
        };

        let result = map(checked, vec![1, 2, 3, 4], &PoolConfig::threads(4));
        assert!(matches!(result, Err(Error::TaskFailure(msg)) if msg == "even input 2"));

        let handle = map_async(checked, vec![1, 2, 3], &PoolConfig::threads(2)).unwrap();
        let outcomes = handle.outcomes();
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
    }

    #[test]
    fn test_thread_map_over_shared_handles() {
        use parking_lot::Mutex;
        use std::sync::Arc;

        let slots: Vec<Arc<Mutex<u32>>> = (1..=4).map(|i| Arc::new(Mutex::new(i))).collect();
        let bump = BoundTask::new(
            |slot: Arc<Mutex<u32>>, by: &u32| {
                *slot.lock() += by;
                slot
            },
            10,
        );

        let returned = map_threads(bump, slots.clone(), 2).unwrap();
        let values: Vec<u32> = slots.iter().map(|slot| *slot.lock()).collect();
        assert_eq!(values, vec![11, 12, 13, 14]);
        assert!(returned
            .iter()
            .zip(&slots)
            .all(|(got, sent)| Arc::ptr_eq(got, sent)));
    }

    #[test]
    fn test_empty_input() {
        let handle = map_async(square, Vec::new(), &PoolConfig::threads(1)).unwrap();
        assert!(handle.is_empty());
        assert!(handle.ready());
        assert!(handle.get().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_sync_map_processes() {
        let options = MapOptions {
            pool: PoolConfig::processes(2),
            asynchronous: false,
        };

        let values = run_in_pool(square, vec![1, 2, 3, 4, 5], &options)
            .unwrap()
            .into_results()
            .unwrap();
        assert_eq!(values, vec![1, 4, 9, 16, 25]);
    }

    #[cfg(unix)]
    #[test]
    fn test_bound_kwargs_in_processes() {
        let greet = BoundTask::new(
            |name: String, greeting: &String| format!("{}, {}!", greeting, name),
            "Hello".to_string(),
        );

        let values = map(
            greet,
            vec!["ada".to_string(), "linus".to_string()],
            &PoolConfig::processes(2),
        )
        .unwrap();
        assert_eq!(values, vec!["Hello, ada!", "Hello, linus!"]);
    }
}
