//! Future handles for submitted tasks.
//!
//! A [`TaskFuture`] is the caller's side of a one-shot slot; the pool keeps
//! the matching [`Completer`]. Dropping a completer without completing it
//! resolves the future with [`Error::TaskLost`], so a future never stays
//! pending after its worker is gone.

use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Slot<R> {
    outcome: Mutex<Option<Result<R>>>,
    ready: Condvar,
}

/// Handle to the eventual outcome of a submitted task
pub struct TaskFuture<R> {
    id: usize,
    slot: Arc<Slot<R>>,
}

impl<R> TaskFuture<R> {
    /// Submission index of the task within its pool
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the task has finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Block until the task has finished
    pub fn wait(&self) {
        let mut outcome = self.slot.outcome.lock();
        while outcome.is_none() {
            self.slot.ready.wait(&mut outcome);
        }
    }

    /// Block until the task has finished or `timeout` elapses.
    ///
    /// Returns `true` if the task finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        while outcome.is_none() {
            if self
                .slot
                .ready
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                return outcome.is_some();
            }
        }
        true
    }

    /// Wait for the task and take its outcome.
    ///
    /// A task that panicked yields [`Error::TaskFailure`] here, never at
    /// submission time.
    pub fn result(self) -> Result<R> {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            self.slot.ready.wait(&mut outcome);
        }
    }
}

impl<R> fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Pool-side half of a future
pub(crate) struct Completer<R> {
    id: usize,
    slot: Option<Arc<Slot<R>>>,
    notify: Option<Sender<usize>>,
}

impl<R> Completer<R> {
    /// Store the outcome, wake waiters, then announce completion.
    pub(crate) fn complete(mut self, outcome: Result<R>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<R>) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        *slot.outcome.lock() = Some(outcome);
        slot.ready.notify_all();

        if let Some(notify) = self.notify.take() {
            // Nobody listening is fine
            let _ = notify.send(self.id);
        }
    }
}

impl<R> Drop for Completer<R> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            let id = self.id;
            self.finish(Err(Error::TaskLost { id }));
        }
    }
}

/// Create a connected future/completer pair.
///
/// `notify` receives `id` once the outcome is stored.
pub(crate) fn task_pair<R>(
    id: usize,
    notify: Option<Sender<usize>>,
) -> (TaskFuture<R>, Completer<R>) {
    let slot = Arc::new(Slot {
        outcome: Mutex::new(None),
        ready: Condvar::new(),
    });

    let future = TaskFuture {
        id,
        slot: Arc::clone(&slot),
    };
    let completer = Completer {
        id,
        slot: Some(slot),
        notify,
    };

    (future, completer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_then_result() {
        let (future, completer) = task_pair::<u32>(0, None);
        assert!(!future.is_done());

        completer.complete(Ok(7));

        assert!(future.is_done());
        assert_eq!(future.result().unwrap(), 7);
    }

    #[test]
    fn test_result_blocks_until_completed() {
        let (future, completer) = task_pair::<&'static str>(1, None);

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok("done"));
        });

        assert_eq!(future.result().unwrap(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn test_dropped_completer_resolves_lost() {
        let (future, completer) = task_pair::<u32>(5, None);
        drop(completer);

        assert!(matches!(future.result(), Err(Error::TaskLost { id: 5 })));
    }

    #[test]
    fn test_notify_sent_after_outcome_stored() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (future, completer) = task_pair::<u32>(9, Some(tx));

        completer.complete(Err(Error::TaskFailure("boom".to_string())));

        assert_eq!(rx.recv().unwrap(), 9);
        assert!(future.is_done());
        assert!(matches!(future.result(), Err(Error::TaskFailure(msg)) if msg == "boom"));
    }

    #[test]
    fn test_wait_timeout() {
        let (future, completer) = task_pair::<u32>(0, None);
        assert!(!future.wait_timeout(Duration::from_millis(10)));

        completer.complete(Ok(1));
        assert!(future.wait_timeout(Duration::from_millis(10)));
    }
}
