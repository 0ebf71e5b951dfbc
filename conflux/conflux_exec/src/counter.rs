//! Asynchronous timed counter.
//!
//! [`Counter`] is the arithmetic state machine; [`acount`] drives it as a
//! stream that suspends for a fixed delay after every value it yields.

use futures::stream::{self, Stream};
use std::time::Duration;

/// A numeric type a [`Counter`] can step through.
pub trait Step: Copy + PartialOrd {
    /// `self + step`, or `None` if the sum is not representable
    fn forward(self, step: Self) -> Option<Self>;
}

macro_rules! impl_step_int {
    ($($t:ty),*) => {
        $(
            impl Step for $t {
                fn forward(self, step: Self) -> Option<Self> {
                    self.checked_add(step)
                }
            }
        )*
    };
}

macro_rules! impl_step_float {
    ($($t:ty),*) => {
        $(
            impl Step for $t {
                fn forward(self, step: Self) -> Option<Self> {
                    Some(self + step)
                }
            }
        )*
    };
}

impl_step_int!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
impl_step_float!(f32, f64);

/// An arithmetic sequence with an optional exclusive upper bound.
///
/// A value that would overflow the numeric type ends the sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Counter<T> {
    next: Option<T>,
    step: T,
    stop: Option<T>,
}

impl<T: Step> Counter<T> {
    /// A counter starting at `start`
    pub fn new(start: T, step: T, stop: Option<T>) -> Self {
        Self {
            next: Some(start),
            step,
            stop,
        }
    }

    /// Produce the next value, or `None` once it would reach `stop`.
    ///
    /// Exhaustion is permanent: the state stops moving once the bound is hit.
    pub fn advance(&mut self) -> Option<T> {
        let candidate = self.next?;
        if let Some(stop) = self.stop {
            if candidate >= stop {
                return None;
            }
        }
        self.next = candidate.forward(self.step);
        Some(candidate)
    }

    /// The value the next [`advance`](Self::advance) would consider
    pub fn peek(&self) -> Option<T> {
        self.next
    }
}

impl<T: Step> Iterator for Counter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.advance()
    }
}

/// Count from `start` by `step`, sleeping `delay` after each value.
///
/// Without `stop` the stream never ends and must be dropped by the
/// consumer. The sleep happens on the tokio timer, so other tasks on the
/// same runtime run while the counter waits.
pub fn acount<T: Step>(start: T, step: T, delay: Duration, stop: Option<T>) -> impl Stream<Item = T> {
    let counter = Counter::new(start, step, stop);
    stream::unfold((counter, false), move |(mut counter, yielded)| async move {
        if yielded {
            tokio::time::sleep(delay).await;
        }
        counter.advance().map(|value| (value, (counter, true)))
    })
}
