//! Accumulating stopwatch.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Accumulates elapsed wall-clock time across start/stop cycles.
///
/// Starting a running stopwatch or stopping an idle one is a state error.
#[derive(Debug, Default, Clone)]
pub struct Stopwatch {
    elapsed: Duration,
    started_at: Option<Instant>,
}

impl Stopwatch {
    /// A stopped stopwatch with nothing accumulated
    pub fn new() -> Self {
        Self::default()
    }

    /// A stopwatch that is already running
    pub fn started() -> Self {
        Self {
            elapsed: Duration::ZERO,
            started_at: Some(Instant::now()),
        }
    }

    /// Begin timing
    pub fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            return Err(Error::PoolState("stopwatch already started".to_string()));
        }
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Stop timing and add the interval to the total
    pub fn stop(&mut self) -> Result<Duration> {
        let started_at = self
            .started_at
            .take()
            .ok_or_else(|| Error::PoolState("stopwatch not started".to_string()))?;
        self.elapsed += started_at.elapsed();
        Ok(self.elapsed)
    }

    /// Clear the accumulated total; a running interval keeps running
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    /// Whether an interval is in progress
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Accumulated total, including the running interval if any
    pub fn elapsed(&self) -> Duration {
        self.elapsed + self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_start_stop_accumulates() {
        let mut watch = Stopwatch::new();
        assert!(!watch.is_running());

        watch.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        let first = watch.stop().unwrap();
        assert!(first >= Duration::from_millis(10));

        watch.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        let second = watch.stop().unwrap();
        assert!(second >= first + Duration::from_millis(10));
    }

    #[test]
    fn test_double_start_and_stop_rejected() {
        let mut watch = Stopwatch::started();
        assert!(matches!(watch.start(), Err(Error::PoolState(_))));

        watch.stop().unwrap();
        assert!(matches!(watch.stop(), Err(Error::PoolState(_))));
    }

    #[test]
    fn test_reset() {
        let mut watch = Stopwatch::started();
        thread::sleep(Duration::from_millis(5));
        watch.stop().unwrap();
        assert!(watch.elapsed() > Duration::ZERO);

        watch.reset();
        assert_eq!(watch.elapsed(), Duration::ZERO);
    }
}
