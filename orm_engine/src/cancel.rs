//! Tracking kernel — cooperative cancellation.
//!
//! `TimeoutWatch` runs a watcher thread that flips a `CancellationToken`
//! once the ceiling elapses. Long-running loops call `token.check(..)`
//! between rows; a fired token becomes `OrmError::TimedOut`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{OrmError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checkpoint. `context` names the operation in the resulting error.
    pub fn check(&self, context: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(OrmError::TimedOut(context.to_string()));
        }
        Ok(())
    }
}

struct WatchSignal {
    done: Mutex<bool>,
    wake: Condvar,
}

/// Cancels its token after `ceiling` unless dropped first.
pub struct TimeoutWatch {
    signal: Arc<WatchSignal>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutWatch {
    pub fn start(token: CancellationToken, ceiling: Duration) -> Self {
        let signal = Arc::new(WatchSignal { done: Mutex::new(false), wake: Condvar::new() });
        let watcher = signal.clone();
        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + ceiling;
            let mut done = watcher.done.lock();
            while !*done {
                if watcher.wake.wait_until(&mut done, deadline).timed_out() {
                    if !*done {
                        debug!(?ceiling, "timeout watch fired");
                        token.cancel();
                    }
                    return;
                }
            }
        });
        TimeoutWatch { signal, handle: Some(handle) }
    }
}

impl Drop for TimeoutWatch {
    fn drop(&mut self) {
        *self.signal.done.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_cancels_after_ceiling() {
        let token = CancellationToken::new();
        let _watch = TimeoutWatch::start(token.clone(), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(80));
        let err = token.check("Order").unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_dropped_watch_never_fires() {
        let token = CancellationToken::new();
        {
            let _watch = TimeoutWatch::start(token.clone(), Duration::from_secs(30));
        }
        assert!(token.check("Order").is_ok());
    }
}
