use core::{future::poll_fn, task::Poll};

use atomic_waker::AtomicWaker;
use embassy_futures::yield_now;
use embassy_time::{Duration, Instant};
use portable_atomic::{AtomicBool, Ordering};

/// A single slot notification, that can be raised from interrupt context.
///
/// Raising it multiple times before it's awaited results in only one wake up, so the waiting task
/// has to re-evaluate the actual state itself.
pub struct WakeSignal {
    waker: AtomicWaker,
    pending: AtomicBool,
}
impl WakeSignal {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            pending: AtomicBool::new(false),
        }
    }
    /// Raise the signal and wake the waiting task.
    pub fn signal(&self) {
        self.pending.store(true, Ordering::Release);
        self.waker.wake();
    }
    /// Drop a pending signal without waking anyone.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::Relaxed);
    }
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
    /// Asynchronously wait for the signal to be raised and consume it.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            if self.pending.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `predicate` until it returns `true` or `timeout` has passed.
///
/// This yields to the executor between polls, so other tasks keep running, but it doesn't rely on
/// any interrupt to make progress. Returns `true`, if the predicate was satisfied in time.
pub async fn await_condition(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout).unwrap_or(Instant::MAX);
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::{
        block_on,
        select::{select, Either},
    };

    #[test]
    fn test_signals_are_coalesced() {
        let signal = WakeSignal::new();
        signal.signal();
        signal.signal();
        signal.signal();
        block_on(async {
            signal.wait().await;
            // Three edges, one wake up.
            assert!(matches!(
                select(signal.wait(), yield_now()).await,
                Either::Second(())
            ));
        });
    }

    #[test]
    fn test_reset_discards_pending_signal() {
        let signal = WakeSignal::new();
        signal.signal();
        assert!(signal.is_pending());
        signal.reset();
        assert!(!signal.is_pending());
    }

    #[test]
    fn test_await_condition_succeeds_immediately() {
        assert!(block_on(await_condition(|| true, Duration::from_millis(0))));
    }

    #[test]
    fn test_await_condition_times_out() {
        let start = Instant::now();
        let mut polls = 0;
        let satisfied = block_on(await_condition(
            || {
                polls += 1;
                false
            },
            Duration::from_millis(5),
        ));
        assert!(!satisfied);
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(polls > 1);
    }

    #[test]
    fn test_await_condition_sees_late_change() {
        let mut countdown = 10;
        assert!(block_on(await_condition(
            || {
                countdown -= 1;
                countdown == 0
            },
            Duration::from_secs(5),
        )));
    }
}
