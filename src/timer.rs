//! The timer wheel and a few clock helpers.
//!
//! Pending timeouts live in one flat FIFO list that is scanned once per
//! scheduler iteration. The expected number of concurrent timers is small
//! and the per-iteration cost is dominated by the readiness poll, so a heap
//! would buy nothing here.

use std::time::{Duration, Instant};

use crate::coroutine::CoroTable;
use crate::list::{WaitList, Waiter};
use crate::wait::EventKind;

#[derive(Default)]
pub(crate) struct TimerWheel {
    list: WaitList,
}

impl TimerWheel {
    pub fn register(&mut self, w: Waiter) {
        self.list.append(w);
    }

    pub fn unregister(&mut self, w: Waiter) {
        self.list.detach(w);
    }

    /// All records whose deadline has passed, in insertion order. Waking
    /// does not detach; the owner's wait-return path does.
    pub fn expired(&self, coros: &CoroTable, now: Instant) -> Vec<Waiter> {
        let mut due = Vec::new();
        for w in self.list.iter() {
            let Some(co) = coros.by_handle(w.co) else {
                debug_assert!(false, "timeout record owned by a dead coroutine");
                continue;
            };
            match co.watched.get(w.slot) {
                Some(EventKind::Timeout { deadline }) if *deadline <= now => due.push(*w),
                Some(EventKind::Timeout { .. }) => {}
                _ => debug_assert!(false, "non-timeout record on the timer wheel"),
            }
        }
        due
    }
}

/// Current reading of the monotonic clock.
pub fn now() -> Instant {
    Instant::now()
}

/// `n` minutes as a duration. Micro/milli/second constructors live on
/// [`Duration`] itself.
pub fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

/// `n` hours as a duration.
pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

/// The "wait forever" sentinel.
pub const NO_TIMEOUT: Duration = Duration::MAX;
