//! The unified wait primitive.
//!
//! A coroutine blocks on a set of [`WatchedEvent`]s and resumes when the
//! first of them fires. Attach/detach bookkeeping lives in the runtime
//! (`register_watches`/`unregister_watches`); this module owns the record
//! type and the public entry points.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::ChanHandle;
use crate::coroutine::Handle;
use crate::event::EventId;
use crate::runtime::with_rt;
use crate::{current, is_handle, yield_now};

/// One condition a coroutine may block on.
#[derive(Copy, Clone, Debug)]
pub(crate) enum EventKind {
    /// Fires once the monotonic clock passes `deadline`.
    Timeout { deadline: Instant },
    /// Fires when `target` is no longer a live coroutine.
    CoroutineEnds { target: Handle },
    /// Fires when the named event latches true (or is destroyed).
    UserEvent { id: EventId },
    /// Fires when the descriptor reports readable (or error) readiness.
    SocketRead { fd: RawFd },
    /// Fires when the descriptor reports writable (or error) readiness.
    SocketWrite { fd: RawFd },
    /// Fires when the channel stops being full, or closes.
    ChannelCanPush { chan: ChanHandle },
    /// Fires when the channel stops being empty, or closes.
    ChannelCanPull { chan: ChanHandle },
}

/// A wait record: one event the calling coroutine wants to be woken by.
///
/// Records are built by the constructors below (which capture [`current`] as
/// the owner) and handed to [`wait`] as a slice. A record only has meaning
/// for the duration of that call.
#[derive(Copy, Clone, Debug)]
pub struct WatchedEvent {
    pub(crate) owner: Handle,
    pub(crate) kind: EventKind,
}

impl WatchedEvent {
    fn new(kind: EventKind) -> Self {
        WatchedEvent { owner: current(), kind }
    }

    /// Fires after `delta` has elapsed.
    pub fn timeout(delta: Duration) -> Self {
        Self::timeout_at(Instant::now() + delta)
    }

    /// Fires once the clock reaches `deadline`.
    pub fn timeout_at(deadline: Instant) -> Self {
        Self::new(EventKind::Timeout { deadline })
    }

    /// Fires when the coroutine behind `h` ends (or already has).
    pub fn coroutine_ends(h: Handle) -> Self {
        Self::new(EventKind::CoroutineEnds { target: h })
    }

    /// Fires when the named event is set.
    pub fn user_event(id: EventId) -> Self {
        Self::new(EventKind::UserEvent { id })
    }

    /// Fires when `fd` becomes readable.
    pub fn can_read(fd: RawFd) -> Self {
        Self::new(EventKind::SocketRead { fd })
    }

    /// Fires when `fd` becomes writable.
    pub fn can_write(fd: RawFd) -> Self {
        Self::new(EventKind::SocketWrite { fd })
    }

    /// Fires when an element can be pushed into the channel.
    pub fn can_push(chan: ChanHandle) -> Self {
        Self::new(EventKind::ChannelCanPush { chan })
    }

    /// Fires when an element can be pulled from the channel.
    pub fn can_pull(chan: ChanHandle) -> Self {
        Self::new(EventKind::ChannelCanPull { chan })
    }
}

/// Block the current coroutine until one of `events` fires and return the
/// index of the firing record.
///
/// If any record is already satisfiable the call returns its index (first
/// ready by position) without registering anything. Whatever woke the
/// coroutine, every record is detached from every source before the call
/// returns, so no waiter is ever left behind.
///
/// Returns `None` only in the defensive case where the coroutine was woken
/// without a matching record.
///
/// Panics when called outside a coroutine.
pub fn wait(events: &[WatchedEvent]) -> Option<usize> {
    let slot = with_rt(|rt| {
        let h = rt.current;
        assert!(
            rt.coros.by_handle(h).is_some(),
            "wait() called outside of a coroutine"
        );
        h.id as usize
    });

    if let Some(idx) = with_rt(|rt| rt.ready_without_blocking(events)) {
        return Some(idx);
    }

    debug_assert!(!events.is_empty(), "wait() on an empty event set never wakes");

    with_rt(|rt| rt.register_watches(slot, events));
    yield_now();
    with_rt(|rt| {
        debug_assert!(
            rt.coros.slot(slot).woken_by.is_some(),
            "coroutine resumed from wait() without a firing event"
        );
        rt.unregister_watches(slot)
    })
}

/// Block the current coroutine while `pred` keeps returning `true`.
///
/// Returns immediately if `pred` is already `false`. Otherwise the scheduler
/// re-evaluates the predicate once per iteration; this is the escape hatch
/// for conditions that are not expressible as events.
pub fn wait_while<F>(pred: F)
where
    F: FnMut() -> bool + 'static,
{
    let mut pred = pred;
    if !pred() {
        return;
    }
    with_rt(|rt| {
        let h = rt.current;
        let co = rt
            .coros
            .by_handle_mut(h)
            .expect("wait_while() called outside of a coroutine");
        co.state = crate::coroutine::State::WaitingForCondition;
        co.must_wait = Some(Box::new(pred));
    });
    yield_now();
}

/// Put the current coroutine to sleep for `delta`.
pub fn sleep(delta: Duration) {
    let events = [WatchedEvent::timeout(delta)];
    let _ = wait(&events);
}

/// Block until the coroutine behind `h` ends. Returns immediately when the
/// handle is already dead.
pub fn join(h: Handle) {
    if !is_handle(h) {
        return;
    }
    let events = [WatchedEvent::coroutine_ends(h)];
    let _ = wait(&events);
}

/// Block until every one of `handles` has ended.
pub fn wait_all(handles: &[Handle]) {
    for &h in handles {
        join(h);
    }
}

/// Block until the named event is set. Returns immediately when it already
/// is.
pub fn wait_event(id: EventId) {
    let events = [WatchedEvent::user_event(id)];
    let _ = wait(&events);
}
