//! Per-thread runtime state and the main scheduling loop.
//!
//! The coroutine table, channel table, named-event table, timer wheel and
//! socket poll set are one-per-scheduler singletons. The scheduler runs on
//! exactly one OS thread; every thread that touches the API gets its own
//! independent runtime, and nothing here may be shared across threads.

use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::panic;
use std::time::Instant;

use log::warn;

use crate::channel::ChanTable;
use crate::coroutine::{resume_slot, CoroTable, Handle, State};
use crate::event::EventTable;
use crate::list::Waiter;
use crate::poller::{Dir, Poller};
use crate::timer::TimerWheel;
use crate::wait::{EventKind, WatchedEvent};

pub(crate) struct Runtime {
    pub coros: CoroTable,
    pub channels: ChanTable,
    pub events: EventTable,
    pub timers: TimerWheel,
    pub poller: Poller,
    /// Handle of the coroutine currently executing; NONE while the
    /// scheduler itself runs.
    pub current: Handle,
    pub num_loops: u64,
    /// First uncaught coroutine panic of this iteration, rethrown to the
    /// embedder once control is back outside every coroutine.
    pub pending_panic: Option<Box<dyn Any + Send>>,
}

impl Runtime {
    fn new() -> Runtime {
        Runtime {
            coros: CoroTable::default(),
            channels: ChanTable::default(),
            events: EventTable::default(),
            timers: TimerWheel::default(),
            poller: Poller::new().expect("failed to create the socket poller"),
            current: Handle::NONE,
            num_loops: 0,
            pending_panic: None,
        }
    }
}

thread_local! {
    static RT: RefCell<Runtime> = RefCell::new(Runtime::new());
}

/// Borrow this thread's runtime for the duration of `f`. The borrow must
/// never be held across a context switch.
pub(crate) fn with_rt<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RT.with(|rt| f(&mut rt.borrow_mut()))
}

impl Runtime {
    /// Transition one wait record's owner out of WaitingForEvent. The
    /// caller is responsible for detaching the record from its own list
    /// first; the owner detaches the rest when its `wait` returns.
    pub fn wake(&mut self, w: Waiter) {
        let Some(co) = self.coros.by_handle_mut(w.co) else {
            return;
        };
        match co.state {
            State::WaitingForEvent => {
                co.woken_by = Some(w.slot);
                co.state = State::Running;
            }
            // A second source firing in the same tick loses the race; the
            // first recorded record wins.
            State::Running if co.woken_by.is_some() => {}
            _ => panic!("woke a coroutine that is not waiting for an event"),
        }
    }

    /// Wake everything joined on the coroutine in `slot`.
    pub fn wake_waiters_of(&mut self, slot: usize) {
        let mut list = mem::take(&mut self.coros.slot_mut(slot).waiting_for_me);
        while let Some(w) = list.detach_first() {
            self.wake(w);
        }
    }

    /// The fast path of `wait`: first event that is already satisfiable,
    /// scanned by position. Sockets and timeouts always go through the
    /// poller and the wheel.
    pub fn ready_without_blocking(&self, events: &[WatchedEvent]) -> Option<usize> {
        for (idx, ev) in events.iter().enumerate() {
            let ready = match ev.kind {
                EventKind::ChannelCanPull { chan } => match self.channels.resolve(chan) {
                    Some(c) => !c.is_empty() || c.header().closed,
                    None => false,
                },
                EventKind::ChannelCanPush { chan } => match self.channels.resolve(chan) {
                    Some(c) => !c.is_full() && !c.header().closed,
                    None => false,
                },
                EventKind::CoroutineEnds { target } => self.coros.by_handle(target).is_none(),
                EventKind::UserEvent { id } => self.events.is_set(id),
                EventKind::Timeout { .. }
                | EventKind::SocketRead { .. }
                | EventKind::SocketWrite { .. } => false,
            };
            if ready {
                return Some(idx);
            }
        }
        None
    }

    /// Attach one record per event to its source list and put the caller to
    /// sleep.
    pub fn register_watches(&mut self, slot: usize, events: &[WatchedEvent]) {
        let h = self.coros.slot(slot).handle;
        for (idx, ev) in events.iter().enumerate() {
            debug_assert_eq!(ev.owner, h, "wait record built by a different coroutine");
            let w = Waiter { co: h, slot: idx };
            match ev.kind {
                EventKind::Timeout { .. } => self.timers.register(w),
                EventKind::CoroutineEnds { target } => {
                    // The fast path already ruled out a dead target.
                    if let Some(t) = self.coros.by_handle_mut(target) {
                        t.waiting_for_me.append(w);
                    }
                }
                EventKind::UserEvent { id } => self.events.attach(id, w),
                EventKind::SocketRead { fd } => self.poller.add(fd, Dir::Read, w),
                EventKind::SocketWrite { fd } => self.poller.add(fd, Dir::Write, w),
                EventKind::ChannelCanPush { chan } => match self.channels.resolve_mut(chan) {
                    Some(c) => c.header_mut().push_waiters.append(w),
                    None => warn!("push wait on an unresolvable channel {:?}", chan),
                },
                EventKind::ChannelCanPull { chan } => match self.channels.resolve_mut(chan) {
                    Some(c) => c.header_mut().pull_waiters.append(w),
                    None => warn!("pull wait on an unresolvable channel {:?}", chan),
                },
            }
        }
        let co = self.coros.slot_mut(slot);
        co.watched.clear();
        co.watched.extend(events.iter().map(|e| e.kind));
        co.woken_by = None;
        co.state = State::WaitingForEvent;
    }

    /// Detach every record registered by the wait in progress and report
    /// which one fired. Detaching a record its source already removed is a
    /// no-op.
    pub fn unregister_watches(&mut self, slot: usize) -> Option<usize> {
        let watched = mem::take(&mut self.coros.slot_mut(slot).watched);
        let h = self.coros.slot(slot).handle;
        for (idx, kind) in watched.iter().enumerate() {
            let w = Waiter { co: h, slot: idx };
            match *kind {
                EventKind::Timeout { .. } => self.timers.unregister(w),
                EventKind::CoroutineEnds { target } => {
                    if let Some(t) = self.coros.by_handle_mut(target) {
                        t.waiting_for_me.detach(w);
                    }
                }
                EventKind::UserEvent { id } => self.events.detach(id, w),
                EventKind::SocketRead { fd } => self.poller.del(fd, Dir::Read, w),
                EventKind::SocketWrite { fd } => self.poller.del(fd, Dir::Write, w),
                EventKind::ChannelCanPush { chan } => {
                    if let Some(c) = self.channels.resolve_mut(chan) {
                        c.header_mut().push_waiters.detach(w);
                    }
                }
                EventKind::ChannelCanPull { chan } => {
                    if let Some(c) = self.channels.resolve_mut(chan) {
                        c.header_mut().pull_waiters.detach(w);
                    }
                }
            }
        }
        let co = self.coros.slot_mut(slot);
        let fired = co.woken_by.take();
        if co.state == State::WaitingForEvent {
            co.state = State::Running;
        }
        fired
    }

    fn poll_io(&mut self) {
        let woken = self.poller.collect_ready();
        for w in woken {
            self.wake(w);
        }
    }

    fn check_timeouts(&mut self) {
        let due = self.timers.expired(&self.coros, Instant::now());
        for w in due {
            self.wake(w);
        }
    }
}

/// Run one scheduler iteration: poll socket readiness, expire timers, then
/// resume every runnable coroutine once, in slot order.
///
/// Returns the number of coroutines that are still alive (running or
/// blocked); the embedder drives the loop until this reaches zero. Must not
/// be called from inside a coroutine.
pub fn execute_actives() -> usize {
    with_rt(|rt| {
        debug_assert!(
            rt.coros.by_handle(rt.current).is_none(),
            "execute_actives() called from inside a coroutine"
        );
        rt.num_loops += 1;
        rt.poll_io();
        rt.check_timeouts();
    });
    let nactives = run_actives();
    if let Some(payload) = with_rt(|rt| rt.pending_panic.take()) {
        panic::resume_unwind(payload);
    }
    nactives
}

/// Monotonic count of scheduler iterations, for diagnostics.
pub fn num_loops() -> u64 {
    with_rt(|rt| rt.num_loops)
}

enum Step {
    Done,
    Skip,
    Active,
    Resume,
    Condition(Box<dyn FnMut() -> bool>),
}

fn run_actives() -> usize {
    let mut nactives = 0;
    let mut i = 0;
    loop {
        let step = with_rt(|rt| {
            if i >= rt.coros.len() {
                return Step::Done;
            }
            let this_loop = rt.num_loops;
            let co = rt.coros.slot_mut(i);
            match co.state {
                State::Free => Step::Skip,
                // Still blocked on its events; alive but not runnable.
                State::WaitingForEvent => Step::Active,
                State::WaitingForCondition => Step::Condition(
                    co.must_wait
                        .take()
                        .expect("condition wait without a predicate"),
                ),
                State::Running => {
                    if co.born_loop == this_loop && co.boot.is_some() {
                        // Started during this very iteration; it runs no
                        // earlier than the next pass over its slot.
                        Step::Active
                    } else {
                        Step::Resume
                    }
                }
                State::Uninitialized => unreachable!("uninitialized slot in the table"),
            }
        });
        match step {
            Step::Done => break,
            Step::Skip => {}
            Step::Active => nactives += 1,
            Step::Resume => {
                resume_slot(i);
                if with_rt(|rt| rt.coros.slot(i).state.is_active()) {
                    nactives += 1;
                }
            }
            Step::Condition(mut pred) => {
                // The predicate runs without any runtime borrow held, so it
                // is free to call back into the API.
                let still_waiting = pred();
                let resume_now = with_rt(|rt| {
                    let co = rt.coros.slot_mut(i);
                    if co.state != State::WaitingForCondition {
                        // The predicate itself retired this coroutine.
                        return false;
                    }
                    if still_waiting {
                        co.must_wait = Some(pred);
                        false
                    } else {
                        co.state = State::Running;
                        true
                    }
                });
                if resume_now {
                    resume_slot(i);
                }
                if with_rt(|rt| rt.coros.slot(i).state.is_active()) {
                    nactives += 1;
                }
            }
        }
        i += 1;
    }
    nactives
}
