//! Bounded CSP channels.
//!
//! A channel is a typed, bounded FIFO supporting `push`, `pull` and `close`,
//! with FIFO wakeup of waiters: each stored element wakes at most one
//! consumer, each freed slot wakes at most one producer, and `close` wakes
//! everything (producers first, then consumers). Buffered elements stay
//! pullable after `close` until exhausted.
//!
//! Channels are addressed through generation-tagged [`ChanHandle`]s packed
//! into 32 bits, so they stay cheap to copy into coroutine closures and a
//! stale handle fails to resolve instead of dangling. Channel records are
//! never destroyed; `close` is their terminal state.
//!
//! Timer channels ([`every`] / [`after`]) emit timestamps on a schedule
//! through the same handle machinery.

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use log::trace;

use crate::list::{WaitList, Waiter};
use crate::runtime::{with_rt, Runtime};
use crate::wait::{wait, WatchedEvent};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ChanClass {
    Invalid = 0,
    Timer = 1,
    Memory = 2,
    /// Reserved for channels backed by OS endpoints.
    #[allow(dead_code)]
    Io = 3,
}

fn class_from_bits(bits: u32) -> ChanClass {
    match bits {
        1 => ChanClass::Timer,
        2 => ChanClass::Memory,
        3 => ChanClass::Io,
        _ => ChanClass::Invalid,
    }
}

/// Opaque 32-bit channel reference: class (4 bits), slot index (12 bits) and
/// generation (16 bits). Compares by full bit pattern.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChanHandle {
    pub(crate) class: ChanClass,
    index: u16,
    age: u16,
}

const INDEX_BITS: u32 = 12;
const MAX_CHANNELS: usize = 1 << INDEX_BITS;

impl ChanHandle {
    fn new(class: ChanClass, index: usize) -> ChanHandle {
        assert!(index < MAX_CHANNELS, "channel table exhausted");
        ChanHandle { class, index: index as u16, age: 1 }
    }

    /// The packed bit pattern, handy for logs and serialization.
    pub fn as_u32(self) -> u32 {
        (self.age as u32) << 16 | (self.index as u32) << 4 | self.class as u32
    }

    /// Rebuild a handle from its packed form. The result still has to
    /// resolve against the live table to be usable.
    pub fn from_u32(v: u32) -> ChanHandle {
        ChanHandle {
            class: class_from_bits(v & 0xf),
            index: ((v >> 4) & 0xfff) as u16,
            age: (v >> 16) as u16,
        }
    }
}

/// State common to every channel class.
#[derive(Default)]
pub(crate) struct ChanHeader {
    pub handle: Option<ChanHandle>,
    pub closed: bool,
    pub push_waiters: WaitList,
    pub pull_waiters: WaitList,
}

pub(crate) trait AnyChan {
    fn header(&self) -> &ChanHeader;
    fn header_mut(&mut self) -> &mut ChanHeader;
    fn is_empty(&self) -> bool {
        true
    }
    fn is_full(&self) -> bool {
        false
    }
    fn push_item(&mut self, _item: Box<dyn Any>) -> bool {
        false
    }
    fn pull_item(&mut self) -> Option<Box<dyn Any>> {
        None
    }
    fn as_time_mut(&mut self) -> Option<&mut TimeChan> {
        None
    }
    fn as_time(&self) -> Option<&TimeChan> {
        None
    }
}

/// Ring buffer of type-erased elements. Capacity is fixed at creation and
/// is at least one, so a push always stores before waking a consumer.
struct MemChan {
    header: ChanHeader,
    capacity: usize,
    items: VecDeque<Box<dyn Any>>,
}

impl MemChan {
    fn new(capacity: usize) -> MemChan {
        assert!(capacity >= 1, "channel capacity must be at least 1");
        MemChan {
            header: ChanHeader::default(),
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }
}

impl AnyChan for MemChan {
    fn header(&self) -> &ChanHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut ChanHeader {
        &mut self.header
    }
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
    fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }
    fn push_item(&mut self, item: Box<dyn Any>) -> bool {
        debug_assert!(!self.is_full());
        self.items.push_back(item);
        true
    }
    fn pull_item(&mut self) -> Option<Box<dyn Any>> {
        self.items.pop_front()
    }
}

/// Emits timestamps on a schedule. Reports itself empty so that a pull wait
/// on it can only be satisfied by the deadline or by `close`.
pub(crate) struct TimeChan {
    header: ChanHeader,
    next: Instant,
    interval: Duration,
    periodic: bool,
}

impl TimeChan {
    fn new(interval: Duration, periodic: bool) -> TimeChan {
        TimeChan {
            header: ChanHeader::default(),
            next: Instant::now() + interval,
            interval,
            periodic,
        }
    }

    /// Advance by the smallest multiple of the interval that lands strictly
    /// after `now`, catching up if the scheduler fell behind.
    fn advance(&mut self, now: Instant) {
        loop {
            self.next += self.interval;
            if self.next > now {
                break;
            }
        }
    }
}

impl AnyChan for TimeChan {
    fn header(&self) -> &ChanHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut ChanHeader {
        &mut self.header
    }
    fn as_time_mut(&mut self) -> Option<&mut TimeChan> {
        Some(self)
    }
    fn as_time(&self) -> Option<&TimeChan> {
        Some(self)
    }
}

/// Table of every channel record. Records are never removed; a resolve
/// fails on index out of range or age mismatch.
#[derive(Default)]
pub(crate) struct ChanTable {
    chans: Vec<Box<dyn AnyChan>>,
}

impl ChanTable {
    fn register(&mut self, mut c: Box<dyn AnyChan>, class: ChanClass) -> ChanHandle {
        let h = ChanHandle::new(class, self.chans.len());
        c.header_mut().handle = Some(h);
        self.chans.push(c);
        trace!("channel {:08x} created", h.as_u32());
        h
    }

    pub fn resolve(&self, h: ChanHandle) -> Option<&dyn AnyChan> {
        let c = self.chans.get(h.index as usize)?;
        if c.header().handle != Some(h) {
            return None;
        }
        Some(c.as_ref())
    }

    pub fn resolve_mut(&mut self, h: ChanHandle) -> Option<&mut dyn AnyChan> {
        let c = self.chans.get_mut(h.index as usize)?;
        if c.header().handle != Some(h) {
            return None;
        }
        Some(c.as_mut())
    }
}

enum PushStep {
    Done,
    Fail,
    Wait,
}

fn try_push(rt: &mut Runtime, h: ChanHandle, item: &mut Option<Box<dyn Any>>) -> PushStep {
    let woken = {
        let Some(c) = rt.channels.resolve_mut(h) else {
            return PushStep::Fail;
        };
        if c.header().closed {
            return PushStep::Fail;
        }
        if c.is_full() {
            return PushStep::Wait;
        }
        let stored = c.push_item(item.take().expect("push retried after storing"));
        debug_assert!(stored, "channel refused an element while not full");
        // One stored element wakes at most one consumer.
        c.header_mut().pull_waiters.detach_first()
    };
    if let Some(w) = woken {
        rt.wake(w);
    }
    PushStep::Done
}

enum PullStep {
    Got(Box<dyn Any>),
    Fail,
    Wait,
}

fn try_pull(rt: &mut Runtime, h: ChanHandle) -> PullStep {
    let (item, woken) = {
        let Some(c) = rt.channels.resolve_mut(h) else {
            return PullStep::Fail;
        };
        if c.is_empty() {
            // Buffered elements outlive `close`; only closed-and-empty
            // fails.
            return if c.header().closed { PullStep::Fail } else { PullStep::Wait };
        }
        let item = c.pull_item().expect("non-empty channel had no element");
        (item, c.header_mut().push_waiters.detach_first())
    };
    if let Some(w) = woken {
        rt.wake(w);
    }
    PullStep::Got(item)
}

/// Type-erased pull shared by the typed facade and [`pull_discard`].
fn pull_raw(h: ChanHandle) -> Option<Box<dyn Any>> {
    loop {
        match with_rt(|rt| try_pull(rt, h)) {
            PullStep::Got(item) => return Some(item),
            PullStep::Fail => return None,
            PullStep::Wait => {
                let events = [WatchedEvent::can_pull(h)];
                wait(&events);
            }
        }
    }
}

/// A typed handle to a bounded memory channel. Copyable; all copies refer
/// to the same channel.
pub struct Channel<T> {
    h: ChanHandle,
    _elem: PhantomData<fn() -> T>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Channel<T> {}

impl<T: 'static> Channel<T> {
    /// Create a memory channel holding up to `capacity` elements.
    ///
    /// Panics if `capacity` is zero; rendezvous semantics are not
    /// supported, a push always stores before waking a consumer.
    pub fn create(capacity: usize) -> Channel<T> {
        let h = with_rt(|rt| {
            rt.channels
                .register(Box::new(MemChan::new(capacity)), ChanClass::Memory)
        });
        Channel { h, _elem: PhantomData }
    }

    /// The untyped handle, for `choose` events, logs and `pull_discard`.
    pub fn handle(&self) -> ChanHandle {
        self.h
    }

    /// Store `value`, blocking while the channel is full. Returns `false`
    /// once the channel is closed.
    pub fn push(&self, value: T) -> bool {
        let mut item: Option<Box<dyn Any>> = Some(Box::new(value));
        loop {
            match with_rt(|rt| try_push(rt, self.h, &mut item)) {
                PushStep::Done => return true,
                PushStep::Fail => return false,
                PushStep::Wait => {
                    let events = [WatchedEvent::can_push(self.h)];
                    wait(&events);
                }
            }
        }
    }

    /// Take the oldest element, blocking while the channel is empty.
    /// Returns `None` once the channel is closed and drained.
    pub fn pull(&self) -> Option<T> {
        let item = pull_raw(self.h)?;
        Some(
            *item
                .downcast::<T>()
                .ok()
                .expect("channel element type mismatch"),
        )
    }

    /// Close the channel; see [`close_channel`].
    pub fn close(&self) -> bool {
        close_channel(self.h)
    }
}

/// Close any channel: no further pushes succeed, buffered elements remain
/// pullable, and every waiter is woken before the call returns (producers
/// first, then consumers). Returns `false` if the handle is stale or the
/// channel was already closed.
pub fn close_channel(h: ChanHandle) -> bool {
    with_rt(|rt| {
        let woken = {
            let Some(c) = rt.channels.resolve_mut(h) else {
                return false;
            };
            if c.header().closed {
                return false;
            }
            trace!("channel {:08x} closed", h.as_u32());
            let header = c.header_mut();
            header.closed = true;
            let mut woken: Vec<Waiter> = Vec::new();
            while let Some(w) = header.push_waiters.detach_first() {
                woken.push(w);
            }
            while let Some(w) = header.pull_waiters.detach_first() {
                woken.push(w);
            }
            woken
        };
        for w in woken {
            rt.wake(w);
        }
        true
    })
}

/// Does the handle still resolve to a channel record?
pub fn is_channel(h: ChanHandle) -> bool {
    with_rt(|rt| rt.channels.resolve(h).is_some())
}

/// Pull one element of any channel class and throw it away. Useful for
/// timer channels and flow-control signals where the value is noise.
pub fn pull_discard(h: ChanHandle) -> bool {
    match h.class {
        ChanClass::Timer => TimerChannel { h }.pull().is_some(),
        _ => pull_raw(h).is_some(),
    }
}

/// A channel that delivers timestamps on a schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerChannel {
    h: ChanHandle,
}

enum TimeStep {
    Fire(Instant),
    FireAndClose(Instant),
    Fail,
    WaitFor(Duration),
}

impl TimerChannel {
    /// The untyped handle.
    pub fn handle(&self) -> ChanHandle {
        self.h
    }

    /// Block until the next scheduled tick and return the firing timestamp,
    /// or `None` if the channel is (or becomes) closed while waiting.
    pub fn pull(&self) -> Option<Instant> {
        loop {
            let step = with_rt(|rt| {
                let Some(c) = rt.channels.resolve_mut(self.h) else {
                    return TimeStep::Fail;
                };
                if c.header().closed {
                    return TimeStep::Fail;
                }
                let Some(tc) = c.as_time_mut() else {
                    return TimeStep::Fail;
                };
                let now = Instant::now();
                if tc.next <= now {
                    if tc.periodic {
                        tc.advance(now);
                        TimeStep::Fire(now)
                    } else {
                        // A one-shot channel closes itself on delivery.
                        TimeStep::FireAndClose(now)
                    }
                } else {
                    TimeStep::WaitFor(tc.next - now)
                }
            });
            match step {
                TimeStep::Fire(ts) => return Some(ts),
                TimeStep::FireAndClose(ts) => {
                    close_channel(self.h);
                    return Some(ts);
                }
                TimeStep::Fail => return None,
                TimeStep::WaitFor(delta) => {
                    // Either the deadline passes or the channel closes
                    // under us, whichever comes first.
                    let events = [
                        WatchedEvent::timeout(delta),
                        WatchedEvent::can_pull(self.h),
                    ];
                    match wait(&events) {
                        Some(0) => continue,
                        _ => return None,
                    }
                }
            }
        }
    }

    /// Time left until the next tick, without blocking. Zero for a closed
    /// or stale channel.
    pub fn time_to_next_event(&self) -> Duration {
        with_rt(|rt| {
            let Some(c) = rt.channels.resolve(self.h) else {
                return Duration::ZERO;
            };
            if c.header().closed {
                return Duration::ZERO;
            }
            match c.as_time() {
                Some(tc) => tc.next.saturating_duration_since(Instant::now()),
                None => Duration::ZERO,
            }
        })
    }

    /// Next absolute deadline, if the channel is still open.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        with_rt(|rt| {
            let c = rt.channels.resolve(self.h)?;
            if c.header().closed {
                return None;
            }
            c.as_time().map(|tc| tc.next)
        })
    }

    /// Close the channel; pending and future pulls return `None`.
    pub fn close(&self) -> bool {
        close_channel(self.h)
    }
}

/// A periodic timer channel ticking every `interval`. Stays open until
/// explicitly closed; if the scheduler falls behind, the schedule catches
/// up by whole intervals rather than bursting.
pub fn every(interval: Duration) -> TimerChannel {
    assert!(!interval.is_zero(), "periodic timer needs a non-zero interval");
    let h = with_rt(|rt| {
        rt.channels
            .register(Box::new(TimeChan::new(interval, true)), ChanClass::Timer)
    });
    TimerChannel { h }
}

/// A one-shot timer channel firing once after `delay`, then closing itself.
pub fn after(delay: Duration) -> TimerChannel {
    let h = with_rt(|rt| {
        rt.channels
            .register(Box::new(TimeChan::new(delay, false)), ChanClass::Timer)
    });
    TimerChannel { h }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_packing_roundtrip() {
        let h = ChanHandle { class: ChanClass::Memory, index: 0xabc, age: 0x1234 };
        assert_eq!(ChanHandle::from_u32(h.as_u32()), h);
        let t = ChanHandle { class: ChanClass::Timer, index: 0, age: 1 };
        assert_eq!(ChanHandle::from_u32(t.as_u32()), t);
    }

    #[test]
    fn stale_handle_does_not_resolve() {
        let mut table = ChanTable::default();
        let h = table.register(Box::new(MemChan::new(1)), ChanClass::Memory);
        assert!(table.resolve(h).is_some());
        let stale = ChanHandle { age: h.age + 1, ..h };
        assert!(table.resolve(stale).is_none());
        let out_of_range = ChanHandle { index: 7, ..h };
        assert!(table.resolve(out_of_range).is_none());
    }
}
