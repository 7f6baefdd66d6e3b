//! Multiway wait with per-arm callbacks.
//!
//! Each arm knows how to describe the event it waits for and how to perform
//! its action once that event fires. [`choose`] is a thin layer over
//! [`wait`](crate::wait): declare every arm's event, wait for the first one,
//! run the matching arm. Arms are user-extensible; anything implementing
//! [`ChooseArm`] can sit in the set.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::{Channel, TimerChannel};
use crate::tcp::TcpStream;
use crate::wait::{wait, WatchedEvent};

/// One alternative of a multiway wait.
pub trait ChooseArm {
    /// Describe the event this arm is waiting for.
    fn declare_event(&mut self) -> WatchedEvent;
    /// Attempt the arm's action after its event fired. Returning `false`
    /// means the world changed between wake and run (typically a channel
    /// closing) and the whole `choose` reports failure.
    fn run(&mut self) -> bool;
}

/// Wait until one of `arms` is ready, run it, and return its index.
///
/// Returns `None` when the fired arm's action fails. Like the underlying
/// `wait`, an arm that is ready from the start wins by position without the
/// others being consulted.
pub fn choose(arms: &mut [&mut dyn ChooseArm]) -> Option<usize> {
    assert!(!arms.is_empty(), "choose() needs at least one arm");
    let events: Vec<WatchedEvent> = arms.iter_mut().map(|a| a.declare_event()).collect();
    let fired = wait(&events)?;
    if arms[fired].run() {
        Some(fired)
    } else {
        None
    }
}

/// Arm: pull one element from `chan` and hand it to `cb`.
pub struct IfCanPull<T, F> {
    chan: Channel<T>,
    cb: F,
}

/// Build an [`IfCanPull`] arm.
pub fn if_can_pull<T: 'static, F: FnMut(T)>(chan: Channel<T>, cb: F) -> IfCanPull<T, F> {
    IfCanPull { chan, cb }
}

impl<T: 'static, F: FnMut(T)> ChooseArm for IfCanPull<T, F> {
    fn declare_event(&mut self) -> WatchedEvent {
        WatchedEvent::can_pull(self.chan.handle())
    }
    fn run(&mut self) -> bool {
        match self.chan.pull() {
            Some(v) => {
                (self.cb)(v);
                true
            }
            None => false,
        }
    }
}

/// Arm: push a pending value into `chan`, then notify `cb`.
pub struct IfCanPush<T, F> {
    chan: Channel<T>,
    value: Option<T>,
    cb: F,
}

/// Build an [`IfCanPush`] arm holding `value` until the channel has room.
pub fn if_can_push<T: 'static, F: FnMut()>(chan: Channel<T>, value: T, cb: F) -> IfCanPush<T, F> {
    IfCanPush { chan, value: Some(value), cb }
}

impl<T: 'static, F: FnMut()> ChooseArm for IfCanPush<T, F> {
    fn declare_event(&mut self) -> WatchedEvent {
        WatchedEvent::can_push(self.chan.handle())
    }
    fn run(&mut self) -> bool {
        match self.value.take() {
            Some(v) => {
                if self.chan.push(v) {
                    (self.cb)();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

/// Arm: the socket became readable. The callback does the actual read.
pub struct IfCanRead<F> {
    fd: RawFd,
    cb: F,
}

/// Build an [`IfCanRead`] arm for an open stream.
pub fn if_can_read<F: FnMut()>(sock: &TcpStream, cb: F) -> IfCanRead<F> {
    IfCanRead { fd: sock.raw_fd().expect("socket is closed"), cb }
}

impl<F: FnMut()> ChooseArm for IfCanRead<F> {
    fn declare_event(&mut self) -> WatchedEvent {
        WatchedEvent::can_read(self.fd)
    }
    fn run(&mut self) -> bool {
        (self.cb)();
        true
    }
}

/// Arm: a timer channel's next tick. `cb` receives the firing timestamp.
pub struct IfTimerFires<F> {
    timer: TimerChannel,
    cb: F,
}

/// Build an [`IfTimerFires`] arm.
pub fn if_timer_fires<F: FnMut(Instant)>(timer: TimerChannel, cb: F) -> IfTimerFires<F> {
    IfTimerFires { timer, cb }
}

impl<F: FnMut(Instant)> ChooseArm for IfTimerFires<F> {
    fn declare_event(&mut self) -> WatchedEvent {
        match self.timer.next_deadline() {
            Some(deadline) => WatchedEvent::timeout_at(deadline),
            // Closed already: a pull wait on a closed channel is instantly
            // ready, so `run` reports the failure right away.
            None => WatchedEvent::can_pull(self.timer.handle()),
        }
    }
    fn run(&mut self) -> bool {
        match self.timer.pull() {
            Some(ts) => {
                (self.cb)(ts);
                true
            }
            None => false,
        }
    }
}

/// Arm: a one-shot timeout relative to the `choose` call.
pub struct IfTimeout<F> {
    delta: Duration,
    cb: F,
}

/// Build an [`IfTimeout`] arm.
pub fn if_timeout<F: FnMut()>(delta: Duration, cb: F) -> IfTimeout<F> {
    IfTimeout { delta, cb }
}

impl<F: FnMut()> ChooseArm for IfTimeout<F> {
    fn declare_event(&mut self) -> WatchedEvent {
        WatchedEvent::timeout(self.delta)
    }
    fn run(&mut self) -> bool {
        (self.cb)();
        true
    }
}
