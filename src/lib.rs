// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Corio
//!
//! Cooperative, coroutine-based concurrency for Rust, modeled after CSP.
//!
//! Corio runs stackful coroutines (aka green threads) on a single OS
//! thread and switches between them at blocking points: channel
//! operations, timers, socket readiness, named events, or waits on other
//! coroutines. Coroutines should not perform native blocking IO; the
//! [`tcp`] and [`file`] modules provide cooperative replacements that park
//! only the calling coroutine.
//!
//! # Features:
//!
//! ```norust
//! * typed bounded channels with FIFO wakeup (see `Channel`);
//! * timer channels (see `every()` and `after()`);
//! * a unified multi-event wait (see `wait()`) and a `choose` combinator;
//! * named latched events with broadcast wakeup (see `create_event()`);
//! * coroutine join and exit notification (see `join()` / `wait_all()`);
//! * non-blocking TCP and cooperative file IO.
//! ```
//!
//! # Example:
//!
//! ```no_run
//! let numbers = corio::Channel::<u32>::create(3);
//! corio::start(move || {
//!     for n in 0..5 {
//!         numbers.push(n);
//!     }
//!     numbers.close();
//! });
//! corio::run(move || {
//!     while let Some(n) = numbers.pull() {
//!         println!("got {}", n);
//!     }
//! });
//! ```
//!
//! The embedder either drives the scheduler manually with
//! [`execute_actives`] or lets [`run`] loop until every coroutine is done.
//! All of the API is strictly single-threaded: each OS thread owns an
//! independent runtime, and nothing here may be called across threads.

#![warn(missing_docs)]

use std::panic;
use std::sync::Once;

use log::trace;

mod channel;
mod choose;
mod coroutine;
mod event;
mod list;
mod poller;
mod runtime;
mod wait;

/// Cooperative file IO helpers.
pub mod file;
/// Non-blocking TCP IO.
pub mod tcp;
/// Clock helpers; also home of the timer wheel.
pub mod timer;

pub use channel::{
    after, close_channel, every, is_channel, pull_discard, ChanHandle, Channel, TimerChannel,
};
pub use choose::{
    choose, if_can_pull, if_can_push, if_can_read, if_timeout, if_timer_fires, ChooseArm,
    IfCanPull, IfCanPush, IfCanRead, IfTimeout, IfTimerFires,
};
pub use coroutine::Handle;
pub use event::{
    clear_event, create_event, destroy_event, is_event_set, is_valid_event, set_event, EventId,
};
pub use runtime::{execute_actives, num_loops};
pub use wait::{join, sleep, wait, wait_all, wait_event, wait_while, WatchedEvent};

use coroutine::{resume_slot, ExitRequest};
use runtime::with_rt;

#[cfg(test)]
mod tests;

/// Spawn a coroutine.
///
/// When called from outside any coroutine the new one is resumed
/// immediately and runs until its first blocking point. When called from
/// inside a coroutine it is only registered; it first runs on a later
/// scheduler iteration, never pre-empting the caller.
pub fn start<F>(f: F) -> Handle
where
    F: FnOnce() + 'static,
{
    let (handle, slot, run_now) = with_rt(|rt| {
        let slot = rt.coros.find_free();
        let born = rt.num_loops;
        let run_now = rt.coros.by_handle(rt.current).is_none();
        let co = rt.coros.slot_mut(slot);
        co.boot = Some(Box::new(f));
        co.born_loop = born;
        co.reset_ip();
        (co.handle, slot, run_now)
    });
    trace!("co[{}]: started (handle {:08x})", slot, handle.as_u32());
    if run_now {
        resume_slot(slot);
    }
    handle
}

/// Spawn a coroutine and drive the scheduler until no coroutine is left.
pub fn run<F>(f: F)
where
    F: FnOnce() + 'static,
{
    start(f);
    while execute_actives() > 0 {}
}

/// Handle of the coroutine currently executing, or [`Handle::NONE`] when
/// the scheduler itself (or plain embedder code) is running.
pub fn current() -> Handle {
    with_rt(|rt| rt.current)
}

/// Does `h` still refer to a live coroutine?
pub fn is_handle(h: Handle) -> bool {
    with_rt(|rt| rt.coros.by_handle(h).is_some())
}

/// Is the caller running inside a coroutine?
pub fn in_coroutine() -> bool {
    is_handle(current())
}

/// Give the scheduler a turn without blocking on anything. The caller is
/// resumed on the next iteration's pass over its slot.
pub fn yield_now() {
    let slot = with_rt(|rt| {
        let h = rt.current;
        assert!(
            rt.coros.by_handle(h).is_some(),
            "yield_now() called outside of a coroutine"
        );
        h.id as usize
    });
    coroutine::jump_out(slot);
}

static SILENCE_EXIT: Once = Once::new();

/// Keep the default panic hook quiet about the sentinel payload that
/// `exit_co` uses to unwind its own stack.
fn silence_exit_panics() {
    SILENCE_EXIT.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitRequest>().is_none() {
                prev(info);
            }
        }));
    });
}

/// Terminate the coroutine behind `h`. A no-op for stale handles.
///
/// Terminating the current coroutine unwinds its stack (running `Drop`s)
/// and does not return. Terminating another coroutine detaches it from
/// every wait source, frees its slot for reuse and wakes everything joined
/// on it, exactly as if it had returned.
pub fn exit_co(h: Handle) {
    let is_current = with_rt(|rt| h != Handle::NONE && rt.current == h);
    if is_current {
        silence_exit_panics();
        panic::panic_any(ExitRequest);
    }
    with_rt(|rt| {
        if rt.coros.by_handle(h).is_none() {
            return;
        }
        trace!("co[{}]: terminated externally", h.id);
        let slot = h.id as usize;
        rt.unregister_watches(slot);
        rt.coros.mark_free(slot);
        rt.wake_waiters_of(slot);
    });
}
