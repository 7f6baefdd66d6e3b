//! Coroutine records, handles and the context-switch machinery.
//!
//! Each coroutine owns a fixed-size guarded stack and a pair of saved
//! machine contexts: `ip` resumes the coroutine, `caller` returns control to
//! whoever resumed it. Slots are recycled through a free list; every recycle
//! bumps the slot's `age` so outstanding handles go stale instead of
//! dangling.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use log::{error, trace};

use crate::list::WaitList;
use crate::runtime::with_rt;
use crate::wait::EventKind;

/// Default per-coroutine stack size. Stacks are retained across slot reuse.
const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Generation-tagged identifier of a coroutine slot.
///
/// A handle stays comparable and copyable after the coroutine ends; it
/// simply stops resolving. `Handle::NONE` is the "outside any coroutine"
/// sentinel returned by [`current`](crate::current).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    pub(crate) id: u16,
    pub(crate) age: u16,
}

impl Handle {
    /// The "no coroutine" sentinel. Never resolves to a live coroutine.
    pub const NONE: Handle = Handle { id: 0, age: 0 };

    /// Full bit pattern, handy for logs and diagnostics.
    pub fn as_u32(self) -> u32 {
        (self.age as u32) << 16 | self.id as u32
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Uninitialized,
    Running,
    WaitingForCondition,
    WaitingForEvent,
    Free,
}

impl State {
    /// Does this state count towards `execute_actives`' return value?
    pub fn is_active(self) -> bool {
        matches!(
            self,
            State::Running | State::WaitingForCondition | State::WaitingForEvent
        )
    }
}

/// Panic payload used by `exit_co(current())` to unwind the coroutine stack
/// before running the normal epilogue.
pub(crate) struct ExitRequest;

pub(crate) struct Coro {
    pub state: State,
    pub handle: Handle,
    /// Predicate of a condition wait; re-evaluated once per iteration.
    pub must_wait: Option<Box<dyn FnMut() -> bool>>,
    /// Coroutines blocked until this one ends.
    pub waiting_for_me: WaitList,
    /// Index of the watched record that took us out of WaitingForEvent.
    pub woken_by: Option<usize>,
    /// Kinds registered by the wait in progress, by record index.
    pub watched: Vec<EventKind>,
    /// `num_loops` value when the slot was (re)started; a coroutine never
    /// runs in the iteration that started it.
    pub born_loop: u64,
    pub boot: Option<Box<dyn FnOnce()>>,
    stack: ProtectedFixedSizeStack,
    ip: Option<Context>,
    caller: Option<Context>,
}

impl Coro {
    fn new(handle: Handle) -> Coro {
        let stack = ProtectedFixedSizeStack::new(DEFAULT_STACK_SIZE)
            .expect("failed to allocate a coroutine stack");
        Coro {
            state: State::Uninitialized,
            handle,
            must_wait: None,
            waiting_for_me: WaitList::new(),
            woken_by: None,
            watched: Vec::new(),
            born_loop: 0,
            boot: None,
            stack,
            ip: None,
            caller: None,
        }
    }

    /// Arm the slot to run its boot function from the top of the stack on
    /// the next resume.
    pub fn reset_ip(&mut self) {
        self.ip = Some(unsafe { Context::new(&self.stack, coroutine_entry) });
    }
}

/// Slot table plus the LIFO free list. Ages only ever go up.
#[derive(Default)]
pub(crate) struct CoroTable {
    slots: Vec<Coro>,
    free: Vec<Handle>,
}

impl CoroTable {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, i: usize) -> &Coro {
        &self.slots[i]
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut Coro {
        &mut self.slots[i]
    }

    /// Resolve a handle to a live coroutine. Free slots and stale ages both
    /// come back as `None`.
    pub fn by_handle(&self, h: Handle) -> Option<&Coro> {
        let co = self.slots.get(h.id as usize)?;
        if co.handle.age != h.age || co.state == State::Free {
            return None;
        }
        Some(co)
    }

    pub fn by_handle_mut(&mut self, h: Handle) -> Option<&mut Coro> {
        let co = self.slots.get_mut(h.id as usize)?;
        if co.handle.age != h.age || co.state == State::Free {
            return None;
        }
        Some(co)
    }

    /// Pick a recycled slot or grow the table; the returned slot is RUNNING
    /// and keeps whatever stack it already had.
    pub fn find_free(&mut self) -> usize {
        if let Some(h) = self.free.pop() {
            let slot = h.id as usize;
            let co = &mut self.slots[slot];
            debug_assert_eq!(co.handle, h);
            debug_assert_eq!(co.state, State::Free);
            co.state = State::Running;
            return slot;
        }
        let slot = self.slots.len();
        assert!(slot < u16::MAX as usize, "coroutine table exhausted");
        let mut co = Coro::new(Handle { id: slot as u16, age: 1 });
        co.state = State::Running;
        self.slots.push(co);
        slot
    }

    /// Retire the slot: bump the age (stale handles stop resolving), drop
    /// per-run state and queue the slot for reuse. The stack is kept.
    pub fn mark_free(&mut self, slot: usize) {
        let co = &mut self.slots[slot];
        debug_assert_ne!(co.state, State::Free);
        co.handle.age = co.handle.age.wrapping_add(1);
        co.state = State::Free;
        co.boot = None;
        co.must_wait = None;
        co.woken_by = None;
        co.watched.clear();
        co.ip = None;
        self.free.push(co.handle);
    }
}

/// First frame of every coroutine: record the caller context, run the boot
/// function, then fall through to the epilogue whatever the outcome.
extern "C" fn coroutine_entry(t: Transfer) -> ! {
    let slot = t.data;
    let boot = with_rt(|rt| {
        let co = rt.coros.slot_mut(slot);
        co.caller = Some(t.context);
        co.boot.take()
    })
    .expect("coroutine resumed without a boot function");

    trace!("co[{}]: boot", slot);
    match panic::catch_unwind(AssertUnwindSafe(boot)) {
        Ok(()) => {}
        Err(payload) if payload.is::<ExitRequest>() => {
            trace!("co[{}]: terminated via exit_co", slot);
        }
        Err(payload) => {
            error!("co[{}]: panicked: {}", slot, payload_msg(&payload));
            with_rt(|rt| {
                if rt.pending_panic.is_none() {
                    rt.pending_panic = Some(payload);
                }
            });
        }
    }
    epilogue(slot)
}

fn payload_msg(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string payload>"
    }
}

/// Normal end of life: free the slot, wake everyone joined on us and jump
/// back to the scheduler context for good.
pub(crate) fn epilogue(slot: usize) -> ! {
    trace!("co[{}]: epilogue", slot);
    let caller = with_rt(|rt| {
        rt.coros.mark_free(slot);
        rt.wake_waiters_of(slot);
        rt.current = Handle::NONE;
        rt.coros
            .slot_mut(slot)
            .caller
            .take()
            .expect("epilogue without a caller context")
    });
    unsafe {
        caller.resume(0);
    }
    unreachable!("a finished coroutine was resumed");
}

/// Transfer control into the coroutine in `slot` and park the returned
/// scheduler-side continuation back into the record.
pub(crate) fn resume_slot(slot: usize) {
    let ctx = with_rt(|rt| {
        let co = rt.coros.slot_mut(slot);
        rt.current = co.handle;
        co.ip.take().expect("resume without a saved context")
    });
    trace!("co[{}]: resume", slot);
    let t = unsafe { ctx.resume(slot) };
    with_rt(|rt| {
        debug_assert_eq!(rt.current, Handle::NONE);
        rt.coros.slot_mut(slot).ip = Some(t.context);
    });
}

/// Return control to whoever resumed the coroutine in `slot`; comes back
/// once the coroutine is resumed again.
pub(crate) fn jump_out(slot: usize) {
    let caller = with_rt(|rt| {
        rt.current = Handle::NONE;
        rt.coros
            .slot_mut(slot)
            .caller
            .take()
            .expect("yield from a coroutine that was never resumed")
    });
    let t = unsafe { caller.resume(0) };
    with_rt(|rt| {
        rt.coros.slot_mut(slot).caller = Some(t.context);
    });
}
