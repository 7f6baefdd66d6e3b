//! Named events: latched booleans with broadcast wakeup.
//!
//! An event stays set until cleared. Setting an already-set event is a
//! wake-wise no-op: new waiters took the fast path, so the waiter list is
//! already empty. Ids are handed out once and never reused.

use std::collections::HashMap;
use std::mem;

use log::{trace, warn};

use crate::list::{WaitList, Waiter};
use crate::runtime::with_rt;

/// Identifier of a named event. Stale ids simply stop validating.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventId(u32);

struct EventRecord {
    value: bool,
    name: Option<&'static str>,
    waiters: WaitList,
}

pub(crate) struct EventTable {
    records: HashMap<u32, EventRecord>,
    next_id: u32,
}

impl Default for EventTable {
    fn default() -> Self {
        EventTable { records: HashMap::new(), next_id: 1 }
    }
}

impl EventTable {
    pub fn is_set(&self, id: EventId) -> bool {
        self.records.get(&id.0).map_or(false, |r| r.value)
    }

    pub fn attach(&mut self, id: EventId, w: Waiter) {
        match self.records.get_mut(&id.0) {
            Some(r) => r.waiters.append(w),
            None => warn!("wait on a destroyed or invalid event {:?}", id),
        }
    }

    pub fn detach(&mut self, id: EventId, w: Waiter) {
        if let Some(r) = self.records.get_mut(&id.0) {
            r.waiters.detach(w);
        }
    }
}

/// Create a named event, optionally latched from the start.
pub fn create_event(initial_value: bool, debug_name: Option<&'static str>) -> EventId {
    with_rt(|rt| {
        let id = rt.events.next_id;
        rt.events.next_id += 1;
        rt.events.records.insert(
            id,
            EventRecord { value: initial_value, name: debug_name, waiters: WaitList::new() },
        );
        trace!("event {} ({:?}) created", id, debug_name);
        EventId(id)
    })
}

/// Latch the event true and wake every waiter registered so far. Returns
/// `false` for an unknown id.
pub fn set_event(id: EventId) -> bool {
    with_rt(|rt| {
        let Some(r) = rt.events.records.get_mut(&id.0) else {
            return false;
        };
        r.value = true;
        let mut waiters = mem::take(&mut r.waiters);
        trace!("event {} ({:?}) set", id.0, r.name);
        while let Some(w) = waiters.detach_first() {
            rt.wake(w);
        }
        true
    })
}

/// Latch the event false. Pending waiters are unaffected.
pub fn clear_event(id: EventId) -> bool {
    with_rt(|rt| match rt.events.records.get_mut(&id.0) {
        Some(r) => {
            r.value = false;
            true
        }
        None => false,
    })
}

/// Current latched value; `false` for an unknown id.
pub fn is_event_set(id: EventId) -> bool {
    with_rt(|rt| rt.events.is_set(id))
}

/// Remove the event, waking anything still blocked on it first.
pub fn destroy_event(id: EventId) -> bool {
    with_rt(|rt| {
        let Some(mut r) = rt.events.records.remove(&id.0) else {
            return false;
        };
        trace!("event {} ({:?}) destroyed", id.0, r.name);
        while let Some(w) = r.waiters.detach_first() {
            rt.wake(w);
        }
        true
    })
}

/// Does the id still refer to a live event?
pub fn is_valid_event(id: EventId) -> bool {
    with_rt(|rt| rt.events.records.contains_key(&id.0))
}
