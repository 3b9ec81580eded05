//! Events: named sleep/wake rendezvous points.
//!
//! An event is nothing but a name (for diagnostics) and a queue of sleeping
//! threads. All blocking in the kernel goes through an event: the scheduler
//! parks threads on `Event::sleepq` in `sched_tsleep` and the wake entry
//! points move them out again.

use crate::multitasking::thread::ThreadId;
use alloc::collections::VecDeque;
use util::slab::Handle;

pub type EventId = Handle<Event>;

pub struct Event {
    pub name: &'static str,
    pub sleepq: VecDeque<ThreadId>,
}

impl Event {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sleepq: VecDeque::new(),
        }
    }

    pub fn waiting(&self) -> bool {
        !self.sleepq.is_empty()
    }
}

impl crate::kern::Kernel {
    pub fn event_create(&mut self, name: &'static str) -> EventId {
        self.events.insert(Event::new(name))
    }

    /// Tear down an event. A thread still queued on it keeps a stale
    /// handle and is unlinked safely by whatever wakes or stops it.
    pub fn event_destroy(&mut self, evt: EventId) {
        self.events.remove(evt);
    }
}
