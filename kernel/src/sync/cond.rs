//! Condition variables.
//!
//! Task-owned, first-use initialized like mutexes. `cond_wait` gives up
//! the associated mutex, sleeps, and takes the mutex again before
//! returning, so callers re-check their predicate under the lock.

use crate::error::{Errno, Result};
use crate::event::EventId;
use crate::kern::Kernel;
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::task::TaskId;
use crate::param::MAXSYNCS;
use crate::sync::mutex::MutexId;
use util::slab::Handle;

pub type CondId = Handle<Cond>;

pub struct Cond {
    pub owner: TaskId,
    pub event: EventId,
}

impl Kernel {
    pub fn cond_init(&mut self) -> Result<CondId> {
        self.sched_lock();
        let r = (|| {
            let curtask = self.cur().task;
            if self.tasks.get(curtask).unwrap().nsyncs as usize >= MAXSYNCS {
                return Err(Errno::EAGAIN);
            }
            let event = self.event_create("cond");
            let c = self.conds.insert(Cond {
                owner: curtask,
                event,
            });
            let task = self.tasks.get_mut(curtask).unwrap();
            task.conds.push(c);
            task.nsyncs += 1;
            Ok(c)
        })();
        self.sched_unlock();
        r
    }

    fn cond_deallocate(&mut self, c: CondId) {
        let cref = self.conds.remove(c).unwrap();
        self.event_destroy(cref.event);
        if let Some(task) = self.tasks.get_mut(cref.owner) {
            task.conds.retain(|&x| x != c);
            task.nsyncs -= 1;
        }
    }

    pub fn cond_destroy(&mut self, c: CondId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.cond_valid(c) {
                return Err(Errno::EINVAL);
            }
            if self
                .events
                .get(self.conds.get(c).unwrap().event)
                .unwrap()
                .waiting()
            {
                return Err(Errno::EBUSY);
            }
            self.cond_deallocate(c);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn cond_cleanup(&mut self, task: TaskId) {
        while let Some(&c) = self.tasks.get(task).unwrap().conds.first() {
            self.cond_deallocate(c);
        }
    }

    /// Release `m`, wait for a signal, relock `m`. `EINTR` when an
    /// exception ended the wait; the mutex is still re-acquired first.
    pub fn cond_wait(&mut self, c: CondId, m: MutexId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.cond_valid(c) {
                return Err(Errno::EINVAL);
            }
            let event = self.conds.get(c).unwrap().event;
            self.mutex_unlock(m)?;
            let rc = self.sched_sleep(event);
            let relock = self.mutex_lock(m);
            if rc == SleepResult::Intr {
                return Err(Errno::EINTR);
            }
            relock
        })();
        self.sched_unlock();
        r
    }

    /// Wake the best-priority waiter.
    pub fn cond_signal(&mut self, c: CondId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.cond_valid(c) {
                return Err(Errno::EINVAL);
            }
            let event = self.conds.get(c).unwrap().event;
            self.sched_wakeone(event);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Wake every waiter.
    pub fn cond_broadcast(&mut self, c: CondId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.cond_valid(c) {
                return Err(Errno::EINVAL);
            }
            let event = self.conds.get(c).unwrap().event;
            self.sched_wakeup(event);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    fn cond_valid(&self, c: CondId) -> bool {
        self.conds
            .get(c)
            .map_or(false, |x| x.owner == self.cur().task)
    }
}
