//! Counting semaphores.

use crate::error::{Errno, Result};
use crate::event::EventId;
use crate::kern::Kernel;
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::task::TaskId;
use crate::param::MAXSYNCS;
use util::slab::Handle;

pub type SemId = Handle<Sem>;

/// Largest value a semaphore can count up to.
pub const MAXSEMVAL: u32 = i32::MAX as u32;

pub struct Sem {
    pub owner: TaskId,
    pub value: u32,
    pub event: EventId,
}

impl Kernel {
    pub fn sem_init(&mut self, value: u32) -> Result<SemId> {
        if value > MAXSEMVAL {
            return Err(Errno::EINVAL);
        }
        self.sched_lock();
        let r = (|| {
            let curtask = self.cur().task;
            if self.tasks.get(curtask).unwrap().nsyncs as usize >= MAXSYNCS {
                return Err(Errno::EAGAIN);
            }
            let event = self.event_create("sem");
            let s = self.sems.insert(Sem {
                owner: curtask,
                value,
                event,
            });
            let task = self.tasks.get_mut(curtask).unwrap();
            task.sems.push(s);
            task.nsyncs += 1;
            Ok(s)
        })();
        self.sched_unlock();
        r
    }

    fn sem_deallocate(&mut self, s: SemId) {
        let sref = self.sems.remove(s).unwrap();
        self.event_destroy(sref.event);
        if let Some(task) = self.tasks.get_mut(sref.owner) {
            task.sems.retain(|&x| x != s);
            task.nsyncs -= 1;
        }
    }

    pub fn sem_destroy(&mut self, s: SemId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.sem_valid(s) {
                return Err(Errno::EINVAL);
            }
            if self
                .events
                .get(self.sems.get(s).unwrap().event)
                .unwrap()
                .waiting()
            {
                return Err(Errno::EBUSY);
            }
            self.sem_deallocate(s);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn sem_cleanup(&mut self, task: TaskId) {
        while let Some(&s) = self.tasks.get(task).unwrap().sems.first() {
            self.sem_deallocate(s);
        }
    }

    /// P operation: take one unit, sleeping while the count is zero.
    pub fn sem_wait(&mut self, s: SemId) -> Result<()> {
        self.sched_lock();
        let r = (|| loop {
            if !self.sem_valid(s) {
                return Err(Errno::EINVAL);
            }
            let sref = self.sems.get_mut(s).unwrap();
            if sref.value > 0 {
                sref.value -= 1;
                return Ok(());
            }
            let event = sref.event;
            let rc = self.sched_sleep(event);
            if rc == SleepResult::Intr {
                return Err(Errno::EINTR);
            }
        })();
        self.sched_unlock();
        r
    }

    /// Non-blocking P: `EAGAIN` when the count is zero.
    pub fn sem_trywait(&mut self, s: SemId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.sem_valid(s) {
                return Err(Errno::EINVAL);
            }
            let sref = self.sems.get_mut(s).unwrap();
            if sref.value == 0 {
                return Err(Errno::EAGAIN);
            }
            sref.value -= 1;
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// V operation: add one unit and wake the best-priority waiter.
    pub fn sem_post(&mut self, s: SemId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.sem_valid(s) {
                return Err(Errno::EINVAL);
            }
            let sref = self.sems.get_mut(s).unwrap();
            if sref.value >= MAXSEMVAL {
                return Err(Errno::EAGAIN);
            }
            sref.value += 1;
            let event = sref.event;
            self.sched_wakeone(event);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub fn sem_getvalue(&mut self, s: SemId) -> Result<u32> {
        self.sched_lock();
        let r = self
            .sems
            .get(s)
            .filter(|x| x.owner == self.cur().task)
            .map(|x| x.value)
            .ok_or(Errno::EINVAL);
        self.sched_unlock();
        r
    }

    fn sem_valid(&self, s: SemId) -> bool {
        self.sems
            .get(s)
            .map_or(false, |x| x.owner == self.cur().task)
    }
}
