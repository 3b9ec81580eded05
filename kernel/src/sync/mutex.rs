//! Mutexes with priority inheritance.
//!
//! Mutexes are recursive and only meaningful between threads of one
//! task. To keep priority inversion bounded, a blocked locker boosts the
//! holder's current priority to its own, following the chain of holders
//! that are themselves blocked; unlocking recomputes the unlocker's
//! priority from its base and the ceilings of the mutexes it still
//! holds.
//!
//! The kernel-side object is created on first use: the user-side word
//! starts out as the `MUTEX_INITIALIZER` sentinel and is replaced by the
//! kernel handle by the syscall layer.

use crate::error::{Errno, Result};
use crate::event::EventId;
use crate::kern::Kernel;
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::task::TaskId;
use crate::multitasking::thread::ThreadId;
use crate::param::{MAXINHERIT, MAXSYNCS};
use api::MINPRI;
use util::slab::Handle;

pub type MutexId = Handle<Mutex>;

pub struct Mutex {
    pub owner: TaskId,
    pub holder: Option<ThreadId>,
    /// Recursion depth of the holder.
    pub locks: u32,
    /// Ceiling: priority of the best waiter the holder was boosted for,
    /// or of the holder itself when uncontended.
    pub priority: i32,
    pub event: EventId,
}

impl Kernel {
    /// Create a mutex owned by the current task.
    pub fn mutex_init(&mut self) -> Result<MutexId> {
        self.sched_lock();
        let r = (|| {
            let curtask = self.cur().task;
            if self.tasks.get(curtask).unwrap().nsyncs as usize >= MAXSYNCS {
                return Err(Errno::EAGAIN);
            }
            let event = self.event_create("mutex");
            let m = self.mutexes.insert(Mutex {
                owner: curtask,
                holder: None,
                locks: 0,
                priority: MINPRI,
                event,
            });
            let task = self.tasks.get_mut(curtask).unwrap();
            task.mutexes.push(m);
            task.nsyncs += 1;
            Ok(m)
        })();
        self.sched_unlock();
        r
    }

    fn mutex_deallocate(&mut self, m: MutexId) {
        let mref = self.mutexes.remove(m).unwrap();
        self.event_destroy(mref.event);
        if let Some(task) = self.tasks.get_mut(mref.owner) {
            task.mutexes.retain(|&x| x != m);
            task.nsyncs -= 1;
        }
    }

    /// Destroy an unlocked, unawaited mutex.
    pub fn mutex_destroy(&mut self, m: MutexId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.mutex_valid(m) {
                return Err(Errno::EINVAL);
            }
            let mref = self.mutexes.get(m).unwrap();
            if mref.holder.is_some() || self.events.get(mref.event).unwrap().waiting() {
                return Err(Errno::EBUSY);
            }
            self.mutex_deallocate(m);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Free the remaining mutexes of a dying task.
    pub(crate) fn mutex_cleanup(&mut self, task: TaskId) {
        while let Some(&m) = self.tasks.get(task).unwrap().mutexes.first() {
            self.mutex_deallocate(m);
        }
    }

    /// Lock, blocking while someone else holds the mutex. `EINTR` when
    /// an exception cut the wait short (the user library retries), and
    /// `EDEADLK` when the wait would close a cycle of holders.
    pub fn mutex_lock(&mut self, m: MutexId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.mutex_valid(m) {
                return Err(Errno::EINVAL);
            }
            let cur = self.curthread;
            let holder = self.mutexes.get(m).unwrap().holder;

            if holder == Some(cur) {
                let mref = self.mutexes.get_mut(m).unwrap();
                mref.locks += 1;
                debug_assert!(mref.locks != 0);
                return Ok(());
            }
            if holder.is_none() {
                let pri = self.cur().priority;
                self.mutexes.get_mut(m).unwrap().priority = pri;
            } else {
                self.cur_mut().mutex_waiting = Some(m);
                if let Err(e) = self.prio_inherit(cur) {
                    self.cur_mut().mutex_waiting = None;
                    return Err(e);
                }
                let event = self.mutexes.get(m).unwrap().event;
                let rc = self.sched_sleep(event);
                self.cur_mut().mutex_waiting = None;
                if rc == SleepResult::Intr {
                    // unless the unlock path already handed the mutex
                    // over to us, give up and let the caller retry
                    if self.mutexes.get(m).map_or(true, |x| x.holder != Some(cur)) {
                        return Err(Errno::EINTR);
                    }
                }
            }
            let mref = self.mutexes.get_mut(m).unwrap();
            mref.locks = 1;
            mref.holder = Some(cur);
            let held = &mut self.cur_mut().mutexes;
            if !held.contains(&m) {
                held.push(m);
            }
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Non-blocking lock attempt.
    pub fn mutex_trylock(&mut self, m: MutexId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.mutex_valid(m) {
                return Err(Errno::EINVAL);
            }
            let cur = self.curthread;
            let mref = self.mutexes.get_mut(m).unwrap();
            match mref.holder {
                Some(h) if h == cur => {
                    mref.locks += 1;
                    debug_assert!(mref.locks != 0);
                    Ok(())
                }
                Some(_) => Err(Errno::EBUSY),
                None => {
                    mref.locks = 1;
                    mref.holder = Some(cur);
                    self.cur_mut().mutexes.push(m);
                    Ok(())
                }
            }
        })();
        self.sched_unlock();
        r
    }

    /// Unlock; the holder's inherited priority is recomputed and the
    /// best waiter, if any, becomes the new holder.
    pub fn mutex_unlock(&mut self, m: MutexId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.mutex_valid(m) {
                return Err(Errno::EINVAL);
            }
            let cur = self.curthread;
            {
                let mref = self.mutexes.get(m).unwrap();
                if mref.holder != Some(cur) || mref.locks == 0 {
                    return Err(Errno::EPERM);
                }
            }
            let mref = self.mutexes.get_mut(m).unwrap();
            mref.locks -= 1;
            if mref.locks == 0 {
                self.cur_mut().mutexes.retain(|&x| x != m);
                self.prio_uninherit(cur);

                let event = self.mutexes.get(m).unwrap().event;
                let next = self.sched_wakeone(event);
                if let Some(h) = next {
                    self.threads.get_mut(h).unwrap().mutex_waiting = None;
                }
                let pri = next.map_or(MINPRI, |h| self.threads.get(h).unwrap().priority);
                let mref = self.mutexes.get_mut(m).unwrap();
                mref.holder = next;
                mref.priority = pri;
            }
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Release everything a terminating thread still holds. Ownership of
    /// each mutex passes to its best waiter as-is; no priority chains
    /// are adjusted for a dying thread.
    pub(crate) fn mutex_cancel(&mut self, t: ThreadId) {
        while let Some(m) = self.threads.get_mut(t).unwrap().mutexes.pop() {
            let Some(mref) = self.mutexes.get_mut(m) else {
                continue;
            };
            mref.locks = 0;
            let event = mref.event;
            let next = self.sched_wakeone(event);
            if let Some(h) = next {
                self.threads.get_mut(h).unwrap().mutex_waiting = None;
                self.mutexes.get_mut(m).unwrap().locks = 1;
            }
            self.mutexes.get_mut(m).unwrap().holder = next;
        }
    }

    /// Re-run inheritance before a user-requested priority change, so a
    /// boosted holder keeps up with its best waiter.
    pub(crate) fn mutex_setpri(&mut self, t: ThreadId, pri: i32) {
        let tref = self.threads.get(t).unwrap();
        if tref.mutex_waiting.is_some() && pri < tref.priority {
            let _ = self.prio_inherit(t);
        }
    }

    fn mutex_valid(&self, m: MutexId) -> bool {
        self.mutexes
            .get(m)
            .map_or(false, |x| x.owner == self.cur().task)
    }

    /// Walk the chain of mutex holders starting at what `waiter` blocks
    /// on, boosting every holder below the waiter's priority. Fails with
    /// `EDEADLK` when the chain comes back around to the waiter.
    fn prio_inherit(&mut self, waiter: ThreadId) -> Result<()> {
        let waiter_pri = self.threads.get(waiter).unwrap().priority;
        let mut m = self.threads.get(waiter).unwrap().mutex_waiting;
        let mut count = 0;

        while let Some(mid) = m {
            let holder = self
                .mutexes
                .get(mid)
                .and_then(|x| x.holder)
                .expect("prio_inherit: contended mutex without holder");
            if holder == waiter {
                log::debug!("deadlock: mutex={:?} waiter={:?}", mid, waiter);
                return Err(Errno::EDEADLK);
            }
            let (hpri, hbase) = {
                let h = self.threads.get(holder).unwrap();
                (h.priority, h.basepri)
            };
            if hpri > waiter_pri {
                self.sched_setpri(holder, hbase, waiter_pri);
                self.mutexes.get_mut(mid).unwrap().priority = waiter_pri;
            }
            m = self.threads.get(holder).unwrap().mutex_waiting;

            count += 1;
            debug_assert!(count < MAXINHERIT);
            if count >= MAXINHERIT {
                break;
            }
        }
        Ok(())
    }

    /// After a release: back to the base priority, or to the strongest
    /// ceiling among the mutexes still held.
    fn prio_uninherit(&mut self, t: ThreadId) {
        let tref = self.threads.get(t).unwrap();
        if tref.priority == tref.basepri {
            return;
        }
        let mut maxpri = tref.basepri;
        for &m in &tref.mutexes {
            let pri = self.mutexes.get(m).unwrap().priority;
            if pri < maxpri {
                maxpri = pri;
            }
        }
        let basepri = self.threads.get(t).unwrap().basepri;
        self.sched_setpri(t, basepri, maxpri);
    }
}
