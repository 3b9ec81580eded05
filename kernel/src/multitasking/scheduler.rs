//! The scheduler.
//!
//! Priority-based multi-level queue scheduling: 256 run queues, one per
//! priority, with the lower number winning (BSD style). Every thread has a
//! base priority (set by user request) and a current priority (which the
//! kernel may boost, e.g. for priority inheritance). The lowest level is
//! reserved for the idle thread.
//!
//! Threads are preemptible even in kernel mode; a switch happens when a
//! thread blocks, is preempted by a better priority, runs out of quantum,
//! or yields. Thread switching is deferred while the per-thread scheduler
//! lock is held and performed at the outermost `sched_unlock`.
//!
//! Wakeups are two-staged: wake entry points only move threads to the
//! wake queue (legal from ISRs, no requeue storms), and `wakeq_flush`
//! makes them runnable at the next sleep, unlock or switch.

use crate::error::{Errno, Result};
use crate::event::EventId;
use crate::kern::Kernel;
use crate::multitasking::thread::{ThreadId, ThreadState};
use crate::param::{mstohz, PRI_DPC, TIME_SLICE};
use api::{SchedPolicy, PRI_IDLE};
use util::slab::Handle;

/// Why a sleep ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepResult {
    Success,
    Timeout,
    /// The object slept on was deleted.
    Inval,
    /// Interrupted by exception delivery.
    Intr,
    /// The peer went away.
    Break,
}

/// Round-robin quantum in ticks.
pub const QUANTUM: i32 = mstohz(TIME_SLICE) as i32;

pub type DpcId = Handle<Dpc>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DpcState {
    Free,
    Pending,
}

/// A deferred procedure call record. ISRs stamp in the function and
/// argument; the DPC thread runs it later with interrupts enabled. While
/// one is still pending, re-scheduling it only replaces function and
/// argument (last writer wins).
pub struct Dpc {
    pub state: DpcState,
    pub func: Option<fn(&mut Kernel, usize)>,
    pub arg: usize,
}

impl Kernel {
    /// Search for the highest-priority non-empty run queue.
    fn runq_getbest(&self) -> i32 {
        for pri in 0..PRI_IDLE {
            if !self.runq[pri as usize].is_empty() {
                return pri;
            }
        }
        PRI_IDLE
    }

    /// Queue at the tail, and flag a reschedule when the newcomer beats
    /// the running thread.
    fn runq_enqueue(&mut self, t: ThreadId) {
        let pri = self.threads.get(t).unwrap().priority;
        self.runq[pri as usize].push_back(t);
        if pri < self.maxpri {
            self.maxpri = pri;
            self.cur_mut().resched = true;
        }
    }

    /// Put a preempted thread back at the head of its queue so it keeps
    /// its turn within the priority class.
    fn runq_insert(&mut self, t: ThreadId) {
        let pri = self.threads.get(t).unwrap().priority;
        self.runq[pri as usize].push_front(t);
        if pri < self.maxpri {
            self.maxpri = pri;
        }
    }

    fn runq_dequeue(&mut self) -> ThreadId {
        let t = self.runq[self.maxpri as usize]
            .pop_front()
            .expect("runq: maxpri queue empty");
        if self.runq[self.maxpri as usize].is_empty() {
            self.maxpri = self.runq_getbest();
        }
        t
    }

    fn runq_remove(&mut self, t: ThreadId) {
        let pri = self.threads.get(t).unwrap().priority;
        let q = &mut self.runq[pri as usize];
        if let Some(pos) = q.iter().position(|&x| x == t) {
            q.remove(pos);
        }
        self.maxpri = self.runq_getbest();
    }

    /// Make every woken thread runnable.
    pub(crate) fn wakeq_flush(&mut self) {
        while let Some(t) = self.wakeq.pop_front() {
            let tref = self.threads.get_mut(t).unwrap();
            tref.slpevt = None;
            tref.state -= ThreadState::SLEEP;
            let state = tref.state;
            if t != self.curthread && state.is_run() {
                self.runq_enqueue(t);
            }
        }
    }

    /// First wake stage: park the thread on the wake queue and disarm its
    /// sleep timeout. `wakeq_flush` finishes the job.
    fn sched_setrun(&mut self, t: ThreadId) {
        self.wakeq.push_back(t);
        let timeout = self.threads.get(t).unwrap().timeout;
        self.timer_stop(timeout);
    }

    /// The scheduler proper. Preempted threads go back to the head of
    /// their queue, everyone else to the tail.
    pub(crate) fn sched_swtch(&mut self) {
        let prev = self.curthread;
        let prev_state = self.threads.get(prev).unwrap().state;
        if prev_state.is_run() {
            if self.threads.get(prev).unwrap().priority > self.maxpri {
                self.runq_insert(prev); // preemption
            } else {
                self.runq_enqueue(prev);
            }
        }
        self.threads.get_mut(prev).unwrap().resched = false;

        let next = self.runq_dequeue();
        if next == prev {
            return;
        }
        self.curthread = next;

        let prev_task = self.threads.get(prev).unwrap().task;
        let next_task = self.threads.get(next).unwrap().task;
        if prev_task != next_task {
            if let Some(task) = self.tasks.get(next_task) {
                self.vm_switch(task.map);
            }
        }

        let machine = self.machine;
        let (p, n) = self
            .threads
            .get2_mut(prev, next)
            .expect("switch: stale thread");
        machine.context_switch(&mut p.ctx, &mut n.ctx);
    }

    fn sleep_timeout(k: &mut Kernel, arg: usize) {
        if let Some(t) = Handle::decode(arg as u64) {
            k.sched_unsleep(t, SleepResult::Timeout);
        }
    }

    /// Sleep on `event` until woken, for at most `msec` milliseconds when
    /// nonzero. Returns the sleep result set by the waker.
    pub fn sched_tsleep(&mut self, event: EventId, msec: u32) -> SleepResult {
        self.sched_lock();
        let machine = self.machine;
        let s = machine.splhigh();

        let cur = self.curthread;
        {
            let tref = self.threads.get_mut(cur).unwrap();
            tref.slpevt = Some(event);
            tref.state |= ThreadState::SLEEP;
        }
        self.events
            .get_mut(event)
            .expect("tsleep: stale event")
            .sleepq
            .push_back(cur);

        if msec != 0 {
            let timeout = self.threads.get(cur).unwrap().timeout;
            self.timer_callout(timeout, msec, Self::sleep_timeout, cur.encode() as usize);
        }

        self.wakeq_flush();
        self.sched_swtch(); // sleep here until woken

        machine.splx(s);
        self.sched_unlock();
        self.cur().slpret
    }

    /// Sleep with no timeout.
    pub fn sched_sleep(&mut self, event: EventId) -> SleepResult {
        self.sched_tsleep(event, 0)
    }

    /// Wake every thread sleeping on `event`. A woken thread may still be
    /// suspended; it then stays off the run queue until resumed.
    pub fn sched_wakeup(&mut self, event: EventId) {
        self.sched_lock();
        let s = self.machine.splhigh();
        loop {
            let Some(t) = self
                .events
                .get_mut(event)
                .and_then(|e| e.sleepq.pop_front())
            else {
                break;
            };
            self.threads.get_mut(t).unwrap().slpret = SleepResult::Success;
            self.sched_setrun(t);
        }
        self.machine.splx(s);
        self.sched_unlock();
    }

    /// Wake the single best-priority thread sleeping on `event` and
    /// return it.
    pub fn sched_wakeone(&mut self, event: EventId) -> Option<ThreadId> {
        self.sched_lock();
        let s = self.machine.splhigh();
        let top = {
            let threads = &self.threads;
            self.events.get_mut(event).and_then(|ev| {
                let best = ev
                    .sleepq
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, &t)| threads.get(t).unwrap().priority)
                    .map(|(i, _)| i)?;
                ev.sleepq.remove(best)
            })
        };
        if let Some(t) = top {
            self.threads.get_mut(t).unwrap().slpret = SleepResult::Success;
            self.sched_setrun(t);
        }
        self.machine.splx(s);
        self.sched_unlock();
        top
    }

    /// Cancel a specific thread's sleep with the given result.
    pub fn sched_unsleep(&mut self, t: ThreadId, result: SleepResult) {
        self.sched_lock();
        if self
            .threads
            .get(t)
            .map_or(false, |x| x.state.contains(ThreadState::SLEEP))
        {
            let s = self.machine.splhigh();
            // the thread sits either on its event's sleep queue or
            // already on the wake queue; unlink from wherever it is
            if let Some(evt) = self.threads.get(t).unwrap().slpevt {
                if let Some(ev) = self.events.get_mut(evt) {
                    if let Some(pos) = ev.sleepq.iter().position(|&x| x == t) {
                        ev.sleepq.remove(pos);
                    }
                }
            }
            if let Some(pos) = self.wakeq.iter().position(|&x| x == t) {
                self.wakeq.remove(pos);
            }
            self.threads.get_mut(t).unwrap().slpret = result;
            self.sched_setrun(t);
            self.machine.splx(s);
        }
        self.sched_unlock();
    }

    /// Give up the CPU to a same-priority peer, if any.
    pub fn sched_yield(&mut self) {
        self.sched_lock();
        if !self.runq[self.cur().priority as usize].is_empty() {
            self.cur_mut().resched = true;
        }
        self.sched_unlock(); // switch happens here
    }

    /// Called with the scheduler locked.
    pub(crate) fn sched_suspend(&mut self, t: ThreadId) {
        let state = self.threads.get(t).unwrap().state;
        if state.is_run() {
            if t == self.curthread {
                self.cur_mut().resched = true;
            } else {
                self.runq_remove(t);
            }
        }
        self.threads.get_mut(t).unwrap().state |= ThreadState::SUSP;
    }

    /// Called with the scheduler locked.
    pub(crate) fn sched_resume(&mut self, t: ThreadId) {
        let tref = self.threads.get_mut(t).unwrap();
        if tref.state.contains(ThreadState::SUSP) {
            tref.state -= ThreadState::SUSP;
            if tref.state.is_run() {
                self.runq_enqueue(t);
            }
        }
    }

    /// Clock tick accounting; called from the clock ISR once per tick.
    pub(crate) fn sched_tick(&mut self) {
        let cur = self.cur_mut();
        if !cur.state.contains(ThreadState::EXIT) {
            cur.time += 1;
            if cur.policy == SchedPolicy::Rr {
                cur.timeleft -= 1;
                if cur.timeleft <= 0 {
                    // quantum is up; hand out another
                    cur.timeleft += QUANTUM;
                    cur.resched = true;
                }
            }
        }
    }

    /// Prime a new thread for scheduling: runnable but suspended.
    pub(crate) fn sched_start(&mut self, t: ThreadId, pri: i32, policy: SchedPolicy) {
        let tref = self.threads.get_mut(t).unwrap();
        tref.state = ThreadState::SUSP;
        tref.policy = policy;
        tref.priority = pri;
        tref.basepri = pri;
        if policy == SchedPolicy::Rr {
            tref.timeleft = QUANTUM;
        }
    }

    /// Take a thread out of scheduling for good. For the current thread
    /// the lock count is forced to one so the next `sched_unlock` is the
    /// outermost one and must switch away.
    pub(crate) fn sched_stop(&mut self, t: ThreadId) {
        if t == self.curthread {
            let cur = self.cur_mut();
            cur.locks = 1;
            cur.resched = true;
        } else {
            let state = self.threads.get(t).unwrap().state;
            if state.is_run() {
                self.runq_remove(t);
            } else if state.contains(ThreadState::SLEEP) {
                if let Some(evt) = self.threads.get(t).unwrap().slpevt {
                    if let Some(ev) = self.events.get_mut(evt) {
                        if let Some(pos) = ev.sleepq.iter().position(|&x| x == t) {
                            ev.sleepq.remove(pos);
                        }
                    }
                }
                if let Some(pos) = self.wakeq.iter().position(|&x| x == t) {
                    self.wakeq.remove(pos);
                }
            }
        }
        let timeout = self.threads.get(t).unwrap().timeout;
        self.timer_stop(timeout);
        self.threads.get_mut(t).unwrap().state = ThreadState::EXIT;
    }

    /// Lock the scheduler: no thread switch while held. Nests freely.
    pub fn sched_lock(&mut self) {
        self.cur_mut().locks += 1;
    }

    /// Unlock the scheduler; at the outermost level, drain the wake queue
    /// and run any deferred reschedule. Interrupts are let back in
    /// between switches so a wakeup from an ISR during the switch is
    /// picked up here instead of waiting for the next unlock.
    pub fn sched_unlock(&mut self) {
        debug_assert!(self.cur().locks > 0);
        let machine = self.machine;

        let mut s = machine.splhigh();
        if self.cur().locks == 1 {
            self.wakeq_flush();
            while self.cur().resched {
                self.sched_swtch();

                machine.splx(s);
                s = machine.splhigh();
                self.wakeq_flush();
            }
        }
        self.cur_mut().locks -= 1;
        machine.splx(s);
    }

    pub fn sched_getpri(&self, t: ThreadId) -> i32 {
        self.threads.get(t).map_or(PRI_IDLE, |x| x.priority)
    }

    /// Change both priorities of a thread, requeueing as needed. Called
    /// with the scheduler locked.
    pub(crate) fn sched_setpri(&mut self, t: ThreadId, basepri: i32, pri: i32) {
        self.threads.get_mut(t).unwrap().basepri = basepri;

        if t == self.curthread {
            self.threads.get_mut(t).unwrap().priority = pri;
            self.maxpri = self.runq_getbest();
            if pri != self.maxpri {
                self.cur_mut().resched = true;
            }
        } else if self.threads.get(t).unwrap().state.is_run() {
            self.runq_remove(t);
            self.threads.get_mut(t).unwrap().priority = pri;
            self.runq_enqueue(t);
        } else {
            self.threads.get_mut(t).unwrap().priority = pri;
        }
    }

    pub fn sched_getpolicy(&self, t: ThreadId) -> SchedPolicy {
        self.threads.get(t).map_or(SchedPolicy::Fifo, |x| x.policy)
    }

    pub(crate) fn sched_setpolicy(&mut self, t: ThreadId, policy: SchedPolicy) -> Result<()> {
        let tref = self.threads.get_mut(t).ok_or(Errno::ESRCH)?;
        tref.timeleft = QUANTUM;
        tref.policy = policy;
        Ok(())
    }

    /// Create a DPC record for later `sched_dpc` calls.
    pub fn dpc_create(&mut self) -> DpcId {
        self.dpcs.insert(Dpc {
            state: DpcState::Free,
            func: None,
            arg: 0,
        })
    }

    /// Schedule a deferred procedure call. Safe from ISRs: the callback
    /// runs later on the DPC thread with interrupts enabled and the
    /// scheduler unlocked. Re-posting a still-pending DPC only updates
    /// function and argument.
    pub fn sched_dpc(&mut self, dpc: DpcId, func: fn(&mut Kernel, usize), arg: usize) {
        self.sched_lock();
        let s = self.machine.splhigh();
        {
            let d = self.dpcs.get_mut(dpc).expect("sched_dpc: stale dpc");
            d.func = Some(func);
            d.arg = arg;
            if d.state != DpcState::Pending {
                self.dpcq.push_back(dpc);
            }
            d.state = DpcState::Pending;
        }
        self.machine.splx(s);

        self.sched_wakeup(self.dpc_event);
        self.sched_unlock();
    }

    /// Body of the DPC kernel thread.
    pub(crate) fn dpc_thread(arg: usize) {
        let k = unsafe { &mut *(arg as *mut Kernel) };
        let machine = k.machine;
        machine.splhigh();

        loop {
            k.sched_sleep(k.dpc_event);

            while let Some(dpc) = k.dpcq.pop_front() {
                let (func, darg) = {
                    let d = k.dpcs.get_mut(dpc).expect("dpc: stale entry");
                    d.state = DpcState::Free;
                    (d.func.expect("dpc: no function"), d.arg)
                };
                machine.spl0();
                func(k, darg);
                machine.splhigh();
            }
        }
    }

    /// Bring up the scheduler: run queues are already empty; start the
    /// DPC thread.
    pub(crate) fn sched_init(&mut self) {
        self.maxpri = PRI_IDLE;
        self.cur_mut().resched = true;

        let kptr = self as *mut Kernel as usize;
        if self.kthread_create(Self::dpc_thread, kptr, PRI_DPC).is_none() {
            panic!("sched_init");
        }
        log::debug!("time slice is {} msec", TIME_SLICE);
    }
}
