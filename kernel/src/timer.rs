//! Kernel timer services.
//!
//! Active timers sit in a single list sorted by expiration tick. The
//! clock ISR bumps `lbolt`, detaches whatever has expired, re-arms
//! periodic timers in place, and shunts one-shots onto the expired list
//! for the timer thread, which runs the callouts at thread level with
//! interrupts enabled. Tick comparisons use a signed difference so that
//! `lbolt` wrapping is harmless.

use crate::error::{Errno, Result};
use crate::event::EventId;
use crate::kern::Kernel;
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::thread::ThreadId;
use crate::param::{hztoms, mstohz, HZ};
use api::{TimerInfo, EXC_ALRM, PRI_IDLE};
use util::slab::Handle;

pub type TimerId = Handle<Timer>;

pub type TimerFn = fn(&mut Kernel, usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Stop,
    Active,
}

pub struct Timer {
    pub expire: u32,
    /// Re-arm interval in ticks; zero for one-shot timers.
    pub interval: u32,
    pub state: TimerState,
    pub func: Option<TimerFn>,
    pub arg: usize,
    /// Signalled on each period of a periodic timer.
    pub event: Option<EventId>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            expire: 0,
            interval: 0,
            state: TimerState::Stop,
            func: None,
            arg: 0,
            event: None,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// `a` is strictly before `b` in tick time, wrap tolerated.
pub fn time_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

impl Kernel {
    /// Remaining ticks until `expire`; zero if already past.
    fn time_remain(&self, expire: u32) -> u32 {
        if time_before(self.lbolt, expire) {
            expire.wrapping_sub(self.lbolt)
        } else {
            0
        }
    }

    /// Arm a timer `ticks` from now and put it in the sorted list.
    fn timer_add(&mut self, tmr: TimerId, ticks: u32) {
        let ticks = ticks.max(1);
        let expire = self.lbolt.wrapping_add(ticks);
        {
            let t = self.timers.get_mut(tmr).expect("timer_add: stale timer");
            t.expire = expire;
            t.state = TimerState::Active;
        }
        let timers = &self.timers;
        let pos = self
            .timer_list
            .iter()
            .position(|&x| time_before(expire, timers.get(x).unwrap().expire))
            .unwrap_or(self.timer_list.len());
        self.timer_list.insert(pos, tmr);
    }

    /// Stop an active timer. Legal at any interrupt level.
    pub fn timer_stop(&mut self, tmr: TimerId) {
        let s = self.machine.splhigh();
        if self
            .timers
            .get(tmr)
            .map_or(false, |t| t.state == TimerState::Active)
        {
            if let Some(pos) = self.timer_list.iter().position(|&x| x == tmr) {
                self.timer_list.remove(pos);
            } else if let Some(pos) = self.expire_list.iter().position(|&x| x == tmr) {
                self.expire_list.remove(pos);
            }
            self.timers.get_mut(tmr).unwrap().state = TimerState::Stop;
        }
        self.machine.splx(s);
    }

    /// Arm (or re-arm) a one-shot callout to run `func(arg)` after
    /// `msec`. Callable from ISRs.
    pub fn timer_callout(&mut self, tmr: TimerId, msec: u32, func: TimerFn, arg: usize) {
        let s = self.machine.splhigh();
        if self.timers.get(tmr).map_or(false, |t| t.state == TimerState::Active) {
            if let Some(pos) = self.timer_list.iter().position(|&x| x == tmr) {
                self.timer_list.remove(pos);
            } else if let Some(pos) = self.expire_list.iter().position(|&x| x == tmr) {
                self.expire_list.remove(pos);
            }
        }
        {
            let t = self.timers.get_mut(tmr).expect("timer_callout: stale timer");
            t.func = Some(func);
            t.arg = arg;
            t.interval = 0;
        }
        self.timer_add(tmr, mstohz(msec));
        self.machine.splx(s);
    }

    /// Block the current thread for `msec`. Returns the remaining time in
    /// milliseconds when the sleep was cut short, zero otherwise.
    pub fn timer_delay(&mut self, msec: u32) -> u32 {
        let rc = self.sched_tsleep(self.delay_event, msec);
        if rc == SleepResult::Timeout {
            return 0;
        }
        let timeout = self.cur().timeout;
        let expire = self.timers.get(timeout).unwrap().expire;
        hztoms(self.time_remain(expire))
    }

    /// The sleep syscall body: sleep, report the remainder, EINTR when
    /// interrupted early.
    pub fn timer_sleep(&mut self, msec: u32) -> (u32, Result<()>) {
        let left = self.timer_delay(msec);
        if left > 0 {
            (left, Err(Errno::EINTR))
        } else {
            (0, Ok(()))
        }
    }

    fn alarm_expire(k: &mut Kernel, arg: usize) {
        if let Some(task) = Handle::decode(arg as u64) {
            let _ = k.exception_post(task, EXC_ALRM);
        }
    }

    /// Per-task alarm: post the alarm exception after `msec`; zero
    /// cancels. Returns the time that was left on a previously armed
    /// alarm.
    pub fn timer_alarm(&mut self, msec: u32) -> u32 {
        let s = self.machine.splhigh();
        let task = self.cur().task;
        let tmr = self.tasks.get(task).unwrap().alarm;
        let mut left = 0;
        if self
            .timers
            .get(tmr)
            .map_or(false, |t| t.state == TimerState::Active)
        {
            left = hztoms(self.time_remain(self.timers.get(tmr).unwrap().expire));
        }
        if msec == 0 {
            self.timer_stop(tmr);
        } else {
            self.timer_callout(tmr, msec, Self::alarm_expire, task.encode() as usize);
        }
        self.machine.splx(s);
        left
    }

    /// Program a periodic timer for `t`: first fire after `start`, then
    /// every `period` milliseconds. `start == 0` cancels.
    pub fn timer_periodic(&mut self, t: ThreadId, start: u32, period: u32) -> Result<()> {
        if start != 0 && period == 0 {
            return Err(Errno::EINVAL);
        }
        self.sched_lock();
        let r = (|| {
            if !self.threads.contains(t) {
                return Err(Errno::ESRCH);
            }
            if self.threads.get(t).unwrap().task != self.cur().task {
                return Err(Errno::EPERM);
            }

            if start == 0 {
                let Some(tmr) = self.threads.get(t).unwrap().periodic else {
                    return Err(Errno::EINVAL);
                };
                if self.timers.get(tmr).unwrap().state != TimerState::Active {
                    return Err(Errno::EINVAL);
                }
                self.timer_stop(tmr);
            } else {
                let tmr = match self.threads.get(t).unwrap().periodic {
                    Some(tmr) => tmr,
                    None => {
                        // allocated lazily to keep sleeping-less threads slim
                        let event = self.event_create("periodic");
                        let mut timer = Timer::new();
                        timer.event = Some(event);
                        let tmr = self.timers.insert(timer);
                        self.threads.get_mut(t).unwrap().periodic = Some(tmr);
                        tmr
                    }
                };
                let s = self.machine.splhigh();
                self.timers.get_mut(tmr).unwrap().interval = mstohz(period).max(1);
                self.timer_add(tmr, mstohz(start));
                self.machine.splx(s);
            }
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Wait for the current thread's next periodic tick. EINTR when an
    /// exception ends the wait early; callers retry.
    pub fn timer_waitperiod(&mut self) -> Result<()> {
        let Some(tmr) = self.cur().periodic else {
            return Err(Errno::EINVAL);
        };
        let (state, expire, event) = {
            let t = self.timers.get(tmr).unwrap();
            (t.state, t.expire, t.event.unwrap())
        };
        if state != TimerState::Active {
            return Err(Errno::EINVAL);
        }
        if time_before(self.lbolt, expire) {
            let rc = self.sched_sleep(event);
            if rc != SleepResult::Success {
                return Err(Errno::EINTR);
            }
        }
        Ok(())
    }

    /// Reclaim a terminating thread's periodic timer.
    pub(crate) fn timer_cancel(&mut self, t: ThreadId) {
        if let Some(tmr) = self.threads.get(t).and_then(|x| x.periodic) {
            self.timer_stop(tmr);
            if let Some(event) = self.timers.get(tmr).unwrap().event {
                self.event_destroy(event);
            }
            self.timers.remove(tmr);
            self.threads.get_mut(t).unwrap().periodic = None;
        }
    }

    /// Body of the timer kernel thread: dispatch expired one-shot
    /// callouts with the scheduler locked and interrupts enabled.
    pub(crate) fn timer_thread(arg: usize) {
        let k = unsafe { &mut *(arg as *mut Kernel) };
        let machine = k.machine;
        machine.splhigh();

        loop {
            k.sched_sleep(k.timer_event);

            while let Some(tmr) = k.expire_list.pop_front() {
                let (func, targ) = {
                    let t = k.timers.get_mut(tmr).expect("timer: stale entry");
                    t.state = TimerState::Stop;
                    (t.func.expect("timer: no callout"), t.arg)
                };
                k.sched_lock();
                machine.spl0();
                func(k, targ);

                // let better-priority threads in between callouts
                k.sched_unlock();
                machine.splhigh();
            }
        }
    }

    /// Clock ISR body: advance `lbolt`, harvest expired timers, charge
    /// the running thread. Called with interrupts disabled, inside the
    /// interrupt dispatcher's scheduler lock.
    pub fn clock_handler(&mut self) {
        self.lbolt = self.lbolt.wrapping_add(1);
        if self.cur().priority == PRI_IDLE {
            self.idle_ticks = self.idle_ticks.wrapping_add(1);
        }

        let mut wakeup = false;
        loop {
            let Some(&tmr) = self.timer_list.first() else {
                break;
            };
            let (expire, interval, event) = {
                let t = self.timers.get(tmr).unwrap();
                (t.expire, t.interval, t.event)
            };
            if time_before(self.lbolt, expire) {
                break;
            }
            self.timer_list.remove(0);
            if interval != 0 {
                // periodic: back into the list, period measured from the
                // nominal expiry so drift does not accumulate
                let ticks = self.time_remain(expire.wrapping_add(interval));
                self.timer_add(tmr, ticks);
                if let Some(event) = event {
                    self.sched_wakeup(event);
                }
            } else {
                self.expire_list.push_back(tmr);
                wakeup = true;
            }
        }
        if wakeup {
            self.sched_wakeup(self.timer_event);
        }

        self.sched_tick();
    }

    /// Interrupt entry for the platform clock: the dispatch wrapper the
    /// interrupt controller is expected to provide around `clock_handler`.
    pub fn clock_interrupt(&mut self) {
        self.sched_lock();
        self.clock_handler();
        self.sched_unlock();
    }

    /// Ticks since boot.
    pub fn timer_ticks(&self) -> u32 {
        self.lbolt
    }

    pub fn timer_info(&self) -> TimerInfo {
        TimerInfo {
            hz: HZ,
            cputicks: self.lbolt,
            idleticks: self.idle_ticks,
        }
    }

    /// Bring up the timer thread. Run queues must be live.
    pub(crate) fn timer_init(&mut self) {
        let kptr = self as *mut Kernel as usize;
        if self
            .kthread_create(Self::timer_thread, kptr, crate::param::PRI_TIMER)
            .is_none()
        {
            panic!("timer_init");
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_before_wraps() {
        assert!(time_before(1, 2));
        assert!(!time_before(2, 1));
        assert!(!time_before(7, 7));
        // near the 2^32 boundary the ordering still holds
        assert!(time_before(u32::MAX, 0));
        assert!(time_before(u32::MAX - 5, 3));
        assert!(!time_before(3, u32::MAX));
    }
}
