//! Exception delivery.
//!
//! A task installs at most one exception handler. H/W exceptions (traps)
//! go to the thread that caused them and terminate handler-less tasks;
//! S/W exceptions (`exception_raise`) go to a thread blocked in
//! `exception_wait`, or to the task's master thread. Pending exceptions
//! are bits in the target thread's 32-slot mask, delivered on the way
//! back to user mode.

use crate::error::{Errno, Result};
use crate::kern::Kernel;
use crate::machine::{CtxReg, Vaddr};
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::task::{TaskFlags, TaskId};
use api::{CapSet, EXC_DFL, NEXC};

impl Kernel {
    /// Install (or with `EXC_DFL` remove) the current task's exception
    /// handler. Removing the handler drops all pending exceptions and
    /// unblocks any `exception_wait` sleepers.
    pub fn exception_setup(&mut self, handler: usize) -> Result<()> {
        use crate::memory::vm::user_area;
        if handler != EXC_DFL && !user_area(handler as Vaddr, 1) {
            return Err(Errno::EFAULT);
        }
        if handler == 0 {
            return Err(Errno::EINVAL);
        }

        self.sched_lock();
        let curtask = self.cur().task;
        let old = self.tasks.get(curtask).unwrap().handler;
        if old != EXC_DFL && handler == EXC_DFL {
            let machine = self.machine;
            let threads = self.tasks.get(curtask).unwrap().threads.clone();
            for t in threads {
                let s = machine.splhigh();
                self.threads.get_mut(t).unwrap().excbits = 0;
                machine.splx(s);

                if self.threads.get(t).unwrap().slpevt == Some(self.exception_event) {
                    log::debug!("exception wait cancelled");
                    self.sched_unsleep(t, SleepResult::Break);
                }
            }
        }
        self.tasks.get_mut(curtask).unwrap().handler = handler;
        self.sched_unlock();
        Ok(())
    }

    /// The raise syscall: needs `KILL` to signal another task.
    pub fn exception_raise(&mut self, task: TaskId, excno: u32) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if task != self.cur().task && !self.task_capable(CapSet::KILL) {
                return Err(Errno::EPERM);
            }
            self.exception_post(task, excno)
        })();
        self.sched_unlock();
        r
    }

    /// Mark an exception pending for `task` and kick the chosen thread
    /// out of whatever it is sleeping on with `INTR`.
    pub fn exception_post(&mut self, task: TaskId, excno: u32) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            let tref = self.tasks.get(task).ok_or(Errno::ESRCH)?;
            if tref.flags.contains(TaskFlags::SYSTEM) {
                return Err(Errno::EPERM);
            }
            if tref.handler == EXC_DFL || tref.threads.is_empty() || excno as usize >= NEXC {
                return Err(Errno::EINVAL);
            }

            // prefer a thread parked in exception_wait; otherwise the
            // master (first) thread takes it
            let threads = &tref.threads;
            let target = threads
                .iter()
                .copied()
                .find(|&t| self.threads.get(t).unwrap().slpevt == Some(self.exception_event))
                .unwrap_or(threads[0]);

            let s = self.machine.splhigh();
            self.threads.get_mut(target).unwrap().excbits |= 1 << excno;
            self.machine.splx(s);

            self.sched_unsleep(target, SleepResult::Intr);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Block until some exception is posted to this thread. Returns the
    /// lowest pending exception number; the syscall wrapper reports
    /// `EINTR` to user space.
    pub fn exception_wait(&mut self) -> Result<u32> {
        if self.tasks.get(self.cur().task).unwrap().handler == EXC_DFL {
            return Err(Errno::EINVAL);
        }

        self.sched_lock();
        let rc = self.sched_sleep(self.exception_event);
        if rc == SleepResult::Break {
            self.sched_unlock();
            return Err(Errno::EINVAL);
        }
        let s = self.machine.splhigh();
        let bits = self.cur().excbits;
        self.machine.splx(s);
        self.sched_unlock();

        let excno = bits.trailing_zeros();
        debug_assert!(excno < NEXC as u32);
        Ok(excno)
    }

    /// Mark an exception for the current thread. Called by the platform
    /// trap handlers; legal at interrupt level.
    pub fn exception_mark(&mut self, excno: u32) {
        debug_assert!(excno > 0 && (excno as usize) < NEXC);
        let s = self.machine.splhigh();
        self.cur_mut().excbits |= 1 << excno;
        self.machine.splx(s);
    }

    /// Deliver one pending exception on the way back to user mode: save
    /// the user context and redirect it into the handler. A task without
    /// a handler dies on the spot.
    pub fn exception_deliver(&mut self) {
        debug_assert!(!self.cur().state.contains(crate::multitasking::thread::ThreadState::EXIT));
        self.sched_lock();

        let machine = self.machine;
        let s = machine.splhigh();
        let bits = self.cur().excbits;
        machine.splx(s);

        if bits != 0 {
            let excno = bits.trailing_zeros();
            let task = self.cur().task;
            let handler = self.tasks.get(task).unwrap().handler;
            if handler == EXC_DFL {
                log::debug!("exception {} not handled, terminating task", excno);
                let _ = self.task_terminate(task);
                // unreachable for the current task; the switch happens at
                // the unlock below
            } else {
                let s = machine.splhigh();
                let cur = self.cur_mut();
                machine.context_save(&mut cur.ctx);
                machine.context_set(&mut cur.ctx, CtxReg::UEntry, handler);
                machine.context_set(&mut cur.ctx, CtxReg::UArg, excno as usize);
                cur.excbits &= !(1 << excno);
                machine.splx(s);
            }
        }
        self.sched_unlock();
    }

    /// Return from a user exception handler: restore the saved context.
    pub fn exception_return(&mut self) {
        let machine = self.machine;
        let s = machine.splhigh();
        machine.context_restore(&mut self.cur_mut().ctx);
        machine.splx(s);
    }
}
