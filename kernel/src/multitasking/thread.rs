//! Thread management.
//!
//! A thread is the unit of execution: saved context, kernel stack,
//! scheduling state, and the per-thread ends of the IPC, mutex and timer
//! machinery. Threads always belong to exactly one task.

use crate::error::{Errno, Result};
use crate::event::EventId;
use crate::ipc::object::ObjectId;
use crate::kern::Kernel;
use crate::machine::{Context, CtxReg, Vaddr};
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::task::TaskId;
use crate::param::{KSTACKSZ, MAXTHREADS};
use crate::sync::mutex::MutexId;
use crate::timer::{Timer, TimerId};
use api::{CapSet, SchedPolicy, SOP_GETPOLICY, SOP_GETPRI, SOP_SETPOLICY, SOP_SETPRI};
use api::{PRI_IDLE, PRI_REALTIME};
use alloc::vec::Vec;
use util::slab::Handle;

pub type ThreadId = Handle<Thread>;

bitflags::bitflags! {
    /// Scheduling state. The empty set is "running or ready to run".
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ThreadState: u32 {
        const SLEEP = 1 << 0;
        const SUSP  = 1 << 1;
        const EXIT  = 1 << 2;
    }
}

impl ThreadState {
    pub fn is_run(self) -> bool {
        self.is_empty()
    }
}

pub struct Thread {
    pub task: TaskId,
    pub ctx: Context,
    /// Kernel stack base (kernel heap block); `None` only transiently.
    pub kstack: Option<usize>,

    pub state: ThreadState,
    pub policy: SchedPolicy,
    pub priority: i32,
    pub basepri: i32,
    /// Remaining round-robin quantum, in ticks.
    pub timeleft: i32,
    /// Total ticks charged to this thread.
    pub time: u32,
    pub resched: bool,
    /// Scheduler lock nesting of this thread.
    pub locks: u32,
    pub suscnt: u32,

    pub slpevt: Option<EventId>,
    pub slpret: SleepResult,
    pub timeout: TimerId,
    pub periodic: Option<TimerId>,

    pub excbits: u32,

    /// Mutexes currently held.
    pub mutexes: Vec<MutexId>,
    /// Mutex this thread is blocked on.
    pub mutex_waiting: Option<MutexId>,

    // Synchronous IPC state.
    pub sendobj: Option<ObjectId>,
    pub recvobj: Option<ObjectId>,
    pub sender: Option<ThreadId>,
    pub receiver: Option<ThreadId>,
    /// Kernel-window address and size of the in-flight message.
    pub msgaddr: usize,
    pub msgsize: usize,
}

impl Kernel {
    /// Create a thread in `task`.
    ///
    /// The thread starts suspended with the caller's base priority, a
    /// copy of the caller's kernel stack, and its kernel entry pointed at
    /// the syscall-return trampoline, so that on first resume it comes
    /// out in user mode wherever `thread_load` aimed it.
    pub fn thread_create(&mut self, task: TaskId) -> Result<ThreadId> {
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }
            if self.tasks.get(task).unwrap().threads.len() >= MAXTHREADS {
                return Err(Errno::EAGAIN);
            }
            let t = self.thread_allocate(task).ok_or(Errno::ENOMEM)?;

            let machine = self.machine;
            let cur_stack = self.cur().kstack.expect("caller has no kstack");
            let new_stack = self.threads.get(t).unwrap().kstack.unwrap();
            unsafe {
                core::ptr::copy_nonoverlapping(
                    cur_stack as *const u8,
                    new_stack as *mut u8,
                    KSTACKSZ,
                );
            }
            let trampoline = machine.syscall_trampoline();
            let basepri = self.cur().basepri;
            let tref = self.threads.get_mut(t).unwrap();
            machine.context_set(&mut tref.ctx, CtxReg::KStack, new_stack + KSTACKSZ);
            machine.context_set(&mut tref.ctx, CtxReg::KEntry, trampoline);

            self.sched_start(t, basepri, SchedPolicy::Rr);
            self.threads.get_mut(t).unwrap().suscnt =
                self.tasks.get(task).unwrap().suscnt + 1;
            Ok(t)
        })();
        self.sched_unlock();
        r
    }

    /// Permanently stop the given thread. Never returns an error-free
    /// result to the caller when `t` is the current thread: the switch
    /// happens at the final unlock.
    pub fn thread_terminate(&mut self, t: ThreadId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.threads.contains(t) {
                return Err(Errno::ESRCH);
            }
            let task = self.threads.get(t).unwrap().task;
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }
            self.thread_destroy(t);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// The internal version of thread_terminate: cancel whatever the
    /// thread is involved in, then tear it down.
    pub(crate) fn thread_destroy(&mut self, t: ThreadId) {
        self.msg_cancel(t);
        self.mutex_cancel(t);
        self.timer_cancel(t);
        self.sched_stop(t);
        self.thread_deallocate(t);
    }

    /// Set the user-mode entry point and stack. `None` keeps the old value.
    pub fn thread_load(&mut self, t: ThreadId, entry: Option<Vaddr>, stack: Option<Vaddr>) -> Result<()> {
        use crate::memory::vm::user_area;
        if entry.map_or(false, |e| !user_area(e, 1)) {
            return Err(Errno::EINVAL);
        }
        if stack.map_or(false, |s| !user_area(s, 1)) {
            return Err(Errno::EINVAL);
        }

        self.sched_lock();
        let r = (|| {
            if !self.threads.contains(t) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(self.threads.get(t).unwrap().task) {
                return Err(Errno::EPERM);
            }
            let machine = self.machine;
            let s = machine.splhigh();
            let tref = self.threads.get_mut(t).unwrap();
            if let Some(entry) = entry {
                machine.context_set(&mut tref.ctx, CtxReg::UEntry, entry as usize);
            }
            if let Some(stack) = stack {
                machine.context_set(&mut tref.ctx, CtxReg::UStack, stack as usize);
            }
            machine.splx(s);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub fn thread_self(&self) -> ThreadId {
        self.curthread
    }

    pub fn thread_yield(&mut self) {
        self.sched_yield();
    }

    /// Suspension nests: the thread runs again only after the same number
    /// of resumes.
    pub fn thread_suspend(&mut self, t: ThreadId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.threads.contains(t) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(self.threads.get(t).unwrap().task) {
                return Err(Errno::EPERM);
            }
            self.do_thread_suspend(t);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn do_thread_suspend(&mut self, t: ThreadId) {
        let tref = self.threads.get_mut(t).unwrap();
        tref.suscnt += 1;
        if tref.suscnt == 1 {
            self.sched_suspend(t);
        }
    }

    pub fn thread_resume(&mut self, t: ThreadId) -> Result<()> {
        debug_assert!(t != self.curthread);

        self.sched_lock();
        let r = (|| {
            if !self.threads.contains(t) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(self.threads.get(t).unwrap().task) {
                return Err(Errno::EPERM);
            }
            if self.threads.get(t).unwrap().suscnt == 0 {
                return Err(Errno::EINVAL);
            }
            self.do_thread_resume(t);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn do_thread_resume(&mut self, t: ThreadId) {
        let task_suscnt = {
            let tref = self.threads.get_mut(t).unwrap();
            tref.suscnt -= 1;
            if tref.suscnt > 0 {
                return;
            }
            self.tasks.get(tref.task).map_or(0, |task| task.suscnt)
        };
        if task_suscnt == 0 {
            self.sched_resume(t);
        }
    }

    /// Get one scheduling parameter of `t`.
    pub fn thread_schedparam_get(&mut self, t: ThreadId, op: i32) -> Result<i32> {
        self.sched_lock();
        let r = (|| {
            self.schedparam_access(t)?;
            match op {
                SOP_GETPRI => Ok(self.threads.get(t).unwrap().priority),
                SOP_GETPOLICY => Ok(self.threads.get(t).unwrap().policy as i32),
                _ => Err(Errno::EINVAL),
            }
        })();
        self.sched_unlock();
        r
    }

    /// Set one scheduling parameter of `t`.
    pub fn thread_schedparam_set(&mut self, t: ThreadId, op: i32, param: i32) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            self.schedparam_access(t)?;
            match op {
                SOP_SETPRI => {
                    let mut pri = param.clamp(0, PRI_IDLE - 1);
                    // realtime levels are fenced off behind CAP_NICE
                    if pri <= PRI_REALTIME && !self.task_capable(CapSet::NICE) {
                        return Err(Errno::EPERM);
                    }
                    let tref = self.threads.get(t).unwrap();
                    // an inherited priority must not be lowered here; the
                    // base changes and the current level follows later
                    if tref.priority != tref.basepri && pri > tref.priority {
                        pri = tref.priority;
                    }
                    self.mutex_setpri(t, pri);
                    self.sched_setpri(t, pri, pri);
                    Ok(())
                }
                SOP_SETPOLICY => {
                    let policy = SchedPolicy::try_from(param)?;
                    self.sched_setpolicy(t, policy)
                }
                _ => Err(Errno::EINVAL),
            }
        })();
        self.sched_unlock();
        r
    }

    fn schedparam_access(&mut self, t: ThreadId) -> Result<()> {
        if !self.threads.contains(t) {
            return Err(Errno::ESRCH);
        }
        let task = self.threads.get(t).unwrap().task;
        if self.tasks.get(task).unwrap().flags.contains(crate::multitasking::task::TaskFlags::SYSTEM) {
            return Err(Errno::EINVAL);
        }
        // a thread may tune threads of its own task or of a child task
        let curtask = self.cur().task;
        let parent = self.tasks.get(task).unwrap().parent;
        if task != curtask && parent != Some(curtask) && !self.task_capable(CapSet::NICE) {
            return Err(Errno::EPERM);
        }
        Ok(())
    }

    /// Idle loop of the boot thread: halt until an interrupt, then give
    /// whatever it woke a chance to run.
    pub fn thread_idle(&mut self) -> ! {
        loop {
            self.machine.machine_idle();
            self.sched_yield();
        }
    }

    /// Allocate the thread table entry, kernel stack and timeout timer.
    pub(crate) fn thread_allocate(&mut self, task: TaskId) -> Option<ThreadId> {
        let stack = self.kmem_alloc(KSTACKSZ)? as usize;
        let timeout = self.timers.insert(Timer::new());
        let t = self.threads.insert(Thread {
            task,
            ctx: Context::zeroed(),
            kstack: Some(stack),
            state: ThreadState::default(),
            policy: SchedPolicy::Fifo,
            priority: PRI_IDLE,
            basepri: PRI_IDLE,
            timeleft: 0,
            time: 0,
            resched: false,
            locks: 0,
            suscnt: 0,
            slpevt: None,
            slpret: SleepResult::Success,
            timeout,
            periodic: None,
            excbits: 0,
            mutexes: Vec::new(),
            mutex_waiting: None,
            sendobj: None,
            recvobj: None,
            sender: None,
            receiver: None,
            msgaddr: 0,
            msgsize: 0,
        });
        self.tasks.get_mut(task).unwrap().threads.push(t);
        Some(t)
    }

    /// Release a thread. The current thread cannot free the stack it is
    /// running on, so it parks in the zombie slot and the next
    /// deallocation from another thread reaps it.
    pub(crate) fn thread_deallocate(&mut self, t: ThreadId) {
        let task = self.threads.get(t).unwrap().task;
        if let Some(task) = self.tasks.get_mut(task) {
            task.threads.retain(|&x| x != t);
        }
        self.threads.get_mut(t).unwrap().excbits = 0;

        if let Some(z) = self.zombie.take() {
            debug_assert!(z != self.curthread);
            self.reap(z);
        }
        if t == self.curthread {
            self.zombie = Some(t);
            return;
        }
        self.reap(t);
    }

    fn reap(&mut self, t: ThreadId) {
        let tref = self.threads.get_mut(t).unwrap();
        let stack = tref.kstack.take();
        let timeout = tref.timeout;
        self.timer_stop(timeout);
        self.timers.remove(timeout);
        if let Some(stack) = stack {
            self.kmem_free(stack as *mut u8);
        }
        self.threads.remove(t);
    }

    /// Create a kernel thread at the given priority. Kernel threads run
    /// FIFO and come out of the box resumed. Assumes the scheduler is
    /// locked.
    pub fn kthread_create(&mut self, entry: fn(usize), arg: usize, pri: i32) -> Option<ThreadId> {
        debug_assert!(self.cur().locks > 0);

        let t = self.thread_allocate(self.kernel_task)?;
        let machine = self.machine;
        let tref = self.threads.get_mut(t).unwrap();
        let stack = tref.kstack.unwrap();
        unsafe { core::ptr::write_bytes(stack as *mut u8, 0, KSTACKSZ) };
        machine.context_set(&mut tref.ctx, CtxReg::KStack, stack + KSTACKSZ);
        machine.context_set(&mut tref.ctx, CtxReg::KEntry, entry as usize);
        machine.context_set(&mut tref.ctx, CtxReg::KArg, arg);

        self.sched_start(t, pri, SchedPolicy::Fifo);
        self.threads.get_mut(t).unwrap().suscnt = 1;
        self.sched_resume(t);
        Some(t)
    }

    pub fn kthread_terminate(&mut self, t: ThreadId) {
        debug_assert!(self
            .tasks
            .get(self.threads.get(t).unwrap().task)
            .unwrap()
            .flags
            .contains(crate::multitasking::task::TaskFlags::SYSTEM));

        self.sched_lock();
        self.mutex_cancel(t);
        self.timer_cancel(t);
        self.sched_stop(t);
        self.thread_deallocate(t);
        self.sched_unlock();
    }

    /// Finish setting up the hand-made idle thread: give it a proper
    /// kernel stack and its place in the kernel task. It becomes the
    /// idle thread once the boot path enters `thread_idle`.
    pub(crate) fn thread_init(&mut self) {
        let idle = self.idle_thread;
        let stack = self
            .kmem_alloc(KSTACKSZ)
            .expect("thread_init: no memory for the idle stack") as usize;
        unsafe { core::ptr::write_bytes(stack as *mut u8, 0, KSTACKSZ) };

        let machine = self.machine;
        let tref = self.threads.get_mut(idle).unwrap();
        tref.kstack = Some(stack);
        machine.context_set(&mut tref.ctx, CtxReg::KStack, stack + KSTACKSZ);

        self.sched_start(idle, PRI_IDLE, SchedPolicy::Fifo);
        let tref = self.threads.get_mut(idle).unwrap();
        tref.state = ThreadState::default(); // running, not suspended
        tref.locks = 1;
        tref.task = self.kernel_task;
        self.tasks
            .get_mut(self.kernel_task)
            .unwrap()
            .threads
            .push(idle);
    }

    /// Fill one `ThreadInfo` slot for `sys_info`, walking by cookie.
    pub fn thread_info(&mut self, info: &mut api::ThreadInfo) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            let target = info.cookie;
            for (i, (h, _)) in self.threads.iter().enumerate() {
                if i as u64 == target {
                    let t = self.threads.get(h).unwrap();
                    info.cookie = i as u64 + 1;
                    info.id = h.encode();
                    info.state = t.state.bits();
                    info.policy = t.policy as i32;
                    info.priority = t.priority;
                    info.basepri = t.basepri;
                    info.time = t.time;
                    info.suscnt = t.suscnt;
                    info.task = t.task.encode();
                    info.active = (h == self.curthread) as u32;
                    let name = self.tasks.get(t.task).map_or("?", |task| task.name.as_str());
                    copy_name(&mut info.taskname, name);
                    let evt = t
                        .slpevt
                        .and_then(|e| self.events.get(e))
                        .map_or("-", |e| e.name);
                    copy_name(&mut info.slpevt, evt);
                    return Ok(());
                }
            }
            Err(Errno::ESRCH)
        })();
        self.sched_unlock();
        r
    }
}

pub(crate) fn copy_name(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    dst[n] = 0;
}
