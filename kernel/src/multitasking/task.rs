//! Task management.
//!
//! A task is the protection domain: an address space, a capability set,
//! an exception handler, and the collections of threads and kernel
//! objects that die with it.

use crate::error::{Errno, Result};
use crate::ipc::object::ObjectId;
use crate::kern::Kernel;
use crate::memory::vm::MapId;
use crate::multitasking::thread::ThreadId;
use crate::param::{MAXTASKS, DFLSTKSZ};
use crate::sync::cond::CondId;
use crate::sync::mutex::MutexId;
use crate::sync::sem::SemId;
use crate::timer::{Timer, TimerId};
use api::{CapSet, VmInherit, CAPSET_BOOT, EXC_DFL, MAXTASKNAME, PRI_REALTIME};
use alloc::string::String;
use alloc::vec::Vec;
use util::slab::Handle;

pub type TaskId = Handle<Task>;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        /// Kernel-internal task; unreachable from user space.
        const SYSTEM = 1 << 0;
        /// Panic on capability violation instead of returning EPERM.
        const AUDIT  = 1 << 1;
        const TRACED = 1 << 2;
    }
}

pub struct Task {
    pub name: String,
    pub map: MapId,
    /// User-space exception handler entry, or `EXC_DFL`.
    pub handler: usize,
    pub capability: CapSet,
    pub flags: TaskFlags,
    pub parent: Option<TaskId>,
    pub suscnt: u32,
    pub threads: Vec<ThreadId>,
    pub objects: Vec<ObjectId>,
    pub mutexes: Vec<MutexId>,
    pub conds: Vec<CondId>,
    pub sems: Vec<SemId>,
    /// Live sync objects, bounded by `MAXSYNCS`.
    pub nsyncs: u32,
    pub alarm: TimerId,
}

impl Kernel {
    /// task_create - make a child task of `parent`.
    ///
    /// `NEW` gives the child a fresh empty map, `SHARE` the parent's own
    /// map, `COPY` a deep copy (only with an MMU). The child inherits the
    /// parent's exception handler and capabilities and starts with no
    /// threads.
    pub fn task_create(&mut self, parent: TaskId, vm_option: VmInherit) -> Result<TaskId> {
        if vm_option == VmInherit::Copy && !cfg!(feature = "mmu") {
            return Err(Errno::EINVAL);
        }
        if self.tasks.len() >= MAXTASKS {
            return Err(Errno::EAGAIN);
        }

        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(parent) {
                return Err(Errno::ESRCH);
            }
            let curtask = self.tasks.get(self.cur().task).unwrap();
            if !curtask.flags.contains(TaskFlags::SYSTEM) && !self.task_access(parent) {
                return Err(Errno::EPERM);
            }

            let map = match vm_option {
                VmInherit::New => self.vm_create()?,
                VmInherit::Share => {
                    let map = self.tasks.get(parent).unwrap().map;
                    self.vm_reference(map);
                    map
                }
                VmInherit::Copy => {
                    let map = self.tasks.get(parent).unwrap().map;
                    self.vm_dup(map)?
                }
            };

            let p = self.tasks.get(parent).unwrap();
            let handler = p.handler;
            let capability = p.capability;
            let alarm = self.timers.insert(Timer::new());
            let child = self.tasks.insert(Task {
                name: String::from("*noname"),
                map,
                handler,
                capability,
                flags: TaskFlags::default(),
                parent: Some(parent),
                suscnt: 0,
                threads: Vec::new(),
                objects: Vec::new(),
                mutexes: Vec::new(),
                conds: Vec::new(),
                sems: Vec::new(),
                nsyncs: 0,
                alarm,
            });
            Ok(child)
        })();
        self.sched_unlock();
        r
    }

    /// Terminate a task: every resource it owns is torn down, then its
    /// threads, then the address space. Terminating the current task
    /// switches away for good at the final unlock.
    pub fn task_terminate(&mut self, task: TaskId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }

            self.tasks.get_mut(task).unwrap().handler = EXC_DFL;

            let alarm = self.tasks.get(task).unwrap().alarm;
            self.timer_stop(alarm);
            self.object_cleanup(task);
            self.mutex_cleanup(task);
            self.cond_cleanup(task);
            self.sem_cleanup(task);

            let threads = self.tasks.get(task).unwrap().threads.clone();
            for t in threads {
                if t != self.curthread {
                    self.thread_destroy(t);
                }
            }
            if task == self.cur().task {
                self.thread_destroy(self.curthread);
            }

            let map = self.tasks.get(task).unwrap().map;
            self.vm_terminate(map);
            self.timers.remove(alarm);
            self.tasks.remove(task);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub fn task_self(&self) -> TaskId {
        self.cur().task
    }

    /// Suspend every thread of the task. Nests like thread suspension.
    pub fn task_suspend(&mut self, task: TaskId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }
            self.tasks.get_mut(task).unwrap().suscnt += 1;
            if self.tasks.get(task).unwrap().suscnt == 1 {
                let threads = self.tasks.get(task).unwrap().threads.clone();
                for t in threads {
                    self.do_thread_suspend(t);
                }
            }
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Undo one level of task suspension; threads run again when both
    /// their own and the task's suspend counts reach zero.
    pub fn task_resume(&mut self, task: TaskId) -> Result<()> {
        debug_assert!(task != self.cur().task);

        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }
            if self.tasks.get(task).unwrap().suscnt == 0 {
                return Err(Errno::EINVAL);
            }
            self.tasks.get_mut(task).unwrap().suscnt -= 1;
            if self.tasks.get(task).unwrap().suscnt == 0 {
                let threads = self.tasks.get(task).unwrap().threads.clone();
                for t in threads {
                    self.do_thread_resume(t);
                }
            }
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Rename a task. Kept apart from creation since exec() renames.
    pub fn task_setname(&mut self, task: TaskId, name: &str) -> Result<()> {
        if name.len() >= MAXTASKNAME {
            return Err(Errno::ENAMETOOLONG);
        }
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }
            self.tasks.get_mut(task).unwrap().name = String::from(name);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Replace a task's capability set. Needs `SETPCAP`.
    pub fn task_setcap(&mut self, task: TaskId, cap: CapSet) -> Result<()> {
        if !self.task_capable(CapSet::SETPCAP) {
            return Err(Errno::EPERM);
        }
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(task) {
                return Err(Errno::ESRCH);
            }
            if !self.task_access(task) {
                return Err(Errno::EPERM);
            }
            self.tasks.get_mut(task).unwrap().capability = cap;
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// The capability check syscall.
    pub fn task_chkcap(&mut self, task: TaskId, cap: CapSet) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            let t = self.tasks.get(task).ok_or(Errno::ESRCH)?;
            if !t.capability.contains(cap) {
                log::debug!("denying capability: task={} cap={:?}", t.name, cap);
                if t.flags.contains(TaskFlags::AUDIT) {
                    panic!("audit failed");
                }
                return Err(Errno::EPERM);
            }
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Does the current task hold `cap`?
    pub fn task_capable(&self, cap: CapSet) -> bool {
        let t = self.tasks.get(self.cur().task).unwrap();
        if !t.capability.contains(cap) {
            log::debug!("denying capability by kernel: task={} cap={:?}", t.name, cap);
            if t.flags.contains(TaskFlags::AUDIT) {
                panic!("audit failed");
            }
            return false;
        }
        true
    }

    /// May the current task manipulate `task`? System tasks are off
    /// limits; otherwise self, parent/child relationship or `TASKCTRL`
    /// grants access.
    pub fn task_access(&self, task: TaskId) -> bool {
        let Some(t) = self.tasks.get(task) else {
            return false;
        };
        if t.flags.contains(TaskFlags::SYSTEM) {
            return false;
        }
        let curtask = self.cur().task;
        task == curtask
            || t.parent == Some(curtask)
            || Some(task) == self.tasks.get(curtask).unwrap().parent
            || self.task_capable(CapSet::TASKCTRL)
    }

    /// Create and start the boot tasks handed over by the loader.
    pub fn task_bootstrap(&mut self, modules: &[api::Module]) {
        for module in modules.iter().filter(|m| m.is_present()) {
            if let Err(e) = self.boot_one(module) {
                log::error!("task_bootstrap: error={}", e);
                panic!("unable to load boot task");
            }
        }
    }

    fn boot_one(&mut self, module: &api::Module) -> Result<()> {
        let task = self.task_create(self.kernel_task, VmInherit::New)?;
        let map = self.tasks.get(task).unwrap().map;
        let stack = self.vm_load(map, module)?;
        self.task_setname(task, module.name_str())?;

        // boot servers get the full boot capability set; the exec server
        // additionally hands capabilities out, so it needs SETPCAP
        let mut cap = CAPSET_BOOT;
        if module.name_str() == "exec" {
            cap |= CapSet::SETPCAP;
        }
        self.tasks.get_mut(task).unwrap().capability = cap;

        let t = self.thread_create(task)?;
        let sp = stack + (DFLSTKSZ - 3 * core::mem::size_of::<u32>()) as u64;
        self.thread_load(t, Some(module.entry), Some(sp))?;
        {
            let tref = self.threads.get_mut(t).unwrap();
            tref.priority = PRI_REALTIME;
            tref.basepri = PRI_REALTIME;
        }
        self.thread_resume(t)?;
        Ok(())
    }

    /// Create the kernel task. First of the task entry points to run.
    pub(crate) fn task_init(&mut self) {
        let alarm = self.timers.insert(Timer::new());
        self.kernel_task = self.tasks.insert(Task {
            name: String::from("kernel"),
            map: self.kernel_map,
            handler: EXC_DFL,
            capability: CapSet::all(),
            flags: TaskFlags::SYSTEM,
            parent: None,
            suscnt: 0,
            threads: Vec::new(),
            objects: Vec::new(),
            mutexes: Vec::new(),
            conds: Vec::new(),
            sems: Vec::new(),
            nsyncs: 0,
            alarm,
        });
    }
}
