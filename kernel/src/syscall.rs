//! Syscall dispatch.
//!
//! The platform trap handler lands here with the syscall number and raw
//! argument words. Handlers unpack arguments, move data across the user
//! boundary with `copyin`/`copyout` (the machine layer faults cleanly on
//! bad pointers), and call into the kernel proper. Pending exceptions are
//! delivered on the way out, which is the only place a blocked syscall
//! turns into `EINTR`.
//!
//! Return convention: zero or a positive errno; the handful of calls that
//! produce a value (`task_self`, `thread_self`, `sys_time`) return it
//! directly.

use crate::error::{Errno, Result};
use crate::kern::Kernel;
use crate::machine::Vaddr;
use crate::multitasking::task::TaskId;
use crate::multitasking::thread::ThreadId;
use alloc::string::String;
use api::syscalls::*;
use api::{
    CapSet, DeviceInfo, InfoKind, KernelInfo, MemoryInfo, Prot, ThreadInfo, VmInherit,
    COND_INITIALIZER, MAXDEVNAME, MAXOBJNAME, MAXTASKNAME, MUTEX_INITIALIZER, SYSNAME_LEN,
};
use util::slab::Handle;

#[derive(Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg: [usize; 5],
}

impl SyscallArgs {
    fn at(&self, i: usize) -> usize {
        self.arg[i]
    }
    fn uptr(&self, i: usize) -> Vaddr {
        self.arg[i] as Vaddr
    }
}

type Handler = fn(&mut Kernel, &SyscallArgs) -> isize;

/// Flatten a kernel result into the syscall return word.
fn retval(r: Result<()>) -> isize {
    Errno::to_retval(r)
}

fn errno(e: Errno) -> isize {
    Errno::to_retval(Err(e))
}

fn task_arg(a: usize) -> Result<TaskId> {
    Handle::decode(a as u64).ok_or(Errno::ESRCH)
}

fn thread_arg(a: usize) -> Result<ThreadId> {
    Handle::decode(a as u64).ok_or(Errno::ESRCH)
}

/// Syscall entry, called from the trap path.
pub fn syscall_dispatch(k: &mut Kernel, nr: u32, args: &SyscallArgs) -> isize {
    let r = if nr < NSYSCALLS {
        TABLE[nr as usize](k, args)
    } else {
        errno(Errno::ENOSYS)
    };
    k.exception_deliver();
    r
}

static TABLE: [Handler; NSYSCALLS as usize] = [
    sys_object_create,
    sys_object_destroy,
    sys_object_lookup,
    sys_msg_send,
    sys_msg_receive,
    sys_msg_reply,
    sys_vm_allocate,
    sys_vm_free,
    sys_vm_attribute,
    sys_vm_map,
    sys_task_create,
    sys_task_terminate,
    sys_task_self,
    sys_task_suspend,
    sys_task_resume,
    sys_task_setname,
    sys_task_setcap,
    sys_task_chkcap,
    sys_thread_create,
    sys_thread_terminate,
    sys_thread_load,
    sys_thread_self,
    sys_thread_yield,
    sys_thread_suspend,
    sys_thread_resume,
    sys_thread_schedparam,
    sys_timer_sleep,
    sys_timer_alarm,
    sys_timer_periodic,
    sys_timer_waitperiod,
    sys_exception_setup,
    sys_exception_return,
    sys_exception_raise,
    sys_exception_wait,
    sys_mutex_init,
    sys_mutex_destroy,
    sys_mutex_lock,
    sys_mutex_trylock,
    sys_mutex_unlock,
    sys_cond_init,
    sys_cond_destroy,
    sys_cond_wait,
    sys_cond_signal,
    sys_cond_broadcast,
    sys_sem_init,
    sys_sem_destroy,
    sys_sem_wait,
    sys_sem_trywait,
    sys_sem_post,
    sys_sem_getvalue,
    sys_device_open,
    sys_device_close,
    sys_device_read,
    sys_device_write,
    sys_device_ioctl,
    sys_sys_info,
    sys_sys_log,
    sys_sys_panic,
    sys_sys_time,
    sys_sys_debug,
];

const _: () = assert!(SYS_SYS_DEBUG == NSYSCALLS - 1);

fn sys_object_create(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let name = k.copyin_str(a.uptr(0), MAXOBJNAME)?;
        let obj = k.object_create(&name)?;
        k.copyout_val(&obj.encode(), a.uptr(1))
    })())
}

fn sys_object_destroy(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let obj = Handle::decode(a.at(0) as u64).ok_or(Errno::EINVAL)?;
        k.object_destroy(obj)
    })())
}

fn sys_object_lookup(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let name = k.copyin_str(a.uptr(0), MAXOBJNAME)?;
        let obj = k.object_lookup(&name)?;
        k.copyout_val(&obj.encode(), a.uptr(1))
    })())
}

fn sys_msg_send(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let obj = Handle::decode(a.at(0) as u64).ok_or(Errno::EINVAL)?;
        k.msg_send(obj, a.uptr(1), a.at(2))
    })())
}

fn sys_msg_receive(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let obj = Handle::decode(a.at(0) as u64).ok_or(Errno::EINVAL)?;
        k.msg_receive(obj, a.uptr(1), a.at(2))
    })())
}

fn sys_msg_reply(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let obj = Handle::decode(a.at(0) as u64).ok_or(Errno::EINVAL)?;
        k.msg_reply(obj, a.uptr(1), a.at(2))
    })())
}

fn sys_vm_allocate(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        let addr: usize = k.copyin_val(a.uptr(1))?;
        let va = k.vm_allocate(task, addr as Vaddr, a.at(2), a.at(3) != 0)?;
        k.copyout_val(&(va as usize), a.uptr(1))
    })())
}

fn sys_vm_free(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        k.vm_free(task, a.uptr(1))
    })())
}

fn sys_vm_attribute(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        let prot = Prot::from_bits(a.at(2) as u32).ok_or(Errno::EINVAL)?;
        k.vm_attribute(task, a.uptr(1), prot)
    })())
}

fn sys_vm_map(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let target = task_arg(a.at(0))?;
        // probe the result cell before doing any work
        k.copyout_val(&0usize, a.uptr(3))?;
        let va = k.vm_map(target, a.uptr(1), a.at(2))?;
        k.copyout_val(&(va as usize), a.uptr(3))
    })())
}

fn sys_task_create(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let parent = task_arg(a.at(0))?;
        let option = VmInherit::try_from(a.at(1) as i32)?;
        // clear the result cell first: the child must not inherit a view
        // of a half-written handle, and the fault surfaces before the
        // copy of the parent's space is made
        k.copyout_val(&0u64, a.uptr(2))?;
        let child = k.task_create(parent, option)?;
        k.copyout_val(&child.encode(), a.uptr(2))
    })())
}

fn sys_task_terminate(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| k.task_terminate(task_arg(a.at(0))?))())
}

fn sys_task_self(k: &mut Kernel, _a: &SyscallArgs) -> isize {
    k.task_self().encode() as isize
}

fn sys_task_suspend(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| k.task_suspend(task_arg(a.at(0))?))())
}

fn sys_task_resume(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| k.task_resume(task_arg(a.at(0))?))())
}

fn sys_task_setname(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        let name = k.copyin_str(a.uptr(1), MAXTASKNAME)?;
        k.task_setname(task, &name)
    })())
}

fn sys_task_setcap(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        let cap = CapSet::from_bits(a.at(1) as u32).ok_or(Errno::EINVAL)?;
        k.task_setcap(task, cap)
    })())
}

fn sys_task_chkcap(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        let cap = CapSet::from_bits(a.at(1) as u32).ok_or(Errno::EINVAL)?;
        k.task_chkcap(task, cap)
    })())
}

fn sys_thread_create(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        k.copyout_val(&0u64, a.uptr(1))?;
        let t = k.thread_create(task)?;
        k.copyout_val(&t.encode(), a.uptr(1))
    })())
}

fn sys_thread_terminate(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| k.thread_terminate(thread_arg(a.at(0))?))())
}

fn sys_thread_load(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let t = thread_arg(a.at(0))?;
        let entry = (a.at(1) != 0).then(|| a.uptr(1));
        let stack = (a.at(2) != 0).then(|| a.uptr(2));
        k.thread_load(t, entry, stack)
    })())
}

fn sys_thread_self(k: &mut Kernel, _a: &SyscallArgs) -> isize {
    k.thread_self().encode() as isize
}

fn sys_thread_yield(k: &mut Kernel, _a: &SyscallArgs) -> isize {
    k.thread_yield();
    0
}

fn sys_thread_suspend(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| k.thread_suspend(thread_arg(a.at(0))?))())
}

fn sys_thread_resume(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| k.thread_resume(thread_arg(a.at(0))?))())
}

fn sys_thread_schedparam(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let t = thread_arg(a.at(0))?;
        let op = a.at(1) as i32;
        match op {
            api::SOP_GETPRI | api::SOP_GETPOLICY => {
                let v = k.thread_schedparam_get(t, op)?;
                k.copyout_val(&v, a.uptr(2))
            }
            _ => {
                let v: i32 = k.copyin_val(a.uptr(2))?;
                k.thread_schedparam_set(t, op, v)
            }
        }
    })())
}

fn sys_timer_sleep(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let (left, res) = k.timer_sleep(a.at(0) as u32);
        if a.at(1) != 0 {
            k.copyout_val(&left, a.uptr(1))?;
        }
        res
    })())
}

fn sys_timer_alarm(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let left = k.timer_alarm(a.at(0) as u32);
        if a.at(1) != 0 {
            k.copyout_val(&left, a.uptr(1))?;
        }
        Ok(())
    })())
}

fn sys_timer_periodic(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let t = thread_arg(a.at(0))?;
        k.timer_periodic(t, a.at(1) as u32, a.at(2) as u32)
    })())
}

fn sys_timer_waitperiod(k: &mut Kernel, _a: &SyscallArgs) -> isize {
    retval(k.timer_waitperiod())
}

fn sys_exception_setup(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval(k.exception_setup(a.at(0)))
}

fn sys_exception_return(k: &mut Kernel, _a: &SyscallArgs) -> isize {
    k.exception_return();
    0
}

fn sys_exception_raise(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let task = task_arg(a.at(0))?;
        k.exception_raise(task, a.at(1) as u32)
    })())
}

fn sys_exception_wait(k: &mut Kernel, a: &SyscallArgs) -> isize {
    match (|| {
        k.copyout_val(&0u32, a.uptr(0))?;
        let excno = k.exception_wait()?;
        k.copyout_val(&excno, a.uptr(0))?;
        // by contract the caller sees EINTR, that is how waiters learn
        // that an exception arrived
        Ok(())
    })() {
        Ok(()) => errno(Errno::EINTR),
        Err(e) => errno(e),
    }
}

/// Fetch the kernel mutex behind a user-side mutex word, creating the
/// kernel object on first use when the word still holds the static
/// initializer.
fn mutex_uget(k: &mut Kernel, uptr: Vaddr) -> Result<crate::sync::mutex::MutexId> {
    let word: u64 = k.copyin_val(uptr)?;
    if word == MUTEX_INITIALIZER {
        let m = k.mutex_init()?;
        k.copyout_val(&m.encode(), uptr)?;
        return Ok(m);
    }
    Handle::decode(word).ok_or(Errno::EINVAL)
}

fn cond_uget(k: &mut Kernel, uptr: Vaddr) -> Result<crate::sync::cond::CondId> {
    let word: u64 = k.copyin_val(uptr)?;
    if word == COND_INITIALIZER {
        let c = k.cond_init()?;
        k.copyout_val(&c.encode(), uptr)?;
        return Ok(c);
    }
    Handle::decode(word).ok_or(Errno::EINVAL)
}

fn sys_mutex_init(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let m = k.mutex_init()?;
        k.copyout_val(&m.encode(), a.uptr(0))
    })())
}

fn sys_mutex_destroy(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let m = mutex_uget(k, a.uptr(0))?;
        k.mutex_destroy(m)
    })())
}

fn sys_mutex_lock(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let m = mutex_uget(k, a.uptr(0))?;
        k.mutex_lock(m)
    })())
}

fn sys_mutex_trylock(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let m = mutex_uget(k, a.uptr(0))?;
        k.mutex_trylock(m)
    })())
}

fn sys_mutex_unlock(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let m = mutex_uget(k, a.uptr(0))?;
        k.mutex_unlock(m)
    })())
}

fn sys_cond_init(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let c = k.cond_init()?;
        k.copyout_val(&c.encode(), a.uptr(0))
    })())
}

fn sys_cond_destroy(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let c = cond_uget(k, a.uptr(0))?;
        k.cond_destroy(c)
    })())
}

fn sys_cond_wait(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let c = cond_uget(k, a.uptr(0))?;
        let m = mutex_uget(k, a.uptr(1))?;
        k.cond_wait(c, m)
    })())
}

fn sys_cond_signal(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let c = cond_uget(k, a.uptr(0))?;
        k.cond_signal(c)
    })())
}

fn sys_cond_broadcast(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let c = cond_uget(k, a.uptr(0))?;
        k.cond_broadcast(c)
    })())
}

fn sys_sem_init(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let s = k.sem_init(a.at(1) as u32)?;
        k.copyout_val(&s.encode(), a.uptr(0))
    })())
}

fn sem_uget(k: &mut Kernel, uptr: Vaddr) -> Result<crate::sync::sem::SemId> {
    let word: u64 = k.copyin_val(uptr)?;
    Handle::decode(word).ok_or(Errno::EINVAL)
}

fn sys_sem_destroy(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let s = sem_uget(k, a.uptr(0))?;
        k.sem_destroy(s)
    })())
}

fn sys_sem_wait(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let s = sem_uget(k, a.uptr(0))?;
        k.sem_wait(s)
    })())
}

fn sys_sem_trywait(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let s = sem_uget(k, a.uptr(0))?;
        k.sem_trywait(s)
    })())
}

fn sys_sem_post(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let s = sem_uget(k, a.uptr(0))?;
        k.sem_post(s)
    })())
}

fn sys_sem_getvalue(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let s = sem_uget(k, a.uptr(0))?;
        let v = k.sem_getvalue(s)?;
        k.copyout_val(&v, a.uptr(1))
    })())
}

fn sys_device_open(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let name = k.copyin_str(a.uptr(0), MAXDEVNAME)?;
        let dev = k.device_open(&name, a.at(1) as u32)?;
        k.copyout_val(&dev.encode(), a.uptr(2))
    })())
}

fn sys_device_close(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let dev = Handle::decode(a.at(0) as u64).ok_or(Errno::ENODEV)?;
        k.device_close(dev)
    })())
}

fn sys_device_read(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let dev = Handle::decode(a.at(0) as u64).ok_or(Errno::ENODEV)?;
        let mut nbyte: usize = k.copyin_val(a.uptr(2))?;
        k.device_read(dev, a.uptr(1), &mut nbyte, a.at(3) as u32)?;
        k.copyout_val(&nbyte, a.uptr(2))
    })())
}

fn sys_device_write(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let dev = Handle::decode(a.at(0) as u64).ok_or(Errno::ENODEV)?;
        let mut nbyte: usize = k.copyin_val(a.uptr(2))?;
        k.device_write(dev, a.uptr(1), &mut nbyte, a.at(3) as u32)?;
        k.copyout_val(&nbyte, a.uptr(2))
    })())
}

fn sys_device_ioctl(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let dev = Handle::decode(a.at(0) as u64).ok_or(Errno::ENODEV)?;
        k.device_ioctl(dev, a.at(1) as u32, a.uptr(2))
    })())
}

fn sys_sys_info(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let kind = InfoKind::try_from(a.at(0) as u32)?;
        match kind {
            InfoKind::Kernel => {
                let mut info = KernelInfo {
                    sysname: [0; SYSNAME_LEN],
                    version: [0; SYSNAME_LEN],
                    hz: crate::param::HZ,
                };
                copy_info_name(&mut info.sysname, "Kestrel");
                copy_info_name(&mut info.version, env!("CARGO_PKG_VERSION"));
                k.copyout_val(&info, a.uptr(1))
            }
            InfoKind::Memory => {
                let info = MemoryInfo {
                    total: k.pages.total_bytes(),
                    free: k.pages.free_bytes(),
                    kernel: k.kmem.allocated_bytes() as u64,
                };
                k.copyout_val(&info, a.uptr(1))
            }
            InfoKind::Thread => {
                let mut info: ThreadInfo = k.copyin_val(a.uptr(1))?;
                k.thread_info(&mut info)?;
                k.copyout_val(&info, a.uptr(1))
            }
            InfoKind::Device => {
                let mut info: DeviceInfo = k.copyin_val(a.uptr(1))?;
                k.device_info(&mut info)?;
                k.copyout_val(&info, a.uptr(1))
            }
            InfoKind::Timer => k.copyout_val(&k.timer_info(), a.uptr(1)),
        }
    })())
}

fn copy_info_name(dst: &mut [u8; SYSNAME_LEN], src: &str) {
    let n = src.len().min(SYSNAME_LEN - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn sys_sys_log(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let msg = k.copyin_str(a.uptr(0), LOGLINE_MAX)?;
        log::info!("{}", msg);
        Ok(())
    })())
}

const LOGLINE_MAX: usize = 128;

fn sys_sys_panic(k: &mut Kernel, a: &SyscallArgs) -> isize {
    if cfg!(debug_assertions) {
        let msg = k
            .copyin_str(a.uptr(0), LOGLINE_MAX)
            .unwrap_or_else(|_| String::from("user panic"));
        panic!("{}", msg);
    }
    errno(Errno::EPERM)
}

fn sys_sys_time(k: &mut Kernel, a: &SyscallArgs) -> isize {
    retval((|| {
        let ticks = k.timer_ticks();
        k.copyout_val(&ticks, a.uptr(0))
    })())
}

fn sys_sys_debug(k: &mut Kernel, a: &SyscallArgs) -> isize {
    if !cfg!(debug_assertions) {
        return errno(Errno::EINVAL);
    }
    log::debug!(
        "dbgctl cmd={}: tasks={} threads={} objects={} timers={} heap={}b",
        a.at(0),
        k.tasks.len(),
        k.threads.len(),
        k.objects.len(),
        k.timers.len(),
        k.kmem.allocated_bytes()
    );
    0
}
