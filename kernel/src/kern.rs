//! The kernel instance and its boot path.
//!
//! Every piece of kernel state hangs off one `Kernel` struct: the object
//! tables, the scheduler queues, the memory allocators. Subsystems add
//! their entry points as `impl Kernel` blocks in their own modules. The
//! machine is a uniprocessor, so there is exactly one instance; the boot
//! path installs it behind [`global`] for the trap and interrupt entry
//! points and the driver-kernel interface.

use crate::device::{Device, DkiTable};
use crate::error::{Errno, Result};
use crate::event::{Event, EventId};
use crate::ipc::object::Object;
use crate::machine::{MachineOps, Vaddr};
use crate::memory::kmem::KernelHeap;
use crate::memory::page::PageAllocator;
use crate::memory::vm::{MapId, VmMap};
use crate::multitasking::scheduler::{Dpc, DpcId};
use crate::multitasking::task::{Task, TaskId};
use crate::multitasking::thread::{Thread, ThreadId, ThreadState};
use crate::multitasking::scheduler::SleepResult;
use crate::sync::cond::Cond;
use crate::sync::mutex::Mutex;
use crate::sync::sem::Sem;
use crate::syscall::{syscall_dispatch, SyscallArgs};
use crate::timer::{Timer, TimerId};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use api::{BootInfo, SchedPolicy, NPRI, PRI_IDLE};
use core::sync::atomic::{AtomicPtr, Ordering};
use util::slab::{Handle, Slab};

pub struct Kernel {
    pub machine: &'static dyn MachineOps,

    // Object tables. Everything is handle-addressed; a stale handle
    // simply stops resolving.
    pub tasks: Slab<Task>,
    pub threads: Slab<Thread>,
    pub events: Slab<Event>,
    pub timers: Slab<Timer>,
    pub mutexes: Slab<Mutex>,
    pub conds: Slab<Cond>,
    pub sems: Slab<Sem>,
    pub objects: Slab<Object>,
    pub dpcs: Slab<Dpc>,
    pub devices: Slab<Device>,
    pub maps: Slab<VmMap>,

    // Physical memory.
    pub pages: PageAllocator,
    pub kmem: KernelHeap,

    // Scheduler state.
    pub(crate) runq: [VecDeque<ThreadId>; NPRI as usize],
    pub(crate) wakeq: VecDeque<ThreadId>,
    pub(crate) dpcq: VecDeque<DpcId>,
    pub(crate) maxpri: i32,
    pub curthread: ThreadId,
    pub(crate) idle_thread: ThreadId,
    pub(crate) dpc_event: EventId,

    // Timer state.
    pub(crate) lbolt: u32,
    pub(crate) idle_ticks: u32,
    pub(crate) timer_list: Vec<TimerId>,
    pub(crate) expire_list: VecDeque<TimerId>,
    pub(crate) timer_event: EventId,
    pub(crate) delay_event: EventId,

    // Shared rendezvous events.
    pub(crate) ipc_event: EventId,
    pub(crate) exception_event: EventId,

    pub kernel_task: TaskId,
    pub(crate) kernel_map: MapId,
    /// Thread that terminated itself; reaped at the next deallocation.
    pub(crate) zombie: Option<ThreadId>,
    pub(crate) next_share: u64,
}

impl Kernel {
    /// Build the bare kernel state, including the hand-made idle thread
    /// that carries the boot path until the scheduler is live.
    fn empty(machine: &'static dyn MachineOps) -> Self {
        let mut events = Slab::new();
        let dpc_event = events.insert(Event::new("dpc"));
        let timer_event = events.insert(Event::new("timer"));
        let delay_event = events.insert(Event::new("delay"));
        let ipc_event = events.insert(Event::new("ipc"));
        let exception_event = events.insert(Event::new("exception"));

        // The idle thread exists before anything else so the scheduler
        // lock has a current thread to count on. Its task link and stack
        // are patched in by task_init/thread_init; until then it must
        // not block.
        let placeholder: Handle<Task> = Handle::decode(1).unwrap();
        let mut timers = Slab::new();
        let idle_timeout = timers.insert(Timer::new());
        let mut threads = Slab::new();
        let idle = threads.insert(Thread {
            task: placeholder,
            ctx: crate::machine::Context::zeroed(),
            kstack: None,
            state: ThreadState::default(),
            policy: SchedPolicy::Fifo,
            priority: PRI_IDLE,
            basepri: PRI_IDLE,
            timeleft: 0,
            time: 0,
            resched: false,
            locks: 1,
            suscnt: 0,
            slpevt: None,
            slpret: SleepResult::Success,
            timeout: idle_timeout,
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

        Self {
            machine,
            tasks: Slab::new(),
            threads,
            events,
            timers,
            mutexes: Slab::new(),
            conds: Slab::new(),
            sems: Slab::new(),
            objects: Slab::new(),
            dpcs: Slab::new(),
            devices: Slab::new(),
            maps: Slab::new(),
            pages: PageAllocator::new(),
            kmem: KernelHeap::new(),
            runq: core::array::from_fn(|_| VecDeque::new()),
            wakeq: VecDeque::new(),
            dpcq: VecDeque::new(),
            maxpri: PRI_IDLE,
            curthread: idle,
            idle_thread: idle,
            dpc_event,
            lbolt: 0,
            idle_ticks: 0,
            timer_list: Vec::new(),
            expire_list: VecDeque::new(),
            timer_event,
            delay_event,
            ipc_event,
            exception_event,
            kernel_task: Handle::decode(1).unwrap(),
            kernel_map: Handle::decode(1).unwrap(),
            zombie: None,
            next_share: 0,
        }
    }

    /// Construct and initialize a kernel over the given machine and
    /// memory map. The instance is leaked: a kernel does not shut down.
    pub fn new(machine: &'static dyn MachineOps, bootinfo: &BootInfo) -> &'static mut Kernel {
        let k = Box::leak(Box::new(Self::empty(machine)));
        k.pages.init(&bootinfo.ram);
        k.vm_init();
        k.task_init();
        k.thread_init();
        k.sched_init();
        k.timer_init();
        log::info!(
            "kestrel: {} bytes free, hz={}",
            k.pages.free_bytes(),
            crate::param::HZ
        );
        k
    }

    pub(crate) fn cur(&self) -> &Thread {
        self.threads.get(self.curthread).expect("no current thread")
    }

    pub(crate) fn cur_mut(&mut self) -> &mut Thread {
        self.threads
            .get_mut(self.curthread)
            .expect("no current thread")
    }

    /// Allocate from the kernel heap.
    pub fn kmem_alloc(&mut self, size: usize) -> Option<*mut u8> {
        self.sched_lock();
        let r = self.kmem.alloc(&mut self.pages, self.machine, size);
        self.sched_unlock();
        r
    }

    pub fn kmem_free(&mut self, ptr: *mut u8) {
        self.sched_lock();
        self.kmem.free(&mut self.pages, self.machine, ptr);
        self.sched_unlock();
    }

    /// Copy a plain value in from user space.
    pub fn copyin_val<T: Copy>(&self, uaddr: Vaddr) -> Result<T> {
        let mut val = core::mem::MaybeUninit::<T>::uninit();
        let buf = unsafe {
            core::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
        };
        self.machine.copyin(uaddr, buf)?;
        Ok(unsafe { val.assume_init() })
    }

    /// Copy a plain value out to user space.
    pub fn copyout_val<T: Copy>(&self, val: &T, uaddr: Vaddr) -> Result<()> {
        let buf = unsafe {
            core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.machine.copyout(buf, uaddr)
    }

    /// Copy a NUL-terminated string in from user space.
    pub fn copyin_str(&self, uaddr: Vaddr, max: usize) -> Result<String> {
        let mut buf = vec![0u8; max];
        let len = self.machine.copyinstr(uaddr, &mut buf)?;
        buf.truncate(len);
        String::from_utf8(buf).map_err(|_| Errno::EINVAL)
    }
}

static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// The installed kernel instance. ISRs, trap stubs and the DKI reach the
/// kernel through this; it is a uniprocessor, so whoever is executing
/// owns the instance.
pub fn global() -> &'static mut Kernel {
    let p = KERNEL.load(Ordering::Acquire);
    unsafe { p.as_mut().expect("kernel not installed") }
}

/// Boot entry, called by the platform with interrupts still disabled.
/// Brings the core up, starts the driver image and the boot tasks, and
/// settles into the idle loop.
pub fn kernel_main(
    machine: &'static dyn MachineOps,
    bootinfo: &BootInfo,
    driver_entry: Option<fn(&'static DkiTable)>,
) -> ! {
    let k = Kernel::new(machine, bootinfo);
    KERNEL.store(k as *mut Kernel, Ordering::Release);

    let k = global();
    k.device_init(driver_entry);
    k.task_bootstrap(&bootinfo.tasks);

    // release the boot-time scheduler lock; the boot tasks run now
    k.sched_unlock();
    global().thread_idle()
}

/// Platform trap stub target for system calls.
pub fn trap_syscall(nr: u32, args: &SyscallArgs) -> isize {
    syscall_dispatch(global(), nr, args)
}

/// Platform interrupt stub target for the clock.
pub fn trap_clock() {
    global().clock_interrupt();
}
