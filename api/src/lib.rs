//! Shared ABI between the Kestrel kernel, the boot loader and user space.
//!
//! Everything in here crosses a trust or linkage boundary: error numbers,
//! capability bits, scheduling parameters, exception numbers, the boot
//! information handed over by the platform loader, and the info structures
//! returned by `sys_info`. The crate is dependency-free apart from
//! `bitflags` so that loaders and user libraries can embed it as-is.
#![no_std]

use bitflags::bitflags;
use core::fmt;
use core::ops::Deref;

/// System error numbers (BSD numbering, like the C library we emulate).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    EDEADLK = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    EINVAL = 22,
    EAGAIN = 35,
    ENAMETOOLONG = 63,
    ENOSYS = 78,
}

impl Errno {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Syscall return encoding: zero for success, a positive errno otherwise.
    pub fn to_retval(res: Result<(), Errno>) -> isize {
        match res {
            Ok(()) => 0,
            Err(e) => e as i32 as isize,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

bitflags! {
    /// Per-task capability bits, checked by the kernel at its boundary.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CapSet: u32 {
        /// Raise exceptions to other tasks.
        const KILL      = 1 << 0;
        /// Change scheduling parameters beyond the realtime fence.
        const NICE      = 1 << 1;
        /// Touch another task's memory.
        const EXTMEM    = 1 << 2;
        /// Control other tasks (create under them, terminate, suspend).
        const TASKCTRL  = 1 << 3;
        /// Grant or revoke capabilities.
        const SETPCAP   = 1 << 4;
        /// Direct device and I/O access.
        const RAWIO     = 1 << 5;
        /// Power control including shutdown.
        const POWERMGMT = 1 << 6;
        /// Act as a protected server.
        const PROTSERV  = 1 << 7;
        /// Raw disk administration.
        const DISKADMIN = 1 << 8;
        /// Modify system files.
        const SYSFILES  = 1 << 9;
        /// Access any user file.
        const USERFILES = 1 << 10;
    }
}

/// Default capability set for tasks started from the boot module list.
pub const CAPSET_BOOT: CapSet = CapSet::all();

/// Scheduling policies. `OTHER` from the POSIX triple is not supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum SchedPolicy {
    Fifo = 0,
    Rr = 1,
}

impl TryFrom<i32> for SchedPolicy {
    type Error = Errno;

    fn try_from(v: i32) -> Result<Self, Errno> {
        match v {
            0 => Ok(SchedPolicy::Fifo),
            1 => Ok(SchedPolicy::Rr),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Number of priority levels. Smaller number means higher priority.
pub const NPRI: i32 = 256;
/// Priority of the idle thread; nothing else may run at this level.
pub const PRI_IDLE: i32 = NPRI - 1;
/// Highest priority a thread without `CAP_NICE` may request.
pub const PRI_REALTIME: i32 = 127;
/// Default priority for new user threads.
pub const PRI_DEFAULT: i32 = 200;
/// Alias for the numerically largest (weakest) priority.
pub const MINPRI: i32 = NPRI - 1;

bitflags! {
    /// Protection bits for `vm_attribute`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// Address-space setup for `task_create`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum VmInherit {
    /// Fresh empty map.
    New = 0,
    /// Share the parent's map.
    Share = 1,
    /// Deep copy of the parent's map (MMU systems only).
    Copy = 2,
}

impl TryFrom<i32> for VmInherit {
    type Error = Errno;

    fn try_from(v: i32) -> Result<Self, Errno> {
        match v {
            0 => Ok(VmInherit::New),
            1 => Ok(VmInherit::Share),
            2 => Ok(VmInherit::Copy),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Number of exception slots per thread.
pub const NEXC: usize = 32;

/// Pre-defined exception numbers raised by the kernel itself.
pub const EXC_ILL: u32 = 4; /* illegal instruction */
pub const EXC_TRAP: u32 = 5; /* break point */
pub const EXC_FPE: u32 = 8; /* math error */
pub const EXC_SEGV: u32 = 11; /* invalid memory access */
pub const EXC_ALRM: u32 = 14; /* alarm clock */

/// "No handler installed" value for the task exception handler slot.
pub const EXC_DFL: usize = usize::MAX;

/// Value a statically initialized user mutex word carries before first use.
pub const MUTEX_INITIALIZER: u64 = 0x4d49_6e69;
/// Same, for condition variables.
pub const COND_INITIALIZER: u64 = 0x4349_6e69;

/// Name length limits, terminator included.
pub const MAXTASKNAME: usize = 16;
pub const MAXDEVNAME: usize = 16;
pub const MAXOBJNAME: usize = 32;
pub const MAXEVTNAME: usize = 16;

bitflags! {
    /// Device object flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// Character device.
        const CHR = 1 << 0;
        /// Block device.
        const BLK = 1 << 1;
        /// Removable media.
        const REM = 1 << 2;
        /// Protected: open requires `CAP_RAWIO`.
        const PROT = 1 << 3;
        /// Terminal device.
        const TTY = 1 << 4;
    }
}

/// Selectors for `sys_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InfoKind {
    Kernel = 1,
    Memory = 2,
    Thread = 3,
    Device = 4,
    Timer = 5,
}

impl TryFrom<u32> for InfoKind {
    type Error = Errno;

    fn try_from(v: u32) -> Result<Self, Errno> {
        match v {
            1 => Ok(InfoKind::Kernel),
            2 => Ok(InfoKind::Memory),
            3 => Ok(InfoKind::Thread),
            4 => Ok(InfoKind::Device),
            5 => Ok(InfoKind::Timer),
            _ => Err(Errno::EINVAL),
        }
    }
}

pub const SYSNAME_LEN: usize = 32;

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct KernelInfo {
    pub sysname: [u8; SYSNAME_LEN],
    pub version: [u8; SYSNAME_LEN],
    pub hz: u32,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct MemoryInfo {
    /// Physical memory managed by the page allocator, in bytes.
    pub total: u64,
    /// Currently free physical memory, in bytes.
    pub free: u64,
    /// Bytes currently handed out by the kernel heap.
    pub kernel: u64,
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct ThreadInfo {
    /// Iteration cursor; pass back the value returned by the previous call.
    pub cookie: u64,
    pub id: u64,
    pub state: u32,
    pub policy: i32,
    pub priority: i32,
    pub basepri: i32,
    pub time: u32,
    pub suscnt: u32,
    pub task: u64,
    pub active: u32,
    pub taskname: [u8; MAXTASKNAME],
    pub slpevt: [u8; MAXEVTNAME],
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct DeviceInfo {
    pub cookie: u64,
    pub id: u64,
    pub flags: u32,
    pub name: [u8; MAXDEVNAME],
}

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TimerInfo {
    pub hz: u32,
    pub cputicks: u32,
    pub idleticks: u32,
}

/// Fixed header at the front of every IPC message. The kernel stamps
/// `task` with the sender's task handle so the receiver can trust it.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct MsgHeader {
    pub task: u64,
    pub code: i32,
    pub status: i32,
}

/// A physical RAM range reported by the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RamRegion {
    pub base: u64,
    pub size: u64,
    pub usable: bool,
}

impl RamRegion {
    pub fn is_usable(&self) -> bool {
        self.usable
    }
}

/// A loadable image placed in memory by the boot loader: the driver
/// image, or one of the boot task images.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Module {
    pub name: [u8; MAXTASKNAME],
    /// Physical load address of the image.
    pub phys: u64,
    /// Total image size in bytes; zero means "no module".
    pub size: u64,
    /// Link-time virtual address and size of the text section.
    pub text: u64,
    pub textsz: u64,
    /// Link-time virtual address and size of the data section.
    pub data: u64,
    pub datasz: u64,
    pub bsssz: u64,
    pub entry: u64,
}

impl Module {
    pub fn is_present(&self) -> bool {
        self.size != 0
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

// Passed between loader and kernel as a raw pointer + length pair; the
// loader guarantees the array outlives the kernel.
pub struct Modules {
    ptr: *const Module,
    len: usize,
}

impl Modules {
    /// # Safety
    /// `ptr` must point to `len` initialized modules that stay valid and
    /// unaliased for the lifetime of the kernel.
    pub unsafe fn new(ptr: *const Module, len: usize) -> Self {
        Self { ptr, len }
    }

    pub const fn empty() -> Self {
        Self {
            ptr: core::mem::align_of::<Module>() as *const Module,
            len: 0,
        }
    }
}

impl Deref for Modules {
    type Target = [Module];

    fn deref(&self) -> &Self::Target {
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

pub struct RamRegions {
    ptr: *const RamRegion,
    len: usize,
}

impl RamRegions {
    /// # Safety
    /// Same contract as [`Modules::new`].
    pub unsafe fn new(ptr: *const RamRegion, len: usize) -> Self {
        Self { ptr, len }
    }

    pub const fn empty() -> Self {
        Self {
            ptr: core::mem::align_of::<RamRegion>() as *const RamRegion,
            len: 0,
        }
    }
}

impl Deref for RamRegions {
    type Target = [RamRegion];

    fn deref(&self) -> &Self::Target {
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

unsafe impl Send for Modules {}
unsafe impl Sync for Modules {}
unsafe impl Send for RamRegions {}
unsafe impl Sync for RamRegions {}

/// Everything the platform loader hands to `kernel_main`.
pub struct BootInfo {
    pub ram: RamRegions,
    /// Driver image; `driver.is_present()` is false when none was loaded.
    pub driver: Module,
    pub tasks: Modules,
}

pub mod syscalls {
    //! Syscall numbers. The table index is stable ABI.
    pub const SYS_OBJECT_CREATE: u32 = 0;
    pub const SYS_OBJECT_DESTROY: u32 = 1;
    pub const SYS_OBJECT_LOOKUP: u32 = 2;
    pub const SYS_MSG_SEND: u32 = 3;
    pub const SYS_MSG_RECEIVE: u32 = 4;
    pub const SYS_MSG_REPLY: u32 = 5;
    pub const SYS_VM_ALLOCATE: u32 = 6;
    pub const SYS_VM_FREE: u32 = 7;
    pub const SYS_VM_ATTRIBUTE: u32 = 8;
    pub const SYS_VM_MAP: u32 = 9;
    pub const SYS_TASK_CREATE: u32 = 10;
    pub const SYS_TASK_TERMINATE: u32 = 11;
    pub const SYS_TASK_SELF: u32 = 12;
    pub const SYS_TASK_SUSPEND: u32 = 13;
    pub const SYS_TASK_RESUME: u32 = 14;
    pub const SYS_TASK_SETNAME: u32 = 15;
    pub const SYS_TASK_SETCAP: u32 = 16;
    pub const SYS_TASK_CHKCAP: u32 = 17;
    pub const SYS_THREAD_CREATE: u32 = 18;
    pub const SYS_THREAD_TERMINATE: u32 = 19;
    pub const SYS_THREAD_LOAD: u32 = 20;
    pub const SYS_THREAD_SELF: u32 = 21;
    pub const SYS_THREAD_YIELD: u32 = 22;
    pub const SYS_THREAD_SUSPEND: u32 = 23;
    pub const SYS_THREAD_RESUME: u32 = 24;
    pub const SYS_THREAD_SCHEDPARAM: u32 = 25;
    pub const SYS_TIMER_SLEEP: u32 = 26;
    pub const SYS_TIMER_ALARM: u32 = 27;
    pub const SYS_TIMER_PERIODIC: u32 = 28;
    pub const SYS_TIMER_WAITPERIOD: u32 = 29;
    pub const SYS_EXCEPTION_SETUP: u32 = 30;
    pub const SYS_EXCEPTION_RETURN: u32 = 31;
    pub const SYS_EXCEPTION_RAISE: u32 = 32;
    pub const SYS_EXCEPTION_WAIT: u32 = 33;
    pub const SYS_MUTEX_INIT: u32 = 34;
    pub const SYS_MUTEX_DESTROY: u32 = 35;
    pub const SYS_MUTEX_LOCK: u32 = 36;
    pub const SYS_MUTEX_TRYLOCK: u32 = 37;
    pub const SYS_MUTEX_UNLOCK: u32 = 38;
    pub const SYS_COND_INIT: u32 = 39;
    pub const SYS_COND_DESTROY: u32 = 40;
    pub const SYS_COND_WAIT: u32 = 41;
    pub const SYS_COND_SIGNAL: u32 = 42;
    pub const SYS_COND_BROADCAST: u32 = 43;
    pub const SYS_SEM_INIT: u32 = 44;
    pub const SYS_SEM_DESTROY: u32 = 45;
    pub const SYS_SEM_WAIT: u32 = 46;
    pub const SYS_SEM_TRYWAIT: u32 = 47;
    pub const SYS_SEM_POST: u32 = 48;
    pub const SYS_SEM_GETVALUE: u32 = 49;
    pub const SYS_DEVICE_OPEN: u32 = 50;
    pub const SYS_DEVICE_CLOSE: u32 = 51;
    pub const SYS_DEVICE_READ: u32 = 52;
    pub const SYS_DEVICE_WRITE: u32 = 53;
    pub const SYS_DEVICE_IOCTL: u32 = 54;
    pub const SYS_SYS_INFO: u32 = 55;
    pub const SYS_SYS_LOG: u32 = 56;
    pub const SYS_SYS_PANIC: u32 = 57;
    pub const SYS_SYS_TIME: u32 = 58;
    pub const SYS_SYS_DEBUG: u32 = 59;
    pub const NSYSCALLS: u32 = 60;
}

/// Get/set selectors for `thread_schedparam`.
pub const SOP_GETPRI: i32 = 0;
pub const SOP_SETPRI: i32 = 1;
pub const SOP_GETPOLICY: i32 = 2;
pub const SOP_SETPOLICY: i32 = 3;
