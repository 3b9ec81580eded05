//! Device objects and the driver-kernel interface.
//!
//! Drivers are linked as a separate image; at boot the kernel calls the
//! driver image's entry point once, handing it the DKI table: the fixed
//! set of kernel services drivers may use. Drivers then create device
//! objects, which give user space named I/O endpoints; all user I/O is
//! forwarded to the driver's `DevOps` with a minimum of checking.

use crate::error::{Errno, Result};
use crate::kern::{global, Kernel};
use crate::machine::{IsrFn, Vaddr};
use crate::multitasking::scheduler::DpcId;
use crate::multitasking::thread::copy_name;
use crate::timer::{TimerFn, TimerId};
use alloc::string::String;
use api::{CapSet, DeviceFlags, DeviceInfo, MAXDEVNAME};
use util::slab::Handle;

pub type DeviceId = Handle<Device>;

/// Driver operations on one device. Defaults make every entry optional:
/// open/close/devctl succeed as no-ops, data transfer fails.
pub trait DevOps: Sync {
    fn open(&self, _k: &mut Kernel, _dev: DeviceId, _mode: u32) -> Result<()> {
        Ok(())
    }
    fn close(&self, _k: &mut Kernel, _dev: DeviceId) -> Result<()> {
        Ok(())
    }
    fn read(
        &self,
        _k: &mut Kernel,
        _dev: DeviceId,
        _buf: Vaddr,
        _nbyte: &mut usize,
        _blkno: u32,
    ) -> Result<()> {
        Err(Errno::ENODEV)
    }
    fn write(
        &self,
        _k: &mut Kernel,
        _dev: DeviceId,
        _buf: Vaddr,
        _nbyte: &mut usize,
        _blkno: u32,
    ) -> Result<()> {
        Err(Errno::ENODEV)
    }
    fn ioctl(&self, _k: &mut Kernel, _dev: DeviceId, _cmd: u32, _arg: Vaddr) -> Result<()> {
        Err(Errno::ENODEV)
    }
    fn devctl(&self, _k: &mut Kernel, _dev: DeviceId, _cmd: u32, _arg: usize) -> Result<()> {
        Ok(())
    }
}

/// A driver: a name, its device operations, and how much per-device
/// private memory it wants.
pub struct Driver {
    pub name: &'static str,
    pub devops: &'static dyn DevOps,
    /// Size of the per-device soft state allocated at `device_create`.
    pub devsz: usize,
}

pub struct Device {
    pub name: String,
    pub driver: &'static Driver,
    pub flags: DeviceFlags,
    pub active: bool,
    pub refcnt: u32,
    /// Driver soft state (kernel heap block), or null.
    pub private: *mut u8,
}

// Device table entries only travel with the kernel itself.
unsafe impl Send for Device {}

impl Kernel {
    /// Create a device object. Drivers call this from the DKI.
    pub fn device_create(
        &mut self,
        driver: &'static Driver,
        name: &str,
        flags: DeviceFlags,
    ) -> Result<DeviceId> {
        if name.is_empty() || name.len() >= MAXDEVNAME {
            return Err(Errno::EINVAL);
        }
        self.sched_lock();

        if self.device_lookup(name).is_some() {
            panic!("duplicate device: {}", name);
        }
        let private = if driver.devsz != 0 {
            let p = self
                .kmem_alloc(driver.devsz)
                .unwrap_or_else(|| panic!("device_create: {}", name));
            unsafe { core::ptr::write_bytes(p, 0, driver.devsz) };
            p
        } else {
            core::ptr::null_mut()
        };
        let dev = self.devices.insert(Device {
            name: String::from(name),
            driver,
            flags,
            active: true,
            refcnt: 1,
            private,
        });

        self.sched_unlock();
        Ok(dev)
    }

    /// Destroy a device object; the removal is deferred until the last
    /// reference drops.
    pub fn device_destroy(&mut self, dev: DeviceId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.device_valid(dev) {
                return Err(Errno::ENODEV);
            }
            self.devices.get_mut(dev).unwrap().active = false;
            self.device_release(dev);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    pub fn device_lookup(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, d)| d.name == name)
            .map(|(h, _)| h)
    }

    /// Driver soft state pointer of a device.
    pub fn device_private(&self, dev: DeviceId) -> *mut u8 {
        self.devices.get(dev).map_or(core::ptr::null_mut(), |d| d.private)
    }

    fn device_valid(&self, dev: DeviceId) -> bool {
        self.devices.get(dev).map_or(false, |d| d.active)
    }

    /// Take a reference for the duration of an I/O request. Protected
    /// devices need the raw I/O capability.
    fn device_reference(&mut self, dev: DeviceId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if !self.device_valid(dev) {
                return Err(Errno::ENODEV);
            }
            if self.devices.get(dev).unwrap().flags.contains(DeviceFlags::PROT)
                && !self.task_capable(CapSet::RAWIO)
            {
                return Err(Errno::EPERM);
            }
            self.devices.get_mut(dev).unwrap().refcnt += 1;
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    fn device_release(&mut self, dev: DeviceId) {
        self.sched_lock();
        let gone = {
            let d = self.devices.get_mut(dev).unwrap();
            d.refcnt -= 1;
            d.refcnt == 0
        };
        if gone {
            let d = self.devices.remove(dev).unwrap();
            if !d.private.is_null() {
                self.kmem_free(d.private);
            }
        }
        self.sched_unlock();
    }

    /// Open by name. A driver without an open routine still succeeds, so
    /// applications can probe for device existence.
    pub fn device_open(&mut self, name: &str, mode: u32) -> Result<DeviceId> {
        self.sched_lock();
        let dev = self.device_lookup(name);
        let r = match dev {
            None => Err(Errno::ENXIO),
            Some(dev) => self.device_reference(dev).map(|_| dev),
        };
        self.sched_unlock();
        let dev = r?;

        let ops = self.devices.get(dev).unwrap().driver.devops;
        let res = ops.open(self, dev, mode);
        self.device_release(dev);
        res.map(|_| dev)
    }

    pub fn device_close(&mut self, dev: DeviceId) -> Result<()> {
        self.device_reference(dev)?;
        let ops = self.devices.get(dev).unwrap().driver.devops;
        let res = ops.close(self, dev);
        self.device_release(dev);
        res
    }

    /// Read from a device into a user buffer; `nbyte` carries the actual
    /// count back out.
    pub fn device_read(
        &mut self,
        dev: DeviceId,
        buf: Vaddr,
        nbyte: &mut usize,
        blkno: u32,
    ) -> Result<()> {
        if !crate::memory::vm::user_area(buf, *nbyte) {
            return Err(Errno::EFAULT);
        }
        self.device_reference(dev)?;
        let ops = self.devices.get(dev).unwrap().driver.devops;
        let res = ops.read(self, dev, buf, nbyte, blkno);
        self.device_release(dev);
        res
    }

    pub fn device_write(
        &mut self,
        dev: DeviceId,
        buf: Vaddr,
        nbyte: &mut usize,
        blkno: u32,
    ) -> Result<()> {
        if !crate::memory::vm::user_area(buf, *nbyte) {
            return Err(Errno::EFAULT);
        }
        self.device_reference(dev)?;
        let ops = self.devices.get(dev).unwrap().driver.devops;
        let res = ops.write(self, dev, buf, nbyte, blkno);
        self.device_release(dev);
        res
    }

    /// I/O control; command and argument are driver business, including
    /// validation of whatever `arg` points at.
    pub fn device_ioctl(&mut self, dev: DeviceId, cmd: u32, arg: Vaddr) -> Result<()> {
        self.device_reference(dev)?;
        let ops = self.devices.get(dev).unwrap().driver.devops;
        let res = ops.ioctl(self, dev, cmd, arg);
        self.device_release(dev);
        res
    }

    /// Driver-to-driver control request.
    pub fn device_control(&mut self, dev: DeviceId, cmd: u32, arg: usize) -> Result<()> {
        self.sched_lock();
        let ops = self
            .devices
            .get(dev)
            .map(|d| d.driver.devops)
            .ok_or(Errno::ENODEV);
        let r = ops.and_then(|ops| ops.devctl(self, dev, cmd, arg));
        self.sched_unlock();
        r
    }

    /// Send a devctl to every device. With `force`, keep going past
    /// failures and report `EIO` if any driver failed; without it, stop
    /// at the first error and return it.
    pub fn device_broadcast(&mut self, cmd: u32, arg: usize, force: bool) -> Result<()> {
        self.sched_lock();
        let mut retval = Ok(());
        let devs: alloc::vec::Vec<DeviceId> = self.devices.handles().collect();
        for dev in devs {
            let ops = self.devices.get(dev).unwrap().driver.devops;
            if let Err(e) = ops.devctl(self, dev, cmd, arg) {
                log::debug!("device_broadcast: error={} cmd={}", e, cmd);
                if force {
                    retval = Err(Errno::EIO);
                } else {
                    retval = Err(e);
                    break;
                }
            }
        }
        self.sched_unlock();
        retval
    }

    /// Fill one `DeviceInfo` slot for `sys_info`.
    pub fn device_info(&mut self, info: &mut DeviceInfo) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            let target = info.cookie;
            for (i, (h, d)) in self.devices.iter().enumerate() {
                if i as u64 == target {
                    info.cookie = i as u64 + 1;
                    info.id = h.encode();
                    info.flags = d.flags.bits();
                    copy_name(&mut info.name, &d.name);
                    return Ok(());
                }
            }
            Err(Errno::ESRCH)
        })();
        self.sched_unlock();
        r
    }

    /// Call the driver image's entry point with the DKI table.
    pub fn device_init(&mut self, driver_entry: Option<fn(&'static DkiTable)>) {
        match driver_entry {
            Some(entry) => {
                log::debug!("entering driver module");
                entry(&DKI_TABLE);
            }
            None => log::debug!("warning: no driver found"),
        }
    }
}

/// The driver-kernel interface. Field order is stable ABI; drivers are
/// compiled against exactly this layout.
#[repr(C)]
pub struct DkiTable {
    /*  0 */ pub copyin: fn(Vaddr, &mut [u8]) -> Result<()>,
    /*  1 */ pub copyout: fn(&[u8], Vaddr) -> Result<()>,
    /*  2 */ pub copyinstr: fn(Vaddr, &mut [u8]) -> Result<usize>,
    /*  3 */ pub kmem_alloc: fn(usize) -> Option<*mut u8>,
    /*  4 */ pub kmem_free: fn(*mut u8),
    /*  5 */ pub kmem_map: fn(Vaddr, usize) -> Option<*mut u8>,
    /*  6 */ pub page_alloc: fn(usize) -> Result<u64>,
    /*  7 */ pub page_free: fn(u64, usize),
    /*  8 */ pub page_reserve: fn(u64, usize) -> Result<()>,
    /*  9 */ pub irq_attach: fn(u32, IsrFn, usize) -> Result<()>,
    /* 10 */ pub irq_detach: fn(u32),
    /* 11 */ pub spl0: fn() -> usize,
    /* 12 */ pub splhigh: fn() -> usize,
    /* 13 */ pub splx: fn(usize),
    /* 14 */ pub timer_callout: fn(TimerId, u32, TimerFn, usize),
    /* 15 */ pub timer_stop: fn(TimerId),
    /* 16 */ pub timer_delay: fn(u32) -> u32,
    /* 17 */ pub timer_ticks: fn() -> u32,
    /* 18 */ pub sched_lock: fn(),
    /* 19 */ pub sched_unlock: fn(),
    /* 20 */ pub sched_tsleep: fn(crate::event::EventId, u32) -> crate::multitasking::scheduler::SleepResult,
    /* 21 */ pub sched_wakeup: fn(crate::event::EventId),
    /* 22 */ pub sched_dpc: fn(DpcId, TimerFn, usize),
    /* 23 */ pub task_capable: fn(CapSet) -> bool,
    /* 24 */ pub exception_post: fn(u64, u32) -> Result<()>,
    /* 25 */ pub device_create: fn(&'static Driver, &str, DeviceFlags) -> Result<DeviceId>,
    /* 26 */ pub device_destroy: fn(DeviceId) -> Result<()>,
    /* 27 */ pub device_lookup: fn(&str) -> Option<DeviceId>,
    /* 28 */ pub device_control: fn(DeviceId, u32, usize) -> Result<()>,
    /* 29 */ pub device_broadcast: fn(u32, usize, bool) -> Result<()>,
    /* 30 */ pub device_private: fn(DeviceId) -> *mut u8,
    /* 31 */ pub machine_powerdown: fn(),
    /* 32 */ pub timer_alloc: fn() -> TimerId,
    /* 33 */ pub dpc_alloc: fn() -> DpcId,
    /* 34 */ pub event_alloc: fn(&'static str) -> crate::event::EventId,
}

fn dki_copyin(uaddr: Vaddr, buf: &mut [u8]) -> Result<()> {
    global().machine.copyin(uaddr, buf)
}
fn dki_copyout(buf: &[u8], uaddr: Vaddr) -> Result<()> {
    global().machine.copyout(buf, uaddr)
}
fn dki_copyinstr(uaddr: Vaddr, buf: &mut [u8]) -> Result<usize> {
    global().machine.copyinstr(uaddr, buf)
}
fn dki_kmem_alloc(size: usize) -> Option<*mut u8> {
    global().kmem_alloc(size)
}
fn dki_kmem_free(p: *mut u8) {
    global().kmem_free(p)
}
fn dki_kmem_map(uaddr: Vaddr, size: usize) -> Option<*mut u8> {
    global().kmem_map_user(uaddr, size)
}
fn dki_page_alloc(size: usize) -> Result<u64> {
    global().pages.alloc(size)
}
fn dki_page_free(pa: u64, size: usize) {
    global().pages.free(pa, size)
}
fn dki_page_reserve(pa: u64, size: usize) -> Result<()> {
    global().pages.reserve(pa, size)
}
fn dki_irq_attach(irq: u32, isr: IsrFn, arg: usize) -> Result<()> {
    global().machine.irq_attach(irq, isr, arg)
}
fn dki_irq_detach(irq: u32) {
    global().machine.irq_detach(irq)
}
fn dki_spl0() -> usize {
    global().machine.spl0()
}
fn dki_splhigh() -> usize {
    global().machine.splhigh()
}
fn dki_splx(s: usize) {
    global().machine.splx(s)
}
fn dki_timer_callout(tmr: TimerId, msec: u32, func: TimerFn, arg: usize) {
    global().timer_callout(tmr, msec, func, arg)
}
fn dki_timer_stop(tmr: TimerId) {
    global().timer_stop(tmr)
}
fn dki_timer_delay(msec: u32) -> u32 {
    global().timer_delay(msec)
}
fn dki_timer_ticks() -> u32 {
    global().timer_ticks()
}
fn dki_sched_lock() {
    global().sched_lock()
}
fn dki_sched_unlock() {
    global().sched_unlock()
}
fn dki_sched_tsleep(
    evt: crate::event::EventId,
    msec: u32,
) -> crate::multitasking::scheduler::SleepResult {
    global().sched_tsleep(evt, msec)
}
fn dki_sched_wakeup(evt: crate::event::EventId) {
    global().sched_wakeup(evt)
}
fn dki_sched_dpc(dpc: DpcId, func: TimerFn, arg: usize) {
    global().sched_dpc(dpc, func, arg)
}
fn dki_task_capable(cap: CapSet) -> bool {
    global().task_capable(cap)
}
fn dki_exception_post(task: u64, excno: u32) -> Result<()> {
    let task = Handle::decode(task).ok_or(Errno::ESRCH)?;
    global().exception_post(task, excno)
}
fn dki_device_create(drv: &'static Driver, name: &str, flags: DeviceFlags) -> Result<DeviceId> {
    global().device_create(drv, name, flags)
}
fn dki_device_destroy(dev: DeviceId) -> Result<()> {
    global().device_destroy(dev)
}
fn dki_device_lookup(name: &str) -> Option<DeviceId> {
    global().device_lookup(name)
}
fn dki_device_control(dev: DeviceId, cmd: u32, arg: usize) -> Result<()> {
    global().device_control(dev, cmd, arg)
}
fn dki_device_broadcast(cmd: u32, arg: usize, force: bool) -> Result<()> {
    global().device_broadcast(cmd, arg, force)
}
fn dki_device_private(dev: DeviceId) -> *mut u8 {
    global().device_private(dev)
}
fn dki_machine_powerdown() {
    global().machine.machine_powerdown()
}
fn dki_timer_alloc() -> TimerId {
    global().timers.insert(crate::timer::Timer::new())
}
fn dki_dpc_alloc() -> DpcId {
    global().dpc_create()
}
fn dki_event_alloc(name: &'static str) -> crate::event::EventId {
    global().event_create(name)
}

pub static DKI_TABLE: DkiTable = DkiTable {
    copyin: dki_copyin,
    copyout: dki_copyout,
    copyinstr: dki_copyinstr,
    kmem_alloc: dki_kmem_alloc,
    kmem_free: dki_kmem_free,
    kmem_map: dki_kmem_map,
    page_alloc: dki_page_alloc,
    page_free: dki_page_free,
    page_reserve: dki_page_reserve,
    irq_attach: dki_irq_attach,
    irq_detach: dki_irq_detach,
    spl0: dki_spl0,
    splhigh: dki_splhigh,
    splx: dki_splx,
    timer_callout: dki_timer_callout,
    timer_stop: dki_timer_stop,
    timer_delay: dki_timer_delay,
    timer_ticks: dki_timer_ticks,
    sched_lock: dki_sched_lock,
    sched_unlock: dki_sched_unlock,
    sched_tsleep: dki_sched_tsleep,
    sched_wakeup: dki_sched_wakeup,
    sched_dpc: dki_sched_dpc,
    task_capable: dki_task_capable,
    exception_post: dki_exception_post,
    device_create: dki_device_create,
    device_destroy: dki_device_destroy,
    device_lookup: dki_device_lookup,
    device_control: dki_device_control,
    device_broadcast: dki_device_broadcast,
    device_private: dki_device_private,
    machine_powerdown: dki_machine_powerdown,
    timer_alloc: dki_timer_alloc,
    dpc_alloc: dki_dpc_alloc,
    event_alloc: dki_event_alloc,
};
