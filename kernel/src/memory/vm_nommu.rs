//! Virtual memory manager for MMU-less machines.
//!
//! Virtual and physical addresses coincide; a "map" is just the list of
//! ranges a task has reserved from the page allocator, so that teardown
//! and `vm_free` know what to give back. The segment records are not
//! sorted by address and never coalesce; the page allocator does that.
//!
//! `vm_map` records a second segment over the donor's pages and ties both
//! records into one share group: neither side releases the pages while
//! the other still holds them, and the last record standing does.

use crate::error::{Errno, Result};
use crate::kern::Kernel;
use crate::machine::{Paddr, Vaddr};
use crate::memory::seg::{Seg, SegFlags, ShareId};
use crate::multitasking::task::TaskId;
use crate::param::{round_page, trunc_page, DFLSTKSZ, MAXMEM, USERBASE, USERLIMIT};
use alloc::vec::Vec;
use api::{CapSet, Module, Prot};
use util::slab::Handle;

pub type MapId = Handle<VmMap>;

pub struct VmMap {
    pub segs: Vec<Seg>,
    pub total: usize,
    pub refcnt: u32,
}

pub fn user_area(addr: Vaddr, size: usize) -> bool {
    addr >= USERBASE
        && addr
            .checked_add(size as u64)
            .map_or(false, |end| end <= USERLIMIT)
}

impl Kernel {
    pub(crate) fn vm_init(&mut self) {
        self.kernel_map = self.maps.insert(VmMap {
            segs: Vec::new(),
            total: 0,
            refcnt: 1,
        });
    }

    pub fn vm_create(&mut self) -> Result<MapId> {
        Ok(self.maps.insert(VmMap {
            segs: Vec::new(),
            total: 0,
            refcnt: 1,
        }))
    }

    pub fn vm_reference(&mut self, map: MapId) {
        self.maps.get_mut(map).expect("vm_reference: stale map").refcnt += 1;
    }

    pub fn vm_terminate(&mut self, map_id: MapId) {
        let map = self.maps.get_mut(map_id).expect("vm_terminate: stale map");
        map.refcnt -= 1;
        if map.refcnt > 0 {
            return;
        }
        while let Some(seg) = {
            let map = self.maps.get_mut(map_id).unwrap();
            map.segs.pop()
        } {
            self.release_record(seg);
        }
        self.maps.remove(map_id);
    }

    pub(crate) fn vm_switch(&self, _map: MapId) {}

    pub fn vm_allocate(
        &mut self,
        task: TaskId,
        addr: Vaddr,
        size: usize,
        anywhere: bool,
    ) -> Result<Vaddr> {
        self.sched_lock();
        let r = (|| {
            let map = self.vm_target(task)?;
            if !anywhere && !user_area(addr, size) {
                return Err(Errno::EACCES);
            }
            self.do_allocate(map, addr, size, anywhere)
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn do_allocate(
        &mut self,
        map_id: MapId,
        addr: Vaddr,
        size: usize,
        anywhere: bool,
    ) -> Result<Vaddr> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        if self.maps.get(map_id).ok_or(Errno::EINVAL)?.total + size >= MAXMEM {
            return Err(Errno::ENOMEM);
        }

        let (pa, size) = if anywhere {
            let size = round_page(size);
            (self.pages.alloc(size)?, size)
        } else {
            let start = trunc_page(addr as usize);
            let end = round_page(start + size);
            let size = end - start;
            self.pages.reserve(start as Paddr, size)?;
            (start as Paddr, size)
        };

        let map = self.maps.get_mut(map_id).unwrap();
        map.segs.push(Seg {
            addr: pa,
            size,
            phys: pa,
            flags: SegFlags::READ | SegFlags::WRITE,
            share: None,
        });
        map.total += size;
        unsafe { core::ptr::write_bytes(self.machine.ptokv(pa), 0, size) };
        Ok(pa)
    }

    pub fn vm_free(&mut self, task: TaskId, addr: Vaddr) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            let map = self.vm_target(task)?;
            if !user_area(addr, 1) {
                return Err(Errno::EFAULT);
            }
            self.do_free(map, addr)
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn do_free(&mut self, map_id: MapId, addr: Vaddr) -> Result<()> {
        let va = trunc_page(addr as usize) as u64;
        let map = self.maps.get_mut(map_id).ok_or(Errno::EINVAL)?;
        let idx = map
            .segs
            .iter()
            .position(|s| s.addr == va && !s.is_free())
            .ok_or(Errno::EINVAL)?;
        let seg = map.segs.remove(idx);
        map.total -= seg.size;
        self.release_record(seg);
        Ok(())
    }

    /// Give a removed record's pages back iff no other record holds them.
    fn release_record(&mut self, seg: Seg) {
        let owns_pages = match seg.share {
            None => !seg.flags.contains(SegFlags::MAPPED),
            Some(_) => self.share_dissolve(seg.share) == 0,
        };
        if owns_pages {
            self.pages.free(seg.phys, seg.size);
        }
    }

    pub fn vm_attribute(&mut self, task: TaskId, addr: Vaddr, prot: Prot) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            if prot.is_empty() || prot.contains(Prot::EXEC) {
                return Err(Errno::EINVAL);
            }
            let map = self.vm_target(task)?;
            if !user_area(addr, 1) {
                return Err(Errno::EFAULT);
            }
            self.do_attribute(map, addr, prot)
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn do_attribute(&mut self, map_id: MapId, addr: Vaddr, prot: Prot) -> Result<()> {
        let va = trunc_page(addr as usize) as u64;
        let map = self.maps.get_mut(map_id).ok_or(Errno::EINVAL)?;
        let seg = map
            .segs
            .iter_mut()
            .find(|s| s.addr == va && !s.is_free())
            .ok_or(Errno::EINVAL)?;
        // without page protection a shared or mapped range cannot change
        if seg.flags.contains(SegFlags::MAPPED) || seg.flags.contains(SegFlags::SHARED) {
            return Err(Errno::EINVAL);
        }
        let new_flags = if seg.flags.contains(SegFlags::WRITE) {
            if !prot.contains(Prot::WRITE) {
                SegFlags::READ
            } else {
                return Ok(());
            }
        } else if prot.contains(Prot::WRITE) {
            SegFlags::READ | SegFlags::WRITE
        } else {
            return Ok(());
        };
        seg.flags = new_flags;
        Ok(())
    }

    pub fn vm_map(&mut self, target: TaskId, addr: Vaddr, size: usize) -> Result<Vaddr> {
        self.sched_lock();
        let r = (|| {
            if !self.tasks.contains(target) {
                return Err(Errno::ESRCH);
            }
            let curtask = self.cur().task;
            if target == curtask {
                return Err(Errno::EINVAL);
            }
            if !self.task_capable(CapSet::EXTMEM) {
                return Err(Errno::EPERM);
            }
            if !user_area(addr, size) {
                return Err(Errno::EFAULT);
            }
            let tgt_map = self.tasks.get(target).unwrap().map;
            let cur_map = self.tasks.get(curtask).unwrap().map;
            self.do_map(tgt_map, addr, size, cur_map)
        })();
        self.sched_unlock();
        r
    }

    pub(crate) fn do_map(
        &mut self,
        tgt_id: MapId,
        addr: Vaddr,
        size: usize,
        cur_id: MapId,
    ) -> Result<Vaddr> {
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        let start = trunc_page(addr as usize) as u64;
        let end = round_page(addr as usize + size);
        let size = end - start as usize;

        let (tgt, cur) = self.maps.get2_mut(tgt_id, cur_id).ok_or(Errno::EINVAL)?;
        if cur.total + size >= MAXMEM {
            return Err(Errno::ENOMEM);
        }
        let donor = tgt
            .segs
            .iter_mut()
            .find(|s| s.contains(start, size) && !s.is_free())
            .ok_or(Errno::EINVAL)?;

        // tie donor and recipient into one share group so that neither
        // side's free path releases the pages under the other
        let group = donor.share.unwrap_or(self.next_share + 1);
        if donor.share.is_none() {
            self.next_share += 1;
            donor.share = Some(group);
        }
        donor.flags |= SegFlags::SHARED;
        let flags = (donor.flags - SegFlags::FREE) | SegFlags::MAPPED;

        cur.segs.push(Seg {
            addr: start,
            size,
            phys: start,
            flags,
            share: Some(group),
        });
        cur.total += size;
        Ok(addr)
    }

    /// vm_dup is not supported without an MMU.
    pub fn vm_dup(&mut self, _org: MapId) -> Result<MapId> {
        Err(Errno::EINVAL)
    }

    pub fn vm_translate(&self, va: Vaddr, _size: usize) -> Option<Paddr> {
        Some(va)
    }

    pub fn kmem_map_user(&self, va: Vaddr, size: usize) -> Option<*mut u8> {
        let pa = self.vm_translate(va, size)?;
        Some(self.machine.ptokv(pa))
    }

    /// Boot task images are already at their link addresses; just record
    /// the reservation, clear bss and allocate a stack.
    pub fn vm_load(&mut self, map_id: MapId, module: &Module) -> Result<Vaddr> {
        log::debug!("loading task: {}", module.name_str());
        let size = (module.textsz + module.datasz + module.bsssz) as usize;
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        let start = trunc_page(module.text as usize);
        let end = round_page(start + size);
        let size = end - start;

        self.pages.reserve(start as Paddr, size)?;
        let map = self.maps.get_mut(map_id).ok_or(Errno::EINVAL)?;
        map.segs.push(Seg {
            addr: start as Vaddr,
            size,
            phys: start as Paddr,
            flags: SegFlags::READ | SegFlags::WRITE,
            share: None,
        });
        map.total += size;

        if module.bsssz != 0 {
            unsafe {
                core::ptr::write_bytes(
                    self.machine.ptokv(module.data + module.datasz),
                    0,
                    module.bsssz as usize,
                );
            }
        }
        self.do_allocate(map_id, 0, DFLSTKSZ, true)
    }

    pub fn vm_total(&self, task: TaskId) -> usize {
        self.tasks
            .get(task)
            .and_then(|t| self.maps.get(t.map))
            .map_or(0, |m| m.total)
    }

    /// Drop one membership from a share group. When one member remains,
    /// the group dissolves and the survivor becomes the page owner.
    /// Returns the number of surviving members.
    fn share_dissolve(&mut self, group: Option<ShareId>) -> usize {
        let Some(group) = group else { return 0 };
        let mut survivors = 0;
        let mut last = None;
        for (mid, map) in self.maps.iter() {
            for (i, s) in map.segs.iter().enumerate() {
                if s.share == Some(group) {
                    survivors += 1;
                    last = Some((mid, i));
                }
            }
        }
        if survivors == 1 {
            let (mid, i) = last.unwrap();
            let s = &mut self.maps.get_mut(mid).unwrap().segs[i];
            s.share = None;
            s.flags -= SegFlags::SHARED | SegFlags::MAPPED;
            s.phys = s.addr;
        }
        survivors
    }

    fn vm_target(&mut self, task: TaskId) -> Result<MapId> {
        if !self.tasks.contains(task) {
            return Err(Errno::ESRCH);
        }
        if task != self.cur().task && !self.task_capable(CapSet::EXTMEM) {
            return Err(Errno::EPERM);
        }
        Ok(self.tasks.get(task).unwrap().map)
    }
}
