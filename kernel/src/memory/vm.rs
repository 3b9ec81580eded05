//! Virtual memory manager, MMU variant.
//!
//! Each task owns a reference-counted address space: a page directory plus
//! the segment list over the user window. Physical pages always stay
//! resident (there is no pageout), so segment memory can be reached through
//! the kernel window at any time; that is what makes IPC message copies and
//! `vm_dup` plain memcpys.

use crate::error::{Errno, Result};
use crate::kern::Kernel;
use crate::machine::{MapType, Paddr, Pgd, Vaddr};
use crate::memory::seg::{Seg, SegFlags, SegList};
use crate::multitasking::task::TaskId;
use crate::param::{round_page, trunc_page, DFLSTKSZ, MAXMEM, USERBASE, USERLIMIT, USRSTACK};
use api::{CapSet, Module, Prot};
use util::slab::Handle;

pub type MapId = Handle<VmMap>;

pub struct VmMap {
    pub pgd: Pgd,
    pub segs: SegList,
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
    /// Set up the kernel's own mapping. First of the VM entry points to run.
    pub(crate) fn vm_init(&mut self) {
        let pgd = self.machine.mmu_newmap().expect("vm_init: no page directory");
        self.machine.mmu_switch(pgd);
        self.kernel_map = self.maps.insert(VmMap {
            pgd,
            segs: SegList::new(USERBASE, (USERLIMIT - USERBASE) as usize),
            total: 0,
            refcnt: 1,
        });
    }

    /// Create a fresh, empty address space.
    pub fn vm_create(&mut self) -> Result<MapId> {
        let pgd = self.machine.mmu_newmap().ok_or(Errno::ENOMEM)?;
        Ok(self.maps.insert(VmMap {
            pgd,
            segs: SegList::new(USERBASE, (USERLIMIT - USERBASE) as usize),
            total: 0,
            refcnt: 1,
        }))
    }

    pub fn vm_reference(&mut self, map: MapId) {
        self.maps.get_mut(map).expect("vm_reference: stale map").refcnt += 1;
    }

    /// Drop one reference; on the last one unmap and release everything.
    pub fn vm_terminate(&mut self, map_id: MapId) {
        let map = self.maps.get_mut(map_id).expect("vm_terminate: stale map");
        map.refcnt -= 1;
        if map.refcnt > 0 {
            return;
        }

        let machine = self.machine;
        for i in 0..self.maps.get(map_id).unwrap().segs.segs.len() {
            let seg = self.maps.get(map_id).unwrap().segs.segs[i].clone();
            if seg.is_free() {
                continue;
            }
            let _ = machine.mmu_map(
                self.maps.get(map_id).unwrap().pgd,
                seg.phys,
                seg.addr,
                seg.size,
                MapType::Unmap,
            );
            self.share_detach(map_id, i);
            if !seg.flags.contains(SegFlags::SHARED) && !seg.flags.contains(SegFlags::MAPPED) {
                self.pages.free(seg.phys, seg.size);
            }
        }

        // switch away before tearing down the directory we may be on
        let pgd = self.maps.get(map_id).unwrap().pgd;
        if self
            .tasks
            .get(self.cur().task)
            .map_or(false, |t| t.map == map_id)
        {
            let kpgd = self.maps.get(self.kernel_map).unwrap().pgd;
            machine.mmu_switch(kpgd);
        }
        machine.mmu_terminate(pgd);
        self.maps.remove(map_id);
    }

    /// Install the address space of the next thread's task.
    pub(crate) fn vm_switch(&self, map_id: MapId) {
        if map_id != self.kernel_map {
            if let Some(map) = self.maps.get(map_id) {
                self.machine.mmu_switch(map.pgd);
            }
        }
    }

    /// vm_allocate - allocate zero-filled memory in `task`'s space.
    ///
    /// With `anywhere` the placement is chosen by the kernel, otherwise
    /// `addr` (rounded to page boundaries) is reserved exactly.
    pub fn vm_allocate(
        &mut self,
        task: TaskId,
        addr: Vaddr,
        size: usize,
        anywhere: bool,
    ) -> Result<Vaddr> {
        self.sched_lock();
        let r = self.vm_allocate_locked(task, addr, size, anywhere);
        self.sched_unlock();
        r
    }

    fn vm_allocate_locked(
        &mut self,
        task: TaskId,
        addr: Vaddr,
        size: usize,
        anywhere: bool,
    ) -> Result<Vaddr> {
        let map = self.vm_target(task)?;
        if !anywhere && !user_area(addr, size) {
            return Err(Errno::EACCES);
        }
        self.do_allocate(map, addr, size, anywhere)
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
        let machine = self.machine;
        let map = self.maps.get_mut(map_id).ok_or(Errno::EINVAL)?;
        if map.total + size >= MAXMEM {
            return Err(Errno::ENOMEM);
        }

        let (idx, size) = if anywhere {
            let size = round_page(size);
            (map.segs.alloc(size).ok_or(Errno::ENOMEM)?, size)
        } else {
            let start = trunc_page(addr as usize) as u64;
            let end = round_page(addr as usize + size);
            let size = end - start as usize;
            (map.segs.reserve(start, size).ok_or(Errno::ENOMEM)?, size)
        };
        map.segs.segs[idx].flags = SegFlags::READ | SegFlags::WRITE;
        let va = map.segs.segs[idx].addr;
        let pgd = map.pgd;

        let pa = match self.pages.alloc(size) {
            Ok(pa) => pa,
            Err(e) => {
                self.maps.get_mut(map_id).unwrap().segs.free(idx);
                return Err(e);
            }
        };
        if machine.mmu_map(pgd, pa, va, size, MapType::Write).is_err() {
            self.pages.free(pa, size);
            self.maps.get_mut(map_id).unwrap().segs.free(idx);
            return Err(Errno::ENOMEM);
        }

        let map = self.maps.get_mut(map_id).unwrap();
        map.segs.segs[idx].phys = pa;
        map.total += size;
        unsafe { core::ptr::write_bytes(machine.ptokv(pa), 0, size) };
        Ok(va)
    }

    /// vm_free - release the segment previously allocated or mapped at `addr`.
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
        let machine = self.machine;
        let va = trunc_page(addr as usize) as u64;
        let map = self.maps.get_mut(map_id).ok_or(Errno::EINVAL)?;
        let idx = map.segs.lookup(va, 1).ok_or(Errno::EINVAL)?;
        let seg = map.segs.segs[idx].clone();
        if seg.addr != va || seg.is_free() {
            return Err(Errno::EINVAL);
        }

        let _ = machine.mmu_map(map.pgd, seg.phys, seg.addr, seg.size, MapType::Unmap);
        self.share_detach(map_id, idx);
        if !seg.flags.contains(SegFlags::SHARED) && !seg.flags.contains(SegFlags::MAPPED) {
            self.pages.free(seg.phys, seg.size);
        }

        let map = self.maps.get_mut(map_id).unwrap();
        map.total -= seg.size;
        map.segs.free(idx);
        Ok(())
    }

    /// vm_attribute - change protection of an allocated segment.
    ///
    /// Shrinking a shared segment to read-write breaks the share: the
    /// segment gets its own copy of the pages and leaves the group.
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
        let machine = self.machine;
        let va = trunc_page(addr as usize) as u64;
        let map = self.maps.get_mut(map_id).ok_or(Errno::EINVAL)?;
        let idx = map.segs.lookup(va, 1).ok_or(Errno::EINVAL)?;
        let seg = map.segs.segs[idx].clone();
        if seg.addr != va || seg.is_free() {
            return Err(Errno::EINVAL);
        }
        if seg.flags.contains(SegFlags::MAPPED) {
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
        let map_type = if new_flags.contains(SegFlags::WRITE) {
            MapType::Write
        } else {
            MapType::Read
        };

        if seg.flags.contains(SegFlags::SHARED) {
            // copy-on-write break: private pages, then leave the group
            let new_pa = self.pages.alloc(seg.size)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    machine.ptokv(seg.phys),
                    machine.ptokv(new_pa),
                    seg.size,
                );
            }
            let pgd = self.maps.get(map_id).unwrap().pgd;
            if machine.mmu_map(pgd, new_pa, seg.addr, seg.size, map_type).is_err() {
                self.pages.free(new_pa, seg.size);
                return Err(Errno::ENOMEM);
            }
            self.maps.get_mut(map_id).unwrap().segs.segs[idx].phys = new_pa;
            self.share_detach(map_id, idx);
        } else {
            machine
                .mmu_map(map.pgd, seg.phys, seg.addr, seg.size, map_type)
                .map_err(|_| Errno::ENOMEM)?;
        }
        self.maps.get_mut(map_id).unwrap().segs.segs[idx].flags = new_flags;
        Ok(())
    }

    /// vm_map - map a range of `target`'s memory into the current task.
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
        let machine = self.machine;
        let start = trunc_page(addr as usize) as u64;
        let end = round_page(addr as usize + size);
        let size = end - start as usize;
        let offset = addr - start;

        let (tgt, cur) = self.maps.get2_mut(tgt_id, cur_id).ok_or(Errno::EINVAL)?;
        if cur.total + size >= MAXMEM {
            return Err(Errno::ENOMEM);
        }
        let tgt_idx = tgt.segs.lookup(start, size).ok_or(Errno::EINVAL)?;
        let tseg = tgt.segs.segs[tgt_idx].clone();
        if tseg.is_free() {
            return Err(Errno::EINVAL);
        }

        let idx = cur.segs.alloc(size).ok_or(Errno::ENOMEM)?;
        let map_type = if tseg.flags.contains(SegFlags::WRITE) {
            MapType::Write
        } else {
            MapType::Read
        };
        let pa = tseg.phys + (start - tseg.addr);
        let va = cur.segs.segs[idx].addr;
        if machine.mmu_map(cur.pgd, pa, va, size, map_type).is_err() {
            cur.segs.free(idx);
            return Err(Errno::ENOMEM);
        }

        let seg = &mut cur.segs.segs[idx];
        seg.flags = (tseg.flags - SegFlags::SHARED) | SegFlags::MAPPED;
        seg.phys = pa;
        cur.total += size;
        Ok(va + offset)
    }

    /// vm_dup - deep-copy an address space for `task_create(COPY)`.
    ///
    /// Read-only, non-mapped segments stay physically shared between the
    /// two maps; everything else gets freshly allocated pages holding a
    /// copy of the source bytes.
    pub fn vm_dup(&mut self, org_id: MapId) -> Result<MapId> {
        self.sched_lock();
        let r = self.do_dup(org_id);
        self.sched_unlock();
        r
    }

    fn do_dup(&mut self, org_id: MapId) -> Result<MapId> {
        let machine = self.machine;
        let new_id = self.vm_create()?;

        let org = self.maps.get(org_id).ok_or(Errno::EINVAL)?;
        let segs = org.segs.clone();
        let total = org.total;
        let nsegs = segs.segs.len();
        {
            let new = self.maps.get_mut(new_id).unwrap();
            new.segs = segs;
            new.total = total;
        }

        for i in 0..nsegs {
            let src = self.maps.get(org_id).unwrap().segs.segs[i].clone();
            if src.is_free() {
                continue;
            }
            let shareable =
                !src.flags.contains(SegFlags::WRITE) && !src.flags.contains(SegFlags::MAPPED);
            if shareable {
                self.share_join(org_id, i, new_id, i);
            } else {
                let pa = match self.pages.alloc(src.size) {
                    Ok(pa) => pa,
                    Err(e) => {
                        self.vm_terminate(new_id);
                        return Err(e);
                    }
                };
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        machine.ptokv(src.phys),
                        machine.ptokv(pa),
                        src.size,
                    );
                }
                let seg = &mut self.maps.get_mut(new_id).unwrap().segs.segs[i];
                seg.phys = pa;
                seg.share = None;
                seg.flags -= SegFlags::SHARED | SegFlags::MAPPED;
            }

            let new = self.maps.get(new_id).unwrap();
            let dseg = new.segs.segs[i].clone();
            let map_type = if dseg.flags.contains(SegFlags::WRITE) {
                MapType::Write
            } else {
                MapType::Read
            };
            if machine
                .mmu_map(new.pgd, dseg.phys, dseg.addr, dseg.size, map_type)
                .is_err()
            {
                self.vm_terminate(new_id);
                return Err(Errno::ENOMEM);
            }
        }
        Ok(new_id)
    }

    /// Attach two segments to one share group (creating it if needed).
    fn share_join(&mut self, a_map: MapId, a_idx: usize, b_map: MapId, b_idx: usize) {
        let group = {
            let a = &mut self.maps.get_mut(a_map).unwrap().segs.segs[a_idx];
            let g = a.share.unwrap_or_else(|| {
                self.next_share += 1;
                self.next_share
            });
            a.share = Some(g);
            a.flags |= SegFlags::SHARED;
            g
        };
        let b = &mut self.maps.get_mut(b_map).unwrap().segs.segs[b_idx];
        b.share = Some(group);
        b.flags |= SegFlags::SHARED;
    }

    /// Remove a segment from its share group; when a single member
    /// remains, the group dissolves and that member owns the pages again.
    pub(crate) fn share_detach(&mut self, map_id: MapId, idx: usize) {
        let seg = &mut self.maps.get_mut(map_id).unwrap().segs.segs[idx];
        let Some(group) = seg.share else {
            return;
        };
        seg.share = None;
        seg.flags -= SegFlags::SHARED;

        let mut survivors = 0;
        let mut last = None;
        for (mid, map) in self.maps.iter() {
            for (i, s) in map.segs.segs.iter().enumerate() {
                if s.share == Some(group) {
                    survivors += 1;
                    last = Some((mid, i));
                }
            }
        }
        if survivors == 1 {
            let (mid, i) = last.unwrap();
            let s = &mut self.maps.get_mut(mid).unwrap().segs.segs[i];
            s.share = None;
            s.flags -= SegFlags::SHARED;
        }
    }

    /// Resolve a user range of the current task to its physical base.
    pub fn vm_translate(&self, va: Vaddr, size: usize) -> Option<Paddr> {
        let map = self.tasks.get(self.cur().task)?.map;
        self.machine.mmu_extract(self.maps.get(map)?.pgd, va, size)
    }

    /// Map a user range of the current task into the kernel window.
    pub fn kmem_map_user(&self, va: Vaddr, size: usize) -> Option<*mut u8> {
        let pa = self.vm_translate(va, size)?;
        Some(self.machine.ptokv(pa))
    }

    /// Load a boot task image: text (read-only), data+bss, stack. Returns
    /// the stack base. The original image pages are released.
    pub fn vm_load(&mut self, map_id: MapId, module: &Module) -> Result<Vaddr> {
        log::debug!("loading task: {}", module.name_str());
        let machine = self.machine;

        self.do_allocate(map_id, module.text, module.textsz as usize, false)?;
        let idx = self
            .maps
            .get(map_id)
            .unwrap()
            .segs
            .lookup(trunc_page(module.text as usize) as u64, 1)
            .unwrap();
        let text_pa = self.maps.get(map_id).unwrap().segs.segs[idx].phys;
        unsafe {
            core::ptr::copy_nonoverlapping(
                machine.ptokv(module.phys),
                machine.ptokv(text_pa),
                module.textsz as usize,
            );
        }
        self.do_attribute(map_id, module.text, Prot::READ)?;

        if module.datasz + module.bsssz != 0 {
            self.do_allocate(
                map_id,
                module.data,
                (module.datasz + module.bsssz) as usize,
                false,
            )?;
            if module.datasz > 0 {
                let idx = self
                    .maps
                    .get(map_id)
                    .unwrap()
                    .segs
                    .lookup(trunc_page(module.data as usize) as u64, 1)
                    .unwrap();
                let data_pa = self.maps.get(map_id).unwrap().segs.segs[idx].phys;
                let src = module.phys + (module.data - module.text);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        machine.ptokv(src),
                        machine.ptokv(data_pa),
                        module.datasz as usize,
                    );
                }
            }
        }

        self.do_allocate(map_id, USRSTACK, DFLSTKSZ, false)?;
        self.pages.free(module.phys, module.size as usize);
        Ok(USRSTACK)
    }

    /// Total mapped bytes of a task, for `sys_info` and the test audits.
    pub fn vm_total(&self, task: TaskId) -> usize {
        self.tasks
            .get(task)
            .and_then(|t| self.maps.get(t.map))
            .map_or(0, |m| m.total)
    }

    /// Common target checks of the vm_* family.
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
