//! Test double for the machine layer.
//!
//! Emulates a uniprocessor: every kernel context is backed by a host
//! thread, and a single CPU token moves between them in
//! `context_switch`. A parked host thread is exactly a switched-out
//! kernel thread, so the scheduler's real switching, sleeping and
//! preemption paths run unchanged under `cargo test`.
//!
//! "Physical" memory is one page-aligned allocation; the MMU is a map of
//! page tables over it, and user copies resolve through the page table
//! the kernel last switched to, faulting on unmapped or read-only pages
//! like the real thing.

use super::{Context, CtxReg, IsrFn, MachineOps, MapType, Paddr, Pgd, Spl, Vaddr};
use crate::error::{Errno, Result};
use crate::param::{PAGE_SIZE, PAGE_MASK};
use std::boxed::Box;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::vec::Vec;

// Context word layout used by the mock.
const W_ID: usize = 0;
const W_REG0: usize = 1; // KStack, KEntry, KArg, UEntry, UStack, UArg
const W_SAVE0: usize = 8;
const NREGS: usize = 6;

fn reg_slot(reg: CtxReg) -> usize {
    W_REG0
        + match reg {
            CtxReg::KStack => 0,
            CtxReg::KEntry => 1,
            CtxReg::KArg => 2,
            CtxReg::UEntry => 3,
            CtxReg::UStack => 4,
            CtxReg::UArg => 5,
        }
}

struct CtxShared {
    run: Mutex<bool>,
    cv: Condvar,
    started: AtomicBool,
}

impl CtxShared {
    fn new() -> Self {
        Self {
            run: Mutex::new(false),
            cv: Condvar::new(),
            started: AtomicBool::new(false),
        }
    }

    fn give_token(&self) {
        let mut run = self.run.lock().unwrap();
        *run = true;
        self.cv.notify_one();
    }

    fn wait_token(&self) {
        let mut run = self.run.lock().unwrap();
        while !*run {
            run = self.cv.wait(run).unwrap();
        }
        *run = false;
    }
}

#[derive(Clone, Copy)]
struct Pte {
    pa: u64,
    writable: bool,
}

pub struct MockMachine {
    phys_base: u64,
    phys: *mut u8,
    phys_size: usize,
    pgds: Mutex<HashMap<u64, BTreeMap<u64, Pte>>>,
    current_pgd: AtomicU64,
    ctxs: Mutex<HashMap<usize, Arc<CtxShared>>>,
    next_ctx: AtomicUsize,
    next_pgd: AtomicU64,
    spl_depth: AtomicUsize,
    pub switches: AtomicUsize,
    pub powered_down: AtomicBool,
}

unsafe impl Send for MockMachine {}
unsafe impl Sync for MockMachine {}

fn mock_user_return(_arg: usize) {
    panic!("mock: a thread entered user mode");
}

impl MockMachine {
    /// A machine with `phys_size` bytes of RAM, leaked for `'static`.
    pub fn leaked(phys_size: usize) -> &'static MockMachine {
        let layout = std::alloc::Layout::from_size_align(phys_size, PAGE_SIZE).unwrap();
        let phys = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!phys.is_null());
        Box::leak(Box::new(MockMachine {
            phys_base: 0x0010_0000,
            phys,
            phys_size,
            pgds: Mutex::new(HashMap::new()),
            current_pgd: AtomicU64::new(0),
            ctxs: Mutex::new(HashMap::new()),
            next_ctx: AtomicUsize::new(0),
            next_pgd: AtomicU64::new(0),
            spl_depth: AtomicUsize::new(0),
            switches: AtomicUsize::new(0),
            powered_down: AtomicBool::new(false),
        }))
    }

    pub fn ram_regions(&self) -> [api::RamRegion; 1] {
        [api::RamRegion {
            base: self.phys_base,
            size: self.phys_size as u64,
            usable: true,
        }]
    }

    fn ensure_ctx(&self, ctx: &mut Context) -> usize {
        if ctx.words[W_ID] == 0 {
            ctx.words[W_ID] = self.next_ctx.fetch_add(1, Ordering::SeqCst) + 1;
        }
        ctx.words[W_ID]
    }

    fn shared(&self, id: usize) -> Arc<CtxShared> {
        self.ctxs
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(CtxShared::new()))
            .clone()
    }

    /// Resolve one user virtual address through the active page table.
    fn resolve(&self, va: Vaddr, write: bool) -> Result<*mut u8> {
        let pgd = self.current_pgd.load(Ordering::SeqCst);
        let pgds = self.pgds.lock().unwrap();
        let table = pgds.get(&pgd).ok_or(Errno::EFAULT)?;
        let pte = table.get(&(va & !(PAGE_MASK as u64))).ok_or(Errno::EFAULT)?;
        if write && !pte.writable {
            return Err(Errno::EFAULT);
        }
        let pa = pte.pa + (va & PAGE_MASK as u64);
        drop(pgds);
        Ok(self.pa_ptr(pa))
    }

    fn pa_ptr(&self, pa: Paddr) -> *mut u8 {
        assert!(
            pa >= self.phys_base && pa < self.phys_base + self.phys_size as u64,
            "mock: physical address {:#x} outside RAM",
            pa
        );
        unsafe { self.phys.add((pa - self.phys_base) as usize) }
    }

    /// Test helper: peek at user memory of an arbitrary address space.
    pub fn read_user(&self, pgd: Pgd, va: Vaddr, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let pgds = self.pgds.lock().unwrap();
        let table = pgds.get(&pgd.0).expect("read_user: no such pgd");
        for i in 0..len as u64 {
            let pte = table
                .get(&((va + i) & !(PAGE_MASK as u64)))
                .expect("read_user: unmapped");
            let pa = pte.pa + ((va + i) & PAGE_MASK as u64);
            out.push(unsafe { *self.pa_ptr(pa) });
        }
        out
    }

    /// Test helper: poke user memory of an arbitrary address space.
    pub fn write_user(&self, pgd: Pgd, va: Vaddr, bytes: &[u8]) {
        let pgds = self.pgds.lock().unwrap();
        let table = pgds.get(&pgd.0).expect("write_user: no such pgd");
        for (i, &b) in bytes.iter().enumerate() {
            let i = i as u64;
            let pte = table
                .get(&((va + i) & !(PAGE_MASK as u64)))
                .expect("write_user: unmapped");
            let pa = pte.pa + ((va + i) & PAGE_MASK as u64);
            unsafe { *self.pa_ptr(pa) = b };
        }
    }
}

impl MachineOps for MockMachine {
    fn context_set(&self, ctx: &mut Context, reg: CtxReg, val: usize) {
        self.ensure_ctx(ctx);
        ctx.words[reg_slot(reg)] = val;
    }

    fn context_switch(&self, prev: &mut Context, next: &mut Context) {
        let pid = self.ensure_ctx(prev);
        let nid = self.ensure_ctx(next);
        if pid == nid {
            return;
        }
        self.switches.fetch_add(1, Ordering::SeqCst);

        let p = self.shared(pid);
        let n = self.shared(nid);
        p.started.store(true, Ordering::SeqCst);

        if !n.started.swap(true, Ordering::SeqCst) {
            // first switch into this context: materialize it as a host
            // thread running its kernel entry
            let entry_word = next.words[reg_slot(CtxReg::KEntry)];
            let arg = next.words[reg_slot(CtxReg::KArg)];
            assert!(entry_word != 0, "mock: switch to context without entry");
            let entry: fn(usize) = unsafe { core::mem::transmute(entry_word) };
            let n2 = Arc::clone(&n);
            std::thread::Builder::new()
                .name(std::format!("mockctx-{}", nid))
                .spawn(move || {
                    n2.wait_token();
                    entry(arg);
                    panic!("mock: kernel thread entry returned");
                })
                .unwrap();
        }

        n.give_token();
        p.wait_token();
    }

    fn context_save(&self, ctx: &mut Context) {
        for i in 0..NREGS {
            ctx.words[W_SAVE0 + i] = ctx.words[W_REG0 + i];
        }
    }

    fn context_restore(&self, ctx: &mut Context) {
        for i in 0..NREGS {
            ctx.words[W_REG0 + i] = ctx.words[W_SAVE0 + i];
        }
    }

    fn syscall_trampoline(&self) -> usize {
        mock_user_return as usize
    }

    fn splhigh(&self) -> Spl {
        self.spl_depth.fetch_add(1, Ordering::SeqCst)
    }

    fn spl0(&self) -> Spl {
        self.spl_depth.swap(0, Ordering::SeqCst)
    }

    fn splx(&self, s: Spl) {
        self.spl_depth.store(s, Ordering::SeqCst);
    }

    fn irq_attach(&self, _irq: u32, _isr: IsrFn, _arg: usize) -> Result<()> {
        Ok(())
    }

    fn irq_detach(&self, _irq: u32) {}

    fn mmu_newmap(&self) -> Option<Pgd> {
        let id = self.next_pgd.fetch_add(1, Ordering::SeqCst) + 1;
        self.pgds.lock().unwrap().insert(id, BTreeMap::new());
        Some(Pgd(id))
    }

    fn mmu_terminate(&self, pgd: Pgd) {
        self.pgds.lock().unwrap().remove(&pgd.0);
    }

    fn mmu_map(&self, pgd: Pgd, pa: Paddr, va: Vaddr, size: usize, ty: MapType) -> Result<()> {
        let mut pgds = self.pgds.lock().unwrap();
        let table = pgds.get_mut(&pgd.0).ok_or(Errno::EINVAL)?;
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages as u64 {
            let vp = (va & !(PAGE_MASK as u64)) + i * PAGE_SIZE as u64;
            match ty {
                MapType::Unmap => {
                    table.remove(&vp);
                }
                MapType::Read | MapType::Write => {
                    table.insert(
                        vp,
                        Pte {
                            pa: pa + i * PAGE_SIZE as u64,
                            writable: ty == MapType::Write,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn mmu_switch(&self, pgd: Pgd) {
        self.current_pgd.store(pgd.0, Ordering::SeqCst);
    }

    fn mmu_extract(&self, pgd: Pgd, va: Vaddr, size: usize) -> Option<Paddr> {
        let pgds = self.pgds.lock().unwrap();
        let table = pgds.get(&pgd.0)?;
        let first = table.get(&(va & !(PAGE_MASK as u64)))?;
        let base = first.pa + (va & PAGE_MASK as u64);
        // the range must be mapped physically contiguously
        let end = va + size as u64;
        let mut vp = (va & !(PAGE_MASK as u64)) + PAGE_SIZE as u64;
        while vp < end {
            let pte = table.get(&vp)?;
            if pte.pa != first.pa + (vp - (va & !(PAGE_MASK as u64))) {
                return None;
            }
            vp += PAGE_SIZE as u64;
        }
        Some(base)
    }

    fn ptokv(&self, pa: Paddr) -> *mut u8 {
        self.pa_ptr(pa)
    }

    fn kvtop(&self, kv: *const u8) -> Paddr {
        let off = kv as usize - self.phys as usize;
        assert!(off < self.phys_size);
        self.phys_base + off as u64
    }

    fn copyin(&self, uaddr: Vaddr, buf: &mut [u8]) -> Result<()> {
        for (i, b) in buf.iter_mut().enumerate() {
            let p = self.resolve(uaddr + i as u64, false)?;
            *b = unsafe { *p };
        }
        Ok(())
    }

    fn copyout(&self, buf: &[u8], uaddr: Vaddr) -> Result<()> {
        for (i, &b) in buf.iter().enumerate() {
            let p = self.resolve(uaddr + i as u64, true)?;
            unsafe { *p = b };
        }
        Ok(())
    }

    fn copyinstr(&self, uaddr: Vaddr, buf: &mut [u8]) -> Result<usize> {
        for i in 0..buf.len() {
            let p = self.resolve(uaddr + i as u64, false)?;
            let b = unsafe { *p };
            buf[i] = b;
            if b == 0 {
                return Ok(i);
            }
        }
        Err(Errno::ENAMETOOLONG)
    }

    fn machine_idle(&self) {
        std::thread::yield_now();
    }

    fn machine_powerdown(&self) {
        self.powered_down.store(true, Ordering::SeqCst);
    }
}
