pub mod kmem;
pub mod page;
pub mod seg;

#[cfg(feature = "mmu")]
pub mod vm;
#[cfg(not(feature = "mmu"))]
#[path = "vm_nommu.rs"]
pub mod vm;
