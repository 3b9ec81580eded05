//! Kestrel kernel core.
//!
//! A small preemptive, fixed-priority real-time kernel for uniprocessor
//! machines: tasks, threads, a 256-level scheduler with deferred procedure
//! calls, synchronous message-passing IPC, per-task virtual memory, kernel
//! timers, and mutexes with priority inheritance.
//!
//! The board support layer is not part of this crate. Everything the core
//! needs from the hardware is consumed through [`machine::MachineOps`]; the
//! platform crate implements it, calls [`kern::kernel_main`] with the boot
//! information, and routes its clock and trap vectors into the entry points
//! on [`kern::Kernel`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod device;
pub mod error;
pub mod event;
pub mod exception;
pub mod ipc;
pub mod kern;
pub mod machine;
pub mod memory;
pub mod multitasking;
pub mod param;
pub mod sync;
pub mod syscall;
pub mod timer;

// The scenario suite drives the MMU build; the no-MMU variant is still
// covered by the per-module unit tests.
#[cfg(all(test, feature = "mmu"))]
mod tests;

pub use error::Result;
pub use kern::Kernel;
