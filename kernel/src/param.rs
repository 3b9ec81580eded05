//! Compile-time kernel parameters.

/// Clock tick rate.
pub const HZ: u32 = 1000;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

pub const fn round_page(n: usize) -> usize {
    (n + PAGE_MASK) & !PAGE_MASK
}

pub const fn trunc_page(n: usize) -> usize {
    n & !PAGE_MASK
}

/// Round-robin time slice in milliseconds.
pub const TIME_SLICE: u32 = 50;

/// Kernel stack size per thread. Must fit in a single kernel heap block.
pub const KSTACKSZ: usize = 2048;

/// Priority of the timer dispatch thread.
pub const PRI_TIMER: i32 = 15;
/// Priority of the DPC thread.
pub const PRI_DPC: i32 = 33;

/// Fail-safe bound on priority-inheritance chain walks.
pub const MAXINHERIT: usize = 10;

/// Per-task and system-wide object quotas.
pub const MAXTASKS: usize = 256;
pub const MAXTHREADS: usize = 128;
pub const MAXSYNCS: usize = 512;
pub const MAXOBJECTS: usize = 64;

/// User virtual address window checked by `user_area`.
pub const USERBASE: u64 = PAGE_SIZE as u64;
pub const USERLIMIT: u64 = 0x8000_0000;

/// Per-task virtual memory ceiling.
pub const MAXMEM: usize = 16 * 1024 * 1024;

/// Default user stack placement and size for boot tasks.
pub const DFLSTKSZ: usize = 16 * 1024;
pub const USRSTACK: u64 = USERLIMIT - DFLSTKSZ as u64;

pub const fn mstohz(msec: u32) -> u32 {
    ((msec as u64 * HZ as u64).div_ceil(1000)) as u32
}

pub const fn hztoms(ticks: u32) -> u32 {
    ((ticks as u64 * 1000).div_ceil(HZ as u64)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(round_page(0), 0);
        assert_eq!(round_page(1), PAGE_SIZE);
        assert_eq!(round_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
        assert_eq!(trunc_page(PAGE_SIZE + 123), PAGE_SIZE);
    }

    #[test]
    fn test_tick_conversion_rounds_up() {
        assert_eq!(mstohz(0), 0);
        assert_eq!(mstohz(1), HZ / 1000);
        assert_eq!(hztoms(mstohz(100)), 100);
        // a fraction of a tick still waits at least one tick worth
        assert!(mstohz(1) >= 1);
    }
}
