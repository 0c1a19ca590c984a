//! System counter readout.
//!
//! The timer device (and its interrupt) is a driver concern; the core only
//! reads the free-running counter and converts tick deltas to wall time.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counter frequency until the board code calibrates it.
const DEFAULT_FREQ_HZ: u64 = 1_000_000;

static FREQ_HZ: AtomicU64 = AtomicU64::new(DEFAULT_FREQ_HZ);

/// Record the counter frequency reported by firmware.
pub fn calibrate(hz: u64) {
    assert!(hz > 0);
    FREQ_HZ.store(hz, Ordering::SeqCst);
}

/// Current value of the free-running system counter.
#[inline]
pub fn time() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let t: u64;
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) t, options(nomem, nostack));
        t
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        static FALLBACK: AtomicU64 = AtomicU64::new(0);
        FALLBACK.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Convert a tick delta into milliseconds.
#[inline]
pub fn ticks_to_ms(ticks: u64) -> u64 {
    ticks / (FREQ_HZ.load(Ordering::SeqCst) / 1_000).max(1)
}
