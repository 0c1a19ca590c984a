//! Per-CPU event counters.
//!
//! Cheap bookkeeping of noteworthy events, kept per CPU so increments never
//! bounce cache lines. `dump` reports one CPU's view through the console.

use core::sync::atomic::{AtomicU64, Ordering};
use plinth::{arch, MAX_CPU};

/// One monotonically increasing count per CPU.
pub struct Counter([AtomicU64; MAX_CPU]);

impl Counter {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self([ZERO; MAX_CPU])
    }

    /// Bump the executing CPU's count.
    #[inline]
    pub fn inc(&self) {
        self.0[arch::cpu_id()].fetch_add(1, Ordering::Relaxed);
    }

    /// Read one CPU's count.
    pub fn get(&self, cpu: usize) -> u64 {
        self.0[cpu].load(Ordering::Relaxed)
    }

    /// Sum across all CPUs.
    pub fn total(&self) -> u64 {
        (0..MAX_CPU).map(|c| self.get(c)).sum()
    }
}

/// Passes through the scheduler.
pub static SCHEDULE: Counter = Counter::new();
/// FPU state blocks written back.
pub static FPU_SAVE: Counter = Counter::new();
/// FPU state blocks loaded.
pub static FPU_LOAD: Counter = Counter::new();
/// Translation roots installed (TLB-visible switches).
pub static TLB_ROOT: Counter = Counter::new();
/// Broadcast TLB invalidations issued.
pub static TLB_SHOOTDOWN: Counter = Counter::new();
/// Inter-processor pokes sent.
pub static IPI_SEND: Counter = Counter::new();
/// Grace-period callbacks invoked.
pub static RCU_INVOKE: Counter = Counter::new();
/// Full VM control block loads.
pub static VMCB_LOAD: Counter = Counter::new();

/// Report one CPU's counters.
pub fn dump(cpu: usize) {
    info!(
        "CNT: cpu{} sched:{} fpu:{}/{} tlb:{}/{} ipi:{} rcu:{} vmcb:{}",
        cpu,
        SCHEDULE.get(cpu),
        FPU_SAVE.get(cpu),
        FPU_LOAD.get(cpu),
        TLB_ROOT.get(cpu),
        TLB_SHOOTDOWN.get(cpu),
        IPI_SEND.get(cpu),
        RCU_INVOKE.get(cpu),
        VMCB_LOAD.get(cpu),
    );
}
