//! Per-CPU identity and cross-CPU signalling.
//!
//! Each CPU owns one slot of a fixed bank: its hazard word, its affinity
//! word, and its current-EC pointer are atomics that remote CPUs may touch;
//! everything else on a slot belongs to the owner alone. Setting work on a
//! remote CPU is a sequentially consistent OR on its hazard word, followed
//! by a poke if that CPU may be sitting in wait-for-interrupt.

use crate::counter;
use crate::ec::Ec;
use crate::hazard::Hazard;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use plinth::{arch, ipi, MAX_CPU};

/// The cross-CPU-visible face of one CPU.
pub struct CpuShared {
    /// Pending-work bitset gating any return to lower privilege.
    pub hazard: Hazard,
    /// Interrupt-routing affinity word.
    pub affinity: AtomicU32,
    /// Compact feature vector recorded at bring-up.
    pub features: AtomicU64,
    current: AtomicPtr<Ec>,
    halted: AtomicBool,
    preempt_depth: AtomicU32,
}

impl CpuShared {
    const fn new() -> Self {
        Self {
            hazard: Hazard::new(0),
            affinity: AtomicU32::new(0),
            features: AtomicU64::new(0),
            current: AtomicPtr::new(ptr::null_mut()),
            halted: AtomicBool::new(false),
            preempt_depth: AtomicU32::new(0),
        }
    }
}

const INIT: CpuShared = CpuShared::new();
static SHARED: [CpuShared; MAX_CPU] = [INIT; MAX_CPU];

static ONLINE: AtomicU32 = AtomicU32::new(0);
static COUNT: AtomicUsize = AtomicUsize::new(0);
static BOOT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Handle on the executing CPU's identity.
pub struct Cpu;

impl Cpu {
    /// Fixed, unique index of the executing CPU.
    #[inline]
    pub fn id() -> usize {
        arch::cpu_id()
    }

    /// Number of CPUs participating in scheduling and grace periods.
    #[inline]
    pub fn count() -> usize {
        COUNT.load(Ordering::SeqCst)
    }

    /// Index of the CPU that booted the machine.
    pub fn boot_cpu() -> usize {
        BOOT_CPU.load(Ordering::SeqCst)
    }

    /// Whether the executing CPU is the boot CPU.
    pub fn is_bsp() -> bool {
        Self::id() == Self::boot_cpu()
    }

    pub(crate) fn setup(count: usize, boot_cpu: usize) {
        assert!(count >= 1 && count <= MAX_CPU && boot_cpu < count);
        COUNT.store(count, Ordering::SeqCst);
        BOOT_CPU.store(boot_cpu, Ordering::SeqCst);
    }

    /// Mask of CPUs that completed bring-up.
    pub fn online_mask() -> u32 {
        ONLINE.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_online(cpu: usize) {
        ONLINE.fetch_or(1 << cpu, Ordering::SeqCst);
    }

    /// The shared bank of an arbitrary CPU.
    #[inline]
    pub fn shared(cpu: usize) -> &'static CpuShared {
        &SHARED[cpu]
    }

    /// The shared bank of the executing CPU.
    #[inline]
    pub fn local() -> &'static CpuShared {
        &SHARED[Self::id()]
    }

    /// The executing CPU's hazard word.
    #[inline]
    pub fn hazard() -> &'static Hazard {
        &Self::local().hazard
    }

    /// A remote CPU's hazard word.
    #[inline]
    pub fn remote_hazard(cpu: usize) -> &'static Hazard {
        &SHARED[cpu].hazard
    }

    /// A remote CPU's affinity word.
    #[inline]
    pub fn remote_affinity(cpu: usize) -> u32 {
        SHARED[cpu].affinity.load(Ordering::SeqCst)
    }

    /// Post asynchronous work to another CPU: OR the mask into its hazard
    /// word, then poke it if it may be halted.
    pub fn set_remote_hazard(cpu: usize, mask: u32) {
        SHARED[cpu].hazard.set(mask);
        if SHARED[cpu].halted.load(Ordering::SeqCst) {
            counter::IPI_SEND.inc();
            ipi::send(cpu);
        }
    }

    /// The EC currently bound to this CPU, if any.
    ///
    /// Only meaningful on the executing CPU; remote reads are inherently
    /// racy and only used for diagnostics.
    #[inline]
    pub fn current() -> Option<&'static Ec> {
        unsafe { Self::local().current.load(Ordering::SeqCst).as_ref() }
    }

    /// Install `ec` as the executing CPU's current EC, returning the
    /// previous binding. Both sides carry a counted reference.
    pub(crate) fn exchange_current(ec: *mut Ec) -> *mut Ec {
        Self::local().current.swap(ec, Ordering::SeqCst)
    }

    #[inline]
    pub fn preemption_disable() {
        arch::preemption_disable();
    }

    #[inline]
    pub fn preemption_enable() {
        arch::preemption_enable();
    }

    /// A controlled preemption window: take whatever is pending, then mask
    /// again.
    #[inline]
    pub fn preemption_point() {
        arch::preemption_point();
    }

    /// Wait for an interrupt with interrupts briefly enabled. Remote CPUs
    /// observe the halted window and follow their hazard writes with a poke.
    pub fn halt() {
        let shared = Self::local();
        shared.halted.store(true, Ordering::SeqCst);
        arch::halt();
        shared.halted.store(false, Ordering::SeqCst);
    }

    /// Power down after the current kernel entry.
    ///
    /// The dispatcher parks the current EC's continuation before calling
    /// this; on wakeup the continuation re-runs and completes the return.
    pub fn fini() -> ! {
        crate::fpu::fini();
        Self::hazard().clr(Hazard::SLEEP);
        counter::dump(Self::id());
        loop {
            Self::halt();
            if let Some(ec) = Self::current() {
                // Woken with work pending: resume the parked continuation.
                if Self::hazard().get() != 0 {
                    ec.invoke_cont();
                }
            }
        }
    }
}

/// An RAII preemption hold. Nests; preemption resumes when the outermost
/// guard drops.
pub struct PreemptGuard;

impl PreemptGuard {
    pub fn new() -> Self {
        if Cpu::local().preempt_depth.fetch_add(1, Ordering::SeqCst) == 0 {
            Cpu::preemption_disable();
        }
        Self
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        if Cpu::local().preempt_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            Cpu::preemption_enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_hazard_is_visible() {
        let _gate = crate::testing::lock();
        let cpu = 3;
        Cpu::remote_hazard(cpu).clr(u32::MAX);
        Cpu::set_remote_hazard(cpu, Hazard::RECALL | Hazard::SCHED);
        assert!(Cpu::remote_hazard(cpu).tst(Hazard::RECALL));
        assert!(Cpu::remote_hazard(cpu).tst(Hazard::SCHED));
        Cpu::remote_hazard(cpu).clr(u32::MAX);
    }

    #[test]
    fn preempt_guard_nests() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(0) };
        let a = PreemptGuard::new();
        let b = PreemptGuard::new();
        drop(b);
        assert_eq!(Cpu::local().preempt_depth.load(Ordering::SeqCst), 1);
        drop(a);
        assert_eq!(Cpu::local().preempt_depth.load(Ordering::SeqCst), 0);
    }
}
