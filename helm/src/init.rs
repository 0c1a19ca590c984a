//! Boot bring-up.
//!
//! The loader hands each CPU here with a [`BootInfo`] describing what the
//! firmware already enumerated (CPU count, boot CPU, timer frequency —
//! ACPI or device-tree parsing happens outside). Bring-up is serialised by
//! the boot lock so feature and resource enumeration reads cleanly per
//! CPU. Resume re-uses everything the first boot set up; the hypervisor is
//! diskless and keeps no other state across a suspend cycle.

use crate::cpu::Cpu;
use crate::ec::Ec;
use crate::hazard::Hazard;
use crate::sched::Scheduler;
use crate::Status;
use core::sync::atomic::{AtomicU64, Ordering};
use plinth::{arch, timer};
use spin_lock::SpinLock;

/// What the environment must provide before the core starts.
pub struct BootInfo {
    /// CPUs participating in scheduling and grace periods.
    pub cpus: usize,
    /// Index of the CPU executing the boot path.
    pub boot_cpu: usize,
    /// System-counter frequency in Hz.
    pub timer_freq_hz: u64,
}

static BOOT_LOCK: SpinLock<()> = SpinLock::new(());
static BOOT_TS: AtomicU64 = AtomicU64::new(0);

/// Timestamp of the boot CPU's bring-up, for time-to-first-EC metrics.
pub fn boot_ts() -> u64 {
    BOOT_TS.load(Ordering::SeqCst)
}

/// Bring up the boot CPU.
///
/// # Safety
/// Must run exactly once, on the boot CPU, before any other core entry.
pub unsafe fn bsp_init(info: &BootInfo) -> Result<(), Status> {
    Cpu::setup(info.cpus, info.boot_cpu);
    timer::calibrate(info.timer_freq_hz);
    BOOT_TS.store(timer::time(), Ordering::SeqCst);

    info!("core: booting on CPU {} of {}", info.boot_cpu, info.cpus);
    cpu_init(info.boot_cpu)
}

/// Bring up a secondary CPU.
///
/// # Safety
/// Must run exactly once per secondary CPU, after [`bsp_init`].
pub unsafe fn ap_init(cpu: usize) -> Result<(), Status> {
    cpu_init(cpu)
}

fn cpu_init(cpu: usize) -> Result<(), Status> {
    // Serialise bring-up: enumeration happens one CPU at a time.
    let _boot = BOOT_LOCK.lock();

    let shared = Cpu::shared(cpu);
    shared.features.store(arch::feature_word(), Ordering::SeqCst);
    shared.affinity.store(cpu as u32, Ordering::SeqCst);

    // The first return to host and guest mode report bring-up latency.
    shared.hazard.set(Hazard::BOOT_HST | Hazard::BOOT_GST);

    let idle = Ec::create_knl(cpu, Ec::idle)?;
    Scheduler::set_idle(cpu, idle);

    Cpu::mark_online(cpu);
    info!(
        "core: CPU {} online (feat {:#x})",
        cpu,
        shared.features.load(Ordering::SeqCst)
    );
    Ok(())
}

/// Enter the scheduler and never come back. The tail of both boot paths
/// once the embedder finished its own setup.
pub fn start() -> ! {
    Scheduler::schedule()
}

/// Resume from a platform sleep state.
///
/// CPU page tables and per-CPU state survive; only the online mask and the
/// wake poke move. Everything else picks up where [`Cpu::fini`] parked it.
pub unsafe fn resume() {
    for cpu in 0..Cpu::count() {
        if Cpu::online_mask() & (1 << cpu) != 0 {
            plinth::ipi::send(cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bring_up_marks_online_and_arms_boot_hazards() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(3) };
        Cpu::remote_hazard(3).clr(u32::MAX);

        let info = BootInfo {
            cpus: 4,
            boot_cpu: 3,
            timer_freq_hz: 1_000_000,
        };
        unsafe { bsp_init(&info).unwrap() };

        assert!(Cpu::online_mask() & (1 << 3) != 0);
        assert!(Cpu::hazard().tst(Hazard::BOOT_HST));
        assert!(Cpu::hazard().tst(Hazard::BOOT_GST));
        assert!(boot_ts() > 0);

        Cpu::remote_hazard(3).clr(u32::MAX);
    }
}
