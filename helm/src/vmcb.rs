//! VM control block.
//!
//! The per-vCPU bundle of architectural state needed to enter the guest
//! privilege level: the guest's supervisor system registers, the
//! hypervisor-configuration image, the virtual timer, and the interrupt
//! list registers. One VMCB can be resident per CPU; the dispatcher reloads
//! the whole block only when the resident one belongs to a different vCPU,
//! otherwise just the timer state.

use crate::counter;
use crate::cpu::Cpu;
use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use plinth::MAX_CPU;

/// Guest supervisor-level system-register image.
#[repr(C)]
#[derive(Clone, Default)]
pub struct GuestSysState {
    pub sctlr: u64,
    pub tcr: u64,
    pub mair: u64,
    pub ttbr0: u64,
    pub ttbr1: u64,
    pub vbar: u64,
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
    pub esr: u64,
    pub far: u64,
    pub contextidr: u64,
    pub tpidr: u64,
}

/// Hypervisor-configuration image for this vCPU.
#[repr(C)]
#[derive(Clone, Default)]
pub struct HypState {
    pub hcr: u64,
    pub vpidr: u64,
    pub vmpidr: u64,
}

/// Virtual-timer state.
#[repr(C)]
#[derive(Clone, Default)]
pub struct TimerState {
    /// Offset of the virtual counter against the physical one.
    pub cntvoff: u64,
    pub cntv_ctl: u64,
    pub cntv_cval: u64,
}

/// Virtual-interrupt list registers.
#[repr(C)]
#[derive(Clone, Default)]
pub struct VgicState {
    pub elrsr: u64,
    pub lr: [u64; 4],
}

/// Per-vCPU VM control block.
#[repr(C, align(64))]
pub struct Vmcb {
    pub gst: GuestSysState,
    pub hyp: HypState,
    pub tmr: TimerState,
    pub gic: VgicState,
}

const NO_VMCB: AtomicPtr<Vmcb> = AtomicPtr::new(ptr::null_mut());
static CURRENT: [AtomicPtr<Vmcb>; MAX_CPU] = [NO_VMCB; MAX_CPU];

impl Vmcb {
    pub fn new() -> Box<Vmcb> {
        Box::new(Vmcb {
            gst: GuestSysState::default(),
            hyp: HypState::default(),
            tmr: TimerState::default(),
            gic: VgicState::default(),
        })
    }

    /// The VMCB resident on the executing CPU, if any.
    #[inline]
    pub fn current() -> *mut Vmcb {
        CURRENT[Cpu::id()].load(Ordering::SeqCst)
    }

    /// Restore the full guest register state and make this block resident.
    pub fn load_gst(&self) {
        counter::VMCB_LOAD.inc();
        self.load_arch_full();
        CURRENT[Cpu::id()].store(self as *const _ as *mut _, Ordering::SeqCst);
    }

    /// Restore only the virtual-timer state; the block is already resident.
    pub fn load_tmr(&self) {
        debug_assert_eq!(Vmcb::current(), self as *const _ as *mut _);
        self.load_arch_tmr();
    }

    /// Evict the resident block and restore host-mode configuration.
    pub fn load_hst() {
        CURRENT[Cpu::id()].store(ptr::null_mut(), Ordering::SeqCst);
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        unsafe {
            // Trap-everything configuration while no guest is resident.
            core::arch::asm!("msr hcr_el2, {}; isb", in(reg) 0u64, options(nostack));
        }
    }

    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    fn load_arch_full(&self) {
        unsafe {
            core::arch::asm!(
                "msr sctlr_el1, {sctlr}",
                "msr tcr_el1, {tcr}",
                "msr mair_el1, {mair}",
                "msr ttbr0_el1, {ttbr0}",
                "msr ttbr1_el1, {ttbr1}",
                "msr vbar_el1, {vbar}",
                "msr sp_el1, {sp}",
                "msr elr_el1, {elr}",
                "msr spsr_el1, {spsr}",
                "msr hcr_el2, {hcr}",
                "msr vpidr_el2, {vpidr}",
                "msr vmpidr_el2, {vmpidr}",
                "isb",
                sctlr = in(reg) self.gst.sctlr,
                tcr = in(reg) self.gst.tcr,
                mair = in(reg) self.gst.mair,
                ttbr0 = in(reg) self.gst.ttbr0,
                ttbr1 = in(reg) self.gst.ttbr1,
                vbar = in(reg) self.gst.vbar,
                sp = in(reg) self.gst.sp,
                elr = in(reg) self.gst.elr,
                spsr = in(reg) self.gst.spsr,
                hcr = in(reg) self.hyp.hcr,
                vpidr = in(reg) self.hyp.vpidr,
                vmpidr = in(reg) self.hyp.vmpidr,
                options(nostack)
            );
        }
        self.load_arch_tmr();
    }

    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    fn load_arch_tmr(&self) {
        unsafe {
            core::arch::asm!(
                "msr cntvoff_el2, {off}",
                "msr cntv_ctl_el0, {ctl}",
                "msr cntv_cval_el0, {cval}",
                off = in(reg) self.tmr.cntvoff,
                ctl = in(reg) self.tmr.cntv_ctl,
                cval = in(reg) self.tmr.cntv_cval,
                options(nostack)
            );
        }
    }

    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    fn load_arch_full(&self) {
        // The x86_64 back-end moves this state through its VM control
        // structure on entry; residency tracking is all that happens here.
    }

    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    fn load_arch_tmr(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residency_tracking() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(2) };
        let a = Vmcb::new();
        let b = Vmcb::new();

        Vmcb::load_hst();
        assert!(Vmcb::current().is_null());

        a.load_gst();
        assert_eq!(Vmcb::current(), &*a as *const _ as *mut _);
        a.load_tmr();

        b.load_gst();
        assert_eq!(Vmcb::current(), &*b as *const _ as *mut _);

        Vmcb::load_hst();
        assert!(Vmcb::current().is_null());
    }
}
