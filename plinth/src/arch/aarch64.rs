//! aarch64 (EL2) backend.

use core::arch::asm;

/// Index of the executing CPU, stashed in TPIDR_EL2 at bring-up.
#[inline]
pub fn cpu_id() -> usize {
    let id: u64;
    unsafe { asm!("mrs {}, tpidr_el2", out(reg) id, options(nomem, nostack)) };
    id as usize
}

/// Record the CPU index for [`cpu_id`].
///
/// # Safety
/// Must be called exactly once per CPU, before anything consults [`cpu_id`].
pub unsafe fn set_cpu_id(id: usize) {
    asm!("msr tpidr_el2, {}", in(reg) id as u64, options(nomem, nostack));
}

#[inline]
pub fn preemption_disable() {
    unsafe { asm!("msr daifset, #0xf", options(nomem, nostack)) };
}

#[inline]
pub fn preemption_enable() {
    unsafe { asm!("msr daifclr, #0xf", options(nomem, nostack)) };
}

/// A controlled preemption window: take pending interrupts, then mask again.
#[inline]
pub fn preemption_point() {
    unsafe { asm!("msr daifclr, #0xf; msr daifset, #0xf", options(nomem, nostack)) };
}

/// Wait for an interrupt with interrupts briefly enabled.
#[inline]
pub fn halt() {
    unsafe { asm!("wfi; msr daifclr, #0xf; msr daifset, #0xf", options(nomem, nostack)) };
}

/// Install a translation root (VMID in bits 63:48, table base below) into
/// VTTBR_EL2 in a single register write.
#[inline]
pub fn install_root(tag_root: u64) {
    unsafe { asm!("msr vttbr_el2, {}; isb", in(reg) tag_root, options(nostack)) };
}

/// Broadcast-invalidate all stage-1/2 entries for the current VMID.
#[inline]
pub fn invalidate_tlb(_vmid: u16) {
    unsafe {
        asm!(
            "dsb  ishst",         // ensure PTE writes have completed
            "tlbi vmalls12e1is",
            "dsb  ish",
            "isb",
            options(nostack)
        )
    };
}

const CPTR_TFP: u64 = 1 << 10;

#[inline]
pub fn fpu_trap_enable() {
    unsafe { asm!("mrs {t}, cptr_el2; orr {t}, {t}, {m}; msr cptr_el2, {t}",
                  t = out(reg) _, m = in(reg) CPTR_TFP, options(nomem, nostack)) };
}

#[inline]
pub fn fpu_trap_disable() {
    unsafe { asm!("mrs {t}, cptr_el2; bic {t}, {t}, {m}; msr cptr_el2, {t}",
                  t = out(reg) _, m = in(reg) CPTR_TFP, options(nomem, nostack)) };
}

/// Compact feature vector (ID_AA64PFR0_EL1).
#[inline]
pub fn feature_word() -> u64 {
    let v: u64;
    unsafe { asm!("mrs {}, id_aa64pfr0_el1", out(reg) v, options(nomem, nostack)) };
    v
}
