//! FPU ownership.
//!
//! FPU state moves lazily. The CPU-side `FPU` hazard bit means "some EC's
//! FPU state is live on this CPU"; the EC-side bit means "this EC uses the
//! FPU". The dispatcher folds the two with XOR: a mismatch either saves the
//! resident state and re-arms the access trap (next EC does not use the
//! FPU) or loads the next EC's state (CPU holds none). The one case the
//! XOR cannot see — both bits set but the resident state belongs to a
//! different EC — is caught here against the per-CPU owner record, past
//! the dispatcher's point of no return.
//!
//! A first-touch trap marks the EC as an FPU user, making the ownership
//! check steady-state for all later dispatches.

use crate::counter;
use crate::cpu::Cpu;
use crate::ec::Ec;
use crate::hazard::Hazard;
use crate::kobj::Ref;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use plinth::arch;
use plinth::MAX_CPU;

/// FPU register state of one EC.
#[repr(C, align(16))]
pub struct Fpu {
    /// 32 128-bit SIMD and FP registers.
    v: [[u64; 2]; 32],
    /// Control register.
    fpcr: u64,
    /// Status register.
    fpsr: u64,
}

impl Fpu {
    pub const fn new() -> Self {
        Self {
            v: [[0; 2]; 32],
            fpcr: 0,
            fpsr: 0,
        }
    }

    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    fn load(&self) {
        counter::FPU_LOAD.inc();
        unsafe {
            core::arch::asm!(
                "ldp  q0,  q1,  [{r}, #32* 0]",
                "ldp  q2,  q3,  [{r}, #32* 1]",
                "ldp  q4,  q5,  [{r}, #32* 2]",
                "ldp  q6,  q7,  [{r}, #32* 3]",
                "ldp  q8,  q9,  [{r}, #32* 4]",
                "ldp  q10, q11, [{r}, #32* 5]",
                "ldp  q12, q13, [{r}, #32* 6]",
                "ldp  q14, q15, [{r}, #32* 7]",
                "ldp  q16, q17, [{r}, #32* 8]",
                "ldp  q18, q19, [{r}, #32* 9]",
                "ldp  q20, q21, [{r}, #32*10]",
                "ldp  q22, q23, [{r}, #32*11]",
                "ldp  q24, q25, [{r}, #32*12]",
                "ldp  q26, q27, [{r}, #32*13]",
                "ldp  q28, q29, [{r}, #32*14]",
                "ldp  q30, q31, [{r}, #32*15]",
                "ldp  {a}, {b}, [{r}, #32*16]",
                "msr  fpcr, {a}",
                "msr  fpsr, {b}",
                r = in(reg) self as *const Fpu,
                a = out(reg) _,
                b = out(reg) _,
                options(nostack)
            );
        }
    }

    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    fn save(&mut self) {
        counter::FPU_SAVE.inc();
        unsafe {
            core::arch::asm!(
                "mrs  {a}, fpcr",
                "mrs  {b}, fpsr",
                "stp  q0,  q1,  [{r}, #32* 0]",
                "stp  q2,  q3,  [{r}, #32* 1]",
                "stp  q4,  q5,  [{r}, #32* 2]",
                "stp  q6,  q7,  [{r}, #32* 3]",
                "stp  q8,  q9,  [{r}, #32* 4]",
                "stp  q10, q11, [{r}, #32* 5]",
                "stp  q12, q13, [{r}, #32* 6]",
                "stp  q14, q15, [{r}, #32* 7]",
                "stp  q16, q17, [{r}, #32* 8]",
                "stp  q18, q19, [{r}, #32* 9]",
                "stp  q20, q21, [{r}, #32*10]",
                "stp  q22, q23, [{r}, #32*11]",
                "stp  q24, q25, [{r}, #32*12]",
                "stp  q26, q27, [{r}, #32*13]",
                "stp  q28, q29, [{r}, #32*14]",
                "stp  q30, q31, [{r}, #32*15]",
                "stp  {a}, {b}, [{r}, #32*16]",
                r = in(reg) self as *mut Fpu,
                a = out(reg) _,
                b = out(reg) _,
                options(nostack)
            );
        }
    }

    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    fn load(&self) {
        counter::FPU_LOAD.inc();
    }

    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    fn save(&mut self) {
        counter::FPU_SAVE.inc();
    }

    /// Arm the lower-EL access trap; the CPU no longer holds live state.
    pub fn disable() {
        arch::fpu_trap_enable();
        Cpu::hazard().clr(Hazard::FPU);
    }

    /// Disarm the trap; the CPU holds live state.
    pub fn enable() {
        arch::fpu_trap_disable();
        Cpu::hazard().set(Hazard::FPU);
    }
}

impl Default for Fpu {
    fn default() -> Self {
        Self::new()
    }
}

const NO_OWNER: AtomicPtr<Ec> = AtomicPtr::new(ptr::null_mut());
/// Which EC's state is resident, per CPU. Carries a counted reference while
/// non-null. Written by the owning CPU only.
static OWNER: [AtomicPtr<Ec>; MAX_CPU] = [NO_OWNER; MAX_CPU];

fn owner() -> *mut Ec {
    OWNER[Cpu::id()].load(Ordering::SeqCst)
}

fn set_owner(ec: Option<&Ec>) {
    let new = match ec {
        // Hold the owner alive while its state is resident.
        Some(ec) => ec.grab().into_raw().as_ptr(),
        None => ptr::null_mut(),
    };
    let old = OWNER[Cpu::id()].swap(new, Ordering::SeqCst);
    if let Some(old) = NonNull::new(old) {
        drop(unsafe { Ref::from_raw(old) });
    }
}

fn save_resident() {
    if let Some(prev) = unsafe { owner().as_ref() } {
        let bank: &UnsafeCell<Fpu> = prev.fpu().expect("FPU owner without state block");
        unsafe { (*bank.get()).save() };
    }
}

/// Settle FPU ownership for `ec` before it returns to lower privilege.
///
/// Called on every dispatcher pass past the point of no return.
pub fn transition(ec: &Ec) {
    let cpu_holds = Cpu::hazard().tst(Hazard::FPU);
    let wants = ec.hazard().tst(Hazard::FPU);

    match (cpu_holds, wants) {
        (false, false) => {}
        (true, false) => {
            // Resident state belongs to someone else; write it back and
            // re-arm the trap.
            save_resident();
            set_owner(None);
            Fpu::disable();
        }
        (false, true) => {
            let bank = ec.fpu().expect("FPU user without state block");
            unsafe { (*bank.get()).load() };
            set_owner(Some(ec));
            Fpu::enable();
        }
        (true, true) => {
            // Both bits set cancels in the hazard fold, so this path is
            // reached on every dispatch; hand over only on owner mismatch.
            if owner() != ec as *const Ec as *mut Ec {
                save_resident();
                let bank = ec.fpu().expect("FPU user without state block");
                unsafe { (*bank.get()).load() };
                set_owner(Some(ec));
            }
        }
    }
}

/// First-touch access trap: mark the EC as an FPU user and give it the
/// unit.
pub fn handle_trap(ec: &Ec) {
    if ec.fpu().is_none() {
        ec.kill("FPU access without FPU state");
    }
    ec.hazard().set(Hazard::FPU);
    transition(ec);
}

/// Flush ownership ahead of a power-down.
pub fn fini() {
    if Cpu::hazard().tst(Hazard::FPU) {
        save_resident();
        set_owner(None);
        Fpu::disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::Ec;
    use crate::pd::Pd;
    use plinth::addressing::Va;

    fn host_ec(pd: &Pd, cpu: usize, fpu: bool) -> Ref<Ec> {
        Ec::create_hst(pd, true, fpu, cpu, 0x100, 0x7000_0000, Va::new(0x6000_0000).unwrap())
            .expect("host EC creation")
    }

    #[test]
    fn lazy_handover_saves_once_loads_once() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(0) };
        Cpu::hazard().clr(Hazard::FPU);
        set_owner(None);

        let pd = Pd::create(true).unwrap();
        let a = host_ec(&pd, 0, true);
        let b = host_ec(&pd, 0, true);

        let saves = || counter::FPU_SAVE.get(0);
        let loads = || counter::FPU_LOAD.get(0);
        let (s0, l0) = (saves(), loads());

        // A runs and touches the FPU.
        handle_trap(&a);
        assert!(a.hazard().tst(Hazard::FPU));
        assert!(Cpu::hazard().tst(Hazard::FPU));
        assert_eq!((saves(), loads()), (s0, l0 + 1));

        // Switch to B, which never touches the FPU: exactly one save, no
        // load.
        transition(&b);
        assert!(!Cpu::hazard().tst(Hazard::FPU));
        assert_eq!((saves(), loads()), (s0 + 1, l0 + 1));

        // B runs on; nothing further moves.
        transition(&b);
        assert_eq!((saves(), loads()), (s0 + 1, l0 + 1));

        // Back to A: exactly one reload.
        transition(&a);
        assert!(Cpu::hazard().tst(Hazard::FPU));
        assert_eq!((saves(), loads()), (s0 + 1, l0 + 2));

        set_owner(None);
        Cpu::hazard().clr(Hazard::FPU);
    }

    #[test]
    fn silent_handover_between_two_users() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(0) };
        Cpu::hazard().clr(Hazard::FPU);
        set_owner(None);

        let pd = Pd::create(true).unwrap();
        let a = host_ec(&pd, 0, true);
        let c = host_ec(&pd, 0, true);

        handle_trap(&a);
        handle_trap(&c); // C steals the unit from A.
        let (s, l) = (counter::FPU_SAVE.get(0), counter::FPU_LOAD.get(0));

        // Both bits set, owner already C: a dispatch pass moves nothing.
        transition(&c);
        assert_eq!((counter::FPU_SAVE.get(0), counter::FPU_LOAD.get(0)), (s, l));

        // Dispatching A with both bits set hands over despite the silent
        // hazard fold.
        transition(&a);
        assert_eq!(
            (counter::FPU_SAVE.get(0), counter::FPU_LOAD.get(0)),
            (s + 1, l + 1)
        );

        set_owner(None);
        Cpu::hazard().clr(Hazard::FPU);
    }
}
