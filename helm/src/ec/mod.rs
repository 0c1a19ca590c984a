//! Execution contexts.
//!
//! The EC is the sole schedulable object: a kernel thread, a user-mode host
//! thread, or a guest vCPU. It owns one register file and is pinned to one
//! CPU for its whole life; only that CPU ever touches the register file,
//! which is the invariant that keeps the `UnsafeCell` honest.
//!
//! There is no kernel stack that survives a return to lower privilege.
//! Suspending an EC means storing a *continuation* — a plain function
//! pointer taking the EC as its sole argument — and yielding; the next
//! kernel entry on the CPU tail-calls the stored continuation.

pub mod dispatch;

use crate::cpu::Cpu;
use crate::event;
use crate::fpu::Fpu;
use crate::hazard::Hazard;
use crate::kobj::{free_obj, KObj, KObject, Ref, Subtype};
use crate::pd::Pd;
use crate::regs::CpuRegs;
use crate::sched::Scheduler;
use crate::space_mem::{SpaceGst, SpaceHst};
use crate::space_obj::SpaceObj;
use crate::utcb::Utcb;
use crate::vmcb::Vmcb;
use crate::Status;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use plinth::addressing::{ptr_to_phys, Va, PAGE_MASK};
use plinth::ptab::{Memattr, Permissions};
use plinth::MAX_CPU;

/// A continuation: what the EC resumes as on its next dispatch.
pub type Cont = fn(&'static Ec) -> !;

/// An execution context.
#[repr(C, align(32))]
pub struct Ec {
    kobj: KObject,
    /// Per-EC pending-work bitset; remote CPUs set `RECALL` here.
    hazard: Hazard,
    /// CPU affinity, immutable after creation.
    cpu: usize,
    /// Event base: upcall destinations live at `evt + selector` in the
    /// object space.
    evt: usize,
    /// The stored continuation, or 0 when none.
    cont: AtomicUsize,
    /// EC parked in a rendezvous with this one; carries a counted
    /// reference while non-null.
    caller: AtomicPtr<Ec>,
    /// Register file and translation context. Touched only by the affine
    /// CPU.
    regs: UnsafeCell<CpuRegs>,
    /// Transfer page of a host EC.
    utcb: Option<Box<UnsafeCell<Utcb>>>,
    /// FPU state block, for ECs that may use the unit.
    fpu: Option<Box<UnsafeCell<Fpu>>>,
}

// An EC is shared across CPUs only through its atomic words (hazard, cont,
// caller) and its immutable fields; the register file stays with the affine
// CPU.
unsafe impl Send for Ec {}
unsafe impl Sync for Ec {}

unsafe impl KObj for Ec {
    const SUBTYPES: &'static [Subtype] = &[
        Subtype::EcKernel,
        Subtype::EcLocal,
        Subtype::EcGlobal,
        Subtype::EcVcpuReal,
        Subtype::EcVcpuOffs,
    ];

    fn kobj(&self) -> &KObject {
        &self.kobj
    }
}

impl Ec {
    fn new(
        subtype: Subtype,
        regs: CpuRegs,
        cpu: usize,
        evt: usize,
        cont: Option<Cont>,
        utcb: Option<Box<UnsafeCell<Utcb>>>,
        fpu: Option<Box<UnsafeCell<Fpu>>>,
        hazard: u32,
    ) -> Self {
        Self {
            kobj: KObject::new(subtype, free_obj::<Ec>),
            hazard: Hazard::new(hazard),
            cpu,
            evt,
            cont: AtomicUsize::new(cont.map_or(0, |f| f as usize)),
            caller: AtomicPtr::new(ptr::null_mut()),
            regs: UnsafeCell::new(regs),
            utcb,
            fpu,
        }
    }

    /// Create a kernel thread: supervisor mode only, no user stack, no FPU.
    pub fn create_knl(cpu: usize, cont: Cont) -> Result<Ref<Ec>, Status> {
        if cpu >= MAX_CPU {
            return Err(Status::BadCpu);
        }
        Ok(Ref::new(Self::new(
            Subtype::EcKernel,
            CpuRegs::new_knl(),
            cpu,
            0,
            Some(cont),
            None,
            None,
            0,
        )))
    }

    /// Create a host EC backing a user-mode thread.
    ///
    /// The UTCB is mapped into the host space at `hva`; the initial
    /// entry-point selector is the host-flavour `STARTUP` event.
    pub fn create_hst(
        pd: &Pd,
        global: bool,
        fpu: bool,
        cpu: usize,
        evt: usize,
        sp: u64,
        hva: Va,
    ) -> Result<Ref<Ec>, Status> {
        if cpu >= MAX_CPU {
            return Err(Status::BadCpu);
        }
        if hva.into_usize() & PAGE_MASK != 0 {
            return Err(Status::BadPar);
        }
        let (obj, hst) = match (pd.get_obj(), pd.get_hst()) {
            (Some(o), Some(h)) => (o, h),
            _ => return Err(Status::Aborted),
        };

        let utcb = Box::new(UnsafeCell::new(Utcb::new()));
        hst.update(
            hva,
            ptr_to_phys(utcb.as_ref() as *const _),
            0,
            Permissions::R | Permissions::W | Permissions::U,
            Memattr::Ram,
        )?;
        hst.sync();

        let fpu = fpu.then(|| Box::new(UnsafeCell::new(Fpu::new())));
        let mut regs = CpuRegs::new_hst(obj, hst);
        regs.exc.set_sp(sp);
        regs.exc.set_ep(evt + event::HST_ARCH + event::STARTUP);

        let ec = Ref::new(Self::new(
            if global {
                Subtype::EcGlobal
            } else {
                Subtype::EcLocal
            },
            regs,
            cpu,
            evt,
            global.then_some(Self::ret_user_exception as Cont),
            Some(utcb),
            fpu,
            0,
        ));
        debug!("EC:{:p} created (CPU:{} EVT:{:#x} {})", ec.as_ptr(), cpu, evt,
               if global { 'G' } else { 'L' });
        Ok(ec)
    }

    /// Create a guest vCPU.
    ///
    /// The vCPU comes up with the `ILLEGAL` hazard set and a
    /// [`dispatch::set_vmm_regs`]-style continuation: until its manager
    /// initialises it, any attempt to enter the guest kills it.
    pub fn create_gst(
        pd: &Pd,
        offs: bool,
        fpu: bool,
        cpu: usize,
        evt: usize,
        sp: u64,
    ) -> Result<Ref<Ec>, Status> {
        if cpu >= MAX_CPU {
            return Err(Status::BadCpu);
        }
        let (obj, hst, gst) = match (pd.get_obj(), pd.get_hst(), pd.get_gst()) {
            (Some(o), Some(h), Some(g)) => (o, h, g),
            _ => return Err(Status::Aborted),
        };

        let fpu = fpu.then(|| Box::new(UnsafeCell::new(Fpu::new())));
        let vmcb = Vmcb::new();
        let mut regs = CpuRegs::new_gst(obj, hst, gst, vmcb);
        regs.exc.set_sp(sp);
        regs.exc.set_ep(evt + event::GST_ARCH + event::STARTUP);

        let ec = Ref::new(Self::new(
            if offs {
                Subtype::EcVcpuOffs
            } else {
                Subtype::EcVcpuReal
            },
            regs,
            cpu,
            evt,
            Some(dispatch::set_vmm_regs as Cont),
            None,
            fpu,
            Hazard::ILLEGAL,
        ));
        debug!("EC:{:p} created (CPU:{} EVT:{:#x} {})", ec.as_ptr(), cpu, evt,
               if offs { 'O' } else { 'R' });
        Ok(ec)
    }

    /// CPU affinity.
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Event base.
    #[inline]
    pub fn evt(&self) -> usize {
        self.evt
    }

    /// The EC's hazard word.
    #[inline]
    pub fn hazard(&self) -> &Hazard {
        &self.hazard
    }

    /// Whether this EC is a guest vCPU.
    #[inline]
    pub fn is_vcpu(&self) -> bool {
        matches!(
            self.kobj.subtype(),
            Subtype::EcVcpuReal | Subtype::EcVcpuOffs
        )
    }

    /// Take a fresh counted handle from a borrowed one.
    pub fn grab(&self) -> Ref<Ec> {
        Ref::try_acquire(NonNull::from(self)).expect("grabbing a condemned EC")
    }

    pub(crate) fn fpu(&self) -> Option<&UnsafeCell<Fpu>> {
        self.fpu.as_deref()
    }

    pub(crate) fn utcb(&self) -> Option<&UnsafeCell<Utcb>> {
        self.utcb.as_deref()
    }

    pub(crate) fn regs_ptr(&self) -> *mut CpuRegs {
        self.regs.get()
    }

    /// Entry-point selector of the last kernel entry.
    pub fn ep(&self) -> usize {
        unsafe { (*self.regs.get()).exc.ep() }
    }

    /// Object space this EC resolves capabilities in.
    pub fn obj(&self) -> Option<Ref<SpaceObj>> {
        unsafe { (*self.regs.get()).obj.clone() }
    }

    /// Host memory space this EC runs user mode under.
    pub fn hst(&self) -> Option<Ref<SpaceHst>> {
        unsafe { (*self.regs.get()).hst.clone() }
    }

    /// Guest memory space of a vCPU.
    pub fn gst(&self) -> Option<Ref<SpaceGst>> {
        unsafe { (*self.regs.get()).gst.clone() }
    }

    /// Apply a suspend-time delta to the virtual-timer offset of vCPUs
    /// that run on offset time.
    pub fn adjust_offset_ticks(&self, ticks: u64) {
        if self.kobj.subtype() == Subtype::EcVcpuOffs {
            unsafe {
                if let Some(vmcb) = (*self.regs.get()).vmcb.as_mut() {
                    vmcb.tmr.cntvoff = vmcb.tmr.cntvoff.wrapping_add(ticks);
                }
            }
        }
    }

    /// Store the continuation to resume as on the next dispatch. Setting a
    /// continuation is the only way to suspend an EC.
    #[inline]
    pub fn set_cont(&self, cont: Cont) {
        self.cont.store(cont as usize, Ordering::SeqCst);
    }

    /// The stored continuation.
    pub fn cont(&self) -> Option<Cont> {
        let raw = self.cont.load(Ordering::SeqCst);
        (raw != 0).then(|| unsafe { core::mem::transmute::<usize, Cont>(raw) })
    }

    /// Tail-call the stored continuation.
    pub fn invoke_cont(&'static self) -> ! {
        let f = self.cont().expect("EC resumed without continuation");
        f(self)
    }

    /// Park `caller` in this EC's rendezvous slot.
    pub(crate) fn set_caller(&self, caller: Ref<Ec>) {
        let old = self.caller.swap(caller.into_raw().as_ptr(), Ordering::SeqCst);
        debug_assert!(old.is_null());
    }

    /// Take the parked rendezvous partner, if any.
    pub(crate) fn take_caller(&self) -> Option<Ref<Ec>> {
        NonNull::new(self.caller.swap(ptr::null_mut(), Ordering::SeqCst))
            .map(|p| unsafe { Ref::from_raw(p) })
    }

    /// Kill this EC: surface an error to a parked partner if there is one,
    /// drop the CPU's hold, and schedule away. Destruction follows through
    /// the reference count and a grace period once the remaining handles
    /// drop.
    pub fn kill(&self, reason: &str) -> ! {
        warning!("EC:{:p} killed: {}", self as *const Ec, reason);

        if let Some(caller) = self.take_caller() {
            unsafe {
                (*caller.regs_ptr()).exc.sys.gpr[0] = Status::Aborted.code();
            }
            caller.set_cont(Self::ret_user_hypercall);
            let caller = Scheduler::make_current(caller);
            caller.invoke_cont()
        }
        if let Some(prev) = NonNull::new(Cpu::exchange_current(ptr::null_mut())) {
            drop(unsafe { Ref::from_raw(prev) });
        }
        Scheduler::schedule()
    }

    /// The per-CPU idle loop: settle bookkeeping hazards, then wait.
    pub fn idle(ec: &'static Ec) -> ! {
        loop {
            let h = Cpu::hazard().get();
            if h & Hazard::SCHED != 0 {
                ec.set_cont(Ec::idle);
                Scheduler::schedule();
            }
            if h & Hazard::RCU != 0 {
                crate::rcu::Rcu::quiet();
            }
            if h & Hazard::SLEEP != 0 {
                ec.set_cont(Ec::idle);
                Cpu::fini();
            }
            Cpu::halt();
        }
    }
}

impl Drop for Ec {
    fn drop(&mut self) {
        // A parked partner still holds work; surfacing its loss is the
        // kill path's job, here we only drop the reference.
        drop(self.take_caller());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth::addressing::Pa;

    fn va(v: usize) -> Va {
        Va::new(v).unwrap()
    }

    #[test]
    fn kernel_ec_has_no_user_state() {
        let _gate = crate::testing::lock();
        let ec = Ec::create_knl(1, Ec::idle).unwrap();
        assert_eq!(ec.kobj().subtype(), Subtype::EcKernel);
        assert!(ec.fpu().is_none());
        assert!(ec.utcb().is_none());
        assert!(ec.obj().is_none());
        assert_eq!(ec.cont().map(|f| f as usize), Some(Ec::idle as usize));
    }

    #[test]
    fn host_ec_maps_utcb() {
        let _gate = crate::testing::lock();
        let pd = Pd::create(false).unwrap();
        let hva = va(0x7fff_0000);
        let ec = Ec::create_hst(&pd, true, true, 0, 0x40, 0x9000, hva).unwrap();

        // The UTCB page is visible through the host space.
        let hst = ec.hst().unwrap();
        let (pa, order, perms, _) = hst.lookup(hva).unwrap();
        assert_eq!(order, 0);
        assert!(perms.contains(Permissions::U | Permissions::W));
        assert_ne!(pa, Pa::ZERO);

        assert_eq!(ec.ep(), 0x40 + event::HST_ARCH + event::STARTUP);
        assert!(!ec.hazard().tst(Hazard::ILLEGAL));
    }

    #[test]
    fn vcpu_comes_up_illegal() {
        let _gate = crate::testing::lock();
        let pd = Pd::create(true).unwrap();
        let ec = Ec::create_gst(&pd, false, true, 0, 0x80, 0).unwrap();
        assert!(ec.is_vcpu());
        assert!(ec.hazard().tst(Hazard::ILLEGAL));
        assert_eq!(ec.ep(), 0x80 + event::GST_ARCH + event::STARTUP);
        assert!(ec.gst().is_some());

        // A domain without a guest space cannot host vCPUs.
        let plain = Pd::create(false).unwrap();
        assert_eq!(
            Ec::create_gst(&plain, false, false, 0, 0, 0).err(),
            Some(Status::Aborted)
        );
    }

    #[test]
    fn offset_vcpu_accumulates_suspend_ticks() {
        let _gate = crate::testing::lock();
        let pd = Pd::create(true).unwrap();
        let offs = Ec::create_gst(&pd, true, false, 0, 0, 0).unwrap();
        let real = Ec::create_gst(&pd, false, false, 0, 0, 0).unwrap();
        offs.adjust_offset_ticks(123);
        real.adjust_offset_ticks(123);
        unsafe {
            assert_eq!((*offs.regs_ptr()).vmcb.as_ref().unwrap().tmr.cntvoff, 123);
            assert_eq!((*real.regs_ptr()).vmcb.as_ref().unwrap().tmr.cntvoff, 0);
        }
    }
}
