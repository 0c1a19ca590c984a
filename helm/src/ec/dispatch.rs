//! The continuation dispatcher.
//!
//! Every return to a lower privilege level funnels through one of three
//! paths — hypercall return, exception return, VM-exit return — and each
//! path settles the effective hazard set first. Diverting causes are
//! checked in fixed priority order; a *reload* parks the current
//! continuation and yields, a *divert* redirects the EC to its
//! exception-message path. Past the point of no return the ownership-style
//! work happens (FPU residency, boot metrics, quiescence report), then the
//! address-space switch, then the architectural return.

use super::{Cont, Ec};
use crate::cpu::Cpu;
use crate::event;
use crate::fpu;
use crate::hazard::{self, Hazard};
use crate::init;
use crate::kobj::{KObj, Ref, Subtype};
use crate::rcu::Rcu;
use crate::regs::ExcRegs;
use crate::sched::Scheduler;
use crate::vmcb::Vmcb;
use plinth::timer;

/// Hazards a host-bound return path cares about.
const MASK_HST: u32 = Hazard::ILLEGAL
    | Hazard::RECALL
    | Hazard::FPU
    | Hazard::BOOT_HST
    | Hazard::RCU
    | Hazard::SLEEP
    | Hazard::SCHED;

/// Hazards a guest-bound return path cares about.
const MASK_GST: u32 = Hazard::ILLEGAL
    | Hazard::RECALL
    | Hazard::FPU
    | Hazard::BOOT_GST
    | Hazard::RCU
    | Hazard::SLEEP
    | Hazard::SCHED;

/// A diverting cause, picked in fixed priority order.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Diversion {
    /// Park the continuation and power the CPU down.
    Sleep,
    /// Park the continuation and run the scheduler.
    Sched,
    /// Kill the EC.
    Kill,
    /// Redirect the EC to its recall event.
    Recall,
}

impl Diversion {
    /// First pending diverting cause for the given CPU and EC hazard
    /// words, or none. `SLEEP` and `SCHED` live on the CPU word, `RECALL`
    /// on the EC word; `ILLEGAL` wins over `RECALL` wherever it sits.
    pub(crate) fn pending(cpu_h: u32, ec_h: u32) -> Option<Diversion> {
        if cpu_h & Hazard::SLEEP != 0 {
            Some(Diversion::Sleep)
        } else if cpu_h & Hazard::SCHED != 0 {
            Some(Diversion::Sched)
        } else if (cpu_h | ec_h) & Hazard::ILLEGAL != 0 {
            Some(Diversion::Kill)
        } else if ec_h & Hazard::RECALL != 0 {
            Some(Diversion::Recall)
        } else {
            None
        }
    }
}

impl Ec {
    /// Settle the non-FPU part of an effective hazard set `h`.
    ///
    /// `func` is the return path to resume as after a reload. Diverting
    /// branches do not come back; the bookkeeping branches do.
    pub(crate) fn handle_hazard(&'static self, h: u32, func: Cont) {
        if h & Hazard::DIVERT != 0 {
            // Interrupts first: whatever fired may retract or add causes.
            Cpu::preemption_point();

            match Diversion::pending(Cpu::hazard().get(), self.hazard().get()) {
                Some(Diversion::Sleep) => {
                    self.set_cont(func);
                    Cpu::fini();
                }
                Some(Diversion::Sched) => {
                    self.set_cont(func);
                    Scheduler::schedule();
                }
                Some(Diversion::Kill) => self.kill("illegal execution state"),
                Some(Diversion::Recall) => {
                    self.redirect_to_recall();
                    self.send_exc_msg(func);
                }
                None => {}
            }
        }

        if h & Hazard::BOOT_HST != 0 {
            Cpu::hazard().clr(Hazard::BOOT_HST);
            info!(
                "TIME: first host EC after {}ms",
                timer::ticks_to_ms(timer::time().wrapping_sub(init::boot_ts()))
            );
        }

        if h & Hazard::BOOT_GST != 0 {
            Cpu::hazard().clr(Hazard::BOOT_GST);
            info!(
                "TIME: first guest EC after {}ms",
                timer::ticks_to_ms(timer::time().wrapping_sub(init::boot_ts()))
            );
        }

        if h & Hazard::RCU != 0 {
            Rcu::quiet();
        }
    }

    /// Point the entry-point selector at the recall event of the EC's
    /// flavour and retire the request.
    pub(crate) fn redirect_to_recall(&self) {
        self.hazard().clr(Hazard::RECALL);
        let win = if self.is_vcpu() {
            event::GST_ARCH
        } else {
            event::HST_ARCH
        };
        unsafe { (*self.regs_ptr()).exc.set_ep(self.evt + win + event::RECALL) };
    }

    /// The EC registered to handle this EC's current entry event: a local
    /// host EC on the same CPU, bound at `event base + selector` in the
    /// object space.
    pub(crate) fn exc_handler(&self) -> Option<Ref<Ec>> {
        let handler = self.obj()?.lookup(self.ep()).get::<Ec>()?;
        (handler.cpu() == self.cpu() && handler.kobj().subtype() == Subtype::EcLocal)
            .then_some(handler)
    }

    /// Stage this EC's fault state into the handler's transfer page.
    pub(crate) fn stage_msg_to(&self, handler: &Ec) {
        let utcb = handler.utcb().expect("local host EC without UTCB");
        unsafe {
            let regs = &(*self.regs_ptr()).exc;
            (*utcb.get()).load_from(&regs.sys, regs.ip(), regs.sp(), self.ep());
            (*handler.regs_ptr()).exc.set_ep(self.ep());
        }
    }

    /// Divert to the exception-message path: park here, deliver the entry
    /// event to its handler, and run the handler. No handler means the EC
    /// dies.
    pub(crate) fn send_exc_msg(&'static self, ret: Cont) -> ! {
        let handler = match self.exc_handler() {
            Some(h) => h,
            None => self.kill("no event handler"),
        };

        self.stage_msg_to(&handler);
        handler.set_caller(self.grab());
        self.set_cont(ret);
        handler.set_cont(Ec::ret_user_exception);

        let handler = Scheduler::make_current(handler);
        handler.invoke_cont()
    }

    /// Return to a host EC that entered through the hypercall vector.
    pub fn ret_user_hypercall(ec: &'static Ec) -> ! {
        let h = hazard::effective(Cpu::hazard().get(), ec.hazard().get(), MASK_HST);
        if h != 0 {
            ec.handle_hazard(h, Ec::ret_user_hypercall);
        }

        ec.finish_ret_host()
    }

    /// Return to a host EC that entered through an exception or upcall.
    pub fn ret_user_exception(ec: &'static Ec) -> ! {
        let h = hazard::effective(Cpu::hazard().get(), ec.hazard().get(), MASK_HST);
        if h != 0 {
            ec.handle_hazard(h, Ec::ret_user_exception);
        }

        ec.finish_ret_host()
    }

    /// Common tail of the host-bound paths: evict any resident guest
    /// state, settle FPU residency, switch to the host space, return.
    fn finish_ret_host(&'static self) -> ! {
        unsafe {
            let regs = &(*self.regs_ptr()).exc;
            debug!(
                "EC:{:p} ret to M:{:#x} IP:{:#x} SP:{:#x}",
                self as *const Ec,
                regs.mode(),
                regs.ip(),
                regs.sp()
            );
        }

        if !Vmcb::current().is_null() {
            Vmcb::load_hst();
        }

        fpu::transition(self);

        self.hst().expect("host return without host space").make_current();

        unsafe { load_state(&(*self.regs_ptr()).exc) }
    }

    /// Return to a guest vCPU after a VM exit.
    pub fn ret_user_vmexit(ec: &'static Ec) -> ! {
        let h = hazard::effective(Cpu::hazard().get(), ec.hazard().get(), MASK_GST);
        if h != 0 {
            ec.handle_hazard(h, Ec::ret_user_vmexit);
        }

        unsafe {
            debug!(
                "EC:{:p} ret to guest IP:{:#x}",
                ec as *const Ec,
                (*ec.regs_ptr()).exc.ip()
            );

            let vmcb = (*ec.regs_ptr())
                .vmcb
                .as_ref()
                .expect("vCPU without VM control block");
            if Vmcb::current() != (vmcb.as_ref() as *const Vmcb).cast_mut() {
                // Restore the full register state.
                vmcb.load_gst();
            } else {
                // Only the virtual-timer state can have moved.
                vmcb.load_tmr();
            }
        }

        fpu::transition(ec);

        ec.gst().expect("guest return without guest space").make_current();

        unsafe { load_state(&(*ec.regs_ptr()).exc) }
    }
}

/// First continuation of a fresh vCPU: hand the manager the machine
/// identity it virtualises, then deliver the startup event.
///
/// The vCPU itself stays `ILLEGAL` until the manager initialises its
/// register state; entering the guest before that kills it.
pub fn set_vmm_regs(ec: &'static Ec) -> ! {
    assert!(ec.is_vcpu());
    assert_eq!(ec.cpu(), Cpu::id());

    unsafe {
        let regs = &mut *ec.regs_ptr();
        let vmcb = regs.vmcb.as_mut().expect("vCPU without VM control block");
        vmcb.hyp.vpidr = Cpu::local().features.load(core::sync::atomic::Ordering::SeqCst);
        vmcb.hyp.vmpidr = Cpu::id() as u64;
        regs.exc.sys.gpr[0] = vmcb.hyp.vpidr as usize;
        regs.exc.sys.gpr[1] = vmcb.hyp.vmpidr as usize;
    }

    ec.send_exc_msg(Ec::ret_user_vmexit)
}

/// Restore a register file and drop to the lower privilege level.
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
unsafe fn load_state(regs: *const ExcRegs) -> ! {
    // The register file layout is fixed: 31 GPRs, then SP/TLS, then
    // ELR/SPSR. The stack pointer walks the file so every GPR can be
    // restored.
    core::arch::asm!(
        "mov sp, {r}",
        "ldr x0, [sp, #248]",
        "msr sp_el0, x0",
        "ldr x0, [sp, #256]",
        "msr tpidr_el0, x0",
        "ldr x0, [sp, #264]",
        "msr tpidrro_el0, x0",
        "ldr x0, [sp, #272]",
        "msr elr_el2, x0",
        "ldr x0, [sp, #280]",
        "msr spsr_el2, x0",
        "ldp x0, x1, [sp], #16",
        "ldp x2, x3, [sp], #16",
        "ldp x4, x5, [sp], #16",
        "ldp x6, x7, [sp], #16",
        "ldp x8, x9, [sp], #16",
        "ldp x10, x11, [sp], #16",
        "ldp x12, x13, [sp], #16",
        "ldp x14, x15, [sp], #16",
        "ldp x16, x17, [sp], #16",
        "ldp x18, x19, [sp], #16",
        "ldp x20, x21, [sp], #16",
        "ldp x22, x23, [sp], #16",
        "ldp x24, x25, [sp], #16",
        "ldp x26, x27, [sp], #16",
        "ldp x28, x29, [sp], #16",
        "ldr x30, [sp], #8",
        "eret",
        r = in(reg) regs,
        options(noreturn)
    )
}

/// Restore a register file and drop to the lower privilege level.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
unsafe fn load_state(regs: *const ExcRegs) -> ! {
    // The neutral register file indexes the x86 integer registers through
    // gpr[0..15]; ip/sp/psw ride in the supervisor words.
    core::arch::asm!(
        "mov rsp, {r}",
        "mov rcx, [rsp + 272]", // ip
        "mov r11, [rsp + 280]", // psw
        "mov rsp, [rsp + 248]", // user stack
        "sysretq",
        r = in(reg) regs,
        options(noreturn)
    )
}

/// Restore a register file and drop to the lower privilege level.
#[cfg(not(target_os = "none"))]
unsafe fn load_state(_regs: *const ExcRegs) -> ! {
    unreachable!("hosted builds cannot enter a lower privilege level")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pd::Pd;
    use crate::space_obj::{CapPerms, Capability};
    use plinth::addressing::Va;

    #[test]
    fn diversion_priority() {
        use Diversion::*;
        // SLEEP beats SCHED; both park the continuation.
        assert_eq!(
            Diversion::pending(Hazard::SLEEP | Hazard::SCHED, 0),
            Some(Sleep)
        );
        assert_eq!(Diversion::pending(Hazard::SCHED, 0), Some(Sched));
        // ILLEGAL beats RECALL regardless of which word carries it.
        assert_eq!(
            Diversion::pending(0, Hazard::ILLEGAL | Hazard::RECALL),
            Some(Kill)
        );
        assert_eq!(Diversion::pending(Hazard::ILLEGAL, Hazard::RECALL), Some(Kill));
        assert_eq!(Diversion::pending(0, Hazard::RECALL), Some(Recall));
        // Bookkeeping bits divert nothing.
        assert_eq!(Diversion::pending(Hazard::BOOT_HST | Hazard::RCU, 0), None);
    }

    #[test]
    fn recall_redirects_vcpu_to_its_recall_event() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(0) };
        let pd = Pd::create(true).unwrap();
        let evt = 0x200;
        let vcpu = Ec::create_gst(&pd, false, false, 0, evt, 0).unwrap();

        // The handler: a local host EC on the same CPU, bound at the
        // guest recall event.
        let handler = Ec::create_hst(
            &pd,
            false,
            false,
            0,
            0,
            0x8000,
            Va::new(0x7f00_0000).unwrap(),
        )
        .unwrap();
        pd.get_obj()
            .unwrap()
            .insert(
                evt + event::GST_ARCH + event::RECALL,
                Capability::new(handler.clone(), CapPerms::BIND),
            )
            .unwrap();

        // The manager initialised the vCPU; it is no longer condemned.
        vcpu.hazard().clr(Hazard::ILLEGAL);

        // A remote CPU asks the vCPU to re-enter the kernel.
        vcpu.hazard().set(Hazard::RECALL);
        assert_eq!(
            Diversion::pending(0, vcpu.hazard().get()),
            Some(Diversion::Recall)
        );

        // The dispatcher's redirect rewrites the entry-point selector...
        vcpu.redirect_to_recall();
        assert_eq!(vcpu.ep(), evt + event::GST_ARCH + event::RECALL);
        assert!(!vcpu.hazard().tst(Hazard::RECALL));

        // ...and resolves the associated host EC as the upcall target.
        let target = vcpu.exc_handler().unwrap();
        assert_eq!(target.as_ptr(), handler.as_ptr());

        // Delivery stages the vCPU's state into the handler's UTCB.
        vcpu.stage_msg_to(&target);
        unsafe {
            let utcb = &*handler.utcb().unwrap().get();
            assert_eq!(utcb.sel, evt + event::GST_ARCH + event::RECALL);
        }
        assert_eq!(handler.ep(), evt + event::GST_ARCH + event::RECALL);
    }

    #[test]
    fn boot_metric_reports_once() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(0) };
        let pd = Pd::create(false).unwrap();
        let ec = Ec::create_hst(&pd, true, false, 0, 0, 0, Va::new(0x7e00_0000).unwrap())
            .unwrap();
        // Leak into a 'static borrow the way the dispatcher sees it.
        let ec_ref: &'static Ec = unsafe { &*ec.as_ptr().as_ptr() };

        Cpu::hazard().clr(u32::MAX);
        Cpu::hazard().set(Hazard::BOOT_HST);

        let h = hazard::effective(Cpu::hazard().get(), ec.hazard().get(), MASK_HST);
        assert_eq!(h, Hazard::BOOT_HST);
        ec_ref.handle_hazard(h, Ec::ret_user_exception);
        assert!(!Cpu::hazard().tst(Hazard::BOOT_HST));

        // Second dispatch sees nothing left to report.
        assert_eq!(
            hazard::effective(Cpu::hazard().get(), ec.hazard().get(), MASK_HST),
            0
        );
    }
}
