//! The capability-invocation syscall.
//!
//! The kernel's only ABI: one entry instruction, a selector in the first
//! general-purpose register, a capability index in the second, operands
//! in the next few. The entry vector stores the register file and invokes
//! the current EC's continuation, which lands here; every branch finishes
//! by writing a status into GPR0 and returning to user mode — or by
//! suspending the caller in a rendezvous.

use crate::ec::{Cont, Ec};
use crate::event;
use crate::kobj::{KObj, Subtype};
use crate::pd::Pd;
use crate::sched::{Sc, Scheduler};
use crate::space_obj::{CapPerms, Capability};
use crate::Status;
use plinth::addressing::Va;

/// Syscall selectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sys {
    Call,
    Reply,
    CreateEc,
    CreateSc,
    CreatePd,
    Revoke,
    CtrlHw,
    AssignInt,
}

impl Sys {
    fn decode(raw: usize) -> Option<Sys> {
        Some(match raw {
            0 => Sys::Call,
            1 => Sys::Reply,
            2 => Sys::CreateEc,
            3 => Sys::CreateSc,
            4 => Sys::CreatePd,
            5 => Sys::Revoke,
            6 => Sys::CtrlHw,
            7 => Sys::AssignInt,
            _ => return None,
        })
    }
}

/// Decoded syscall arguments, straight from the register file.
pub struct SysArgs {
    pub sys: Option<Sys>,
    pub cap: usize,
    pub arg: [usize; 4],
}

impl SysArgs {
    pub fn decode(gpr: &[usize; 31]) -> Self {
        Self {
            sys: Sys::decode(gpr[0]),
            cap: gpr[1],
            arg: [gpr[2], gpr[3], gpr[4], gpr[5]],
        }
    }
}

/// Write the result and complete the return to user mode.
fn sys_finish(ec: &'static Ec, status: Option<Status>) -> ! {
    unsafe {
        (*ec.regs_ptr()).exc.sys.gpr[0] = status.map_or(0, Status::code);
    }
    Ec::ret_user_hypercall(ec)
}

/// Continuation installed by the hypercall entry vector.
pub fn sys_hypercall(ec: &'static Ec) -> ! {
    let args = unsafe { SysArgs::decode(&(*ec.regs_ptr()).exc.sys.gpr) };

    let res = match args.sys {
        None => Err(Status::BadHyp),
        Some(Sys::Call) => sys_call(ec, &args),
        Some(Sys::Reply) => sys_reply(ec),
        Some(Sys::CreateEc) => sys_create_ec(ec, &args),
        Some(Sys::CreateSc) => sys_create_sc(ec, &args),
        Some(Sys::CreatePd) => sys_create_pd(ec, &args),
        Some(Sys::Revoke) => sys_revoke(ec, &args),
        Some(Sys::CtrlHw) => sys_ctrl_hw(ec, &args),
        Some(Sys::AssignInt) => sys_assign_int(ec, &args),
    };
    sys_finish(ec, res.err())
}

/// Rendezvous with a local EC: park the caller, hand over the message.
///
/// Diverges on success; an error falls back to the ordinary return path.
fn sys_call(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let cap = lookup(ec, args.cap)?;
    if !cap.perms().contains(CapPerms::CALL) {
        return Err(Status::BadCap);
    }
    let callee = cap.get::<Ec>().ok_or(Status::BadCap)?;
    if callee.cpu() != ec.cpu() || callee.kobj().subtype() != Subtype::EcLocal {
        return Err(Status::BadCpu);
    }

    // Move the caller's message into the callee's transfer page.
    unsafe {
        let caller_utcb = ec.utcb().ok_or(Status::Aborted)?;
        let callee_utcb = callee.utcb().ok_or(Status::Aborted)?;
        (*callee_utcb.get()).gpr = (*caller_utcb.get()).gpr;
        (*callee_utcb.get()).sel = args.arg[0];
    }

    callee.set_caller(ec.grab());
    ec.set_cont(Ec::ret_user_hypercall);
    callee.set_cont(Ec::ret_user_exception);

    let callee = Scheduler::make_current(callee);
    callee.invoke_cont()
}

/// Resume the parked rendezvous partner with this EC's reply.
fn sys_reply(ec: &'static Ec) -> Result<(), Status> {
    let caller = ec.take_caller().ok_or(Status::Aborted)?;

    unsafe {
        if let (Some(mine), Some(theirs)) = (ec.utcb(), caller.utcb()) {
            (*theirs.get()).gpr = (*mine.get()).gpr;
        }
        (*caller.regs_ptr()).exc.sys.gpr[0] = 0;
    }

    let caller = Scheduler::make_current(caller);
    caller.invoke_cont()
}

/// Create an EC inside a protection domain named by a Pd capability.
///
/// `arg[0]` packs flags (bit 0: global host EC / offset-timer vCPU, bit 1:
/// wants FPU, bit 2: vCPU), `arg[1]` packs the CPU in its low byte and the
/// event base above, `arg[2]` is the initial stack pointer, `arg[3]` the
/// UTCB address for host ECs. The new capability lands at `cap + 1`.
fn sys_create_ec(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let cap = lookup(ec, args.cap)?;
    if !cap.perms().contains(CapPerms::CTRL) {
        return Err(Status::BadCap);
    }
    let pd = cap.get::<Pd>().ok_or(Status::BadCap)?;

    let flags = args.arg[0];
    let cpu = args.arg[1] & 0xff;
    let evt = args.arg[1] >> 8;
    let sp = args.arg[2] as u64;

    let new = if flags & 0b100 != 0 {
        Ec::create_gst(&pd, flags & 0b001 != 0, flags & 0b010 != 0, cpu, evt, sp)?
    } else {
        let hva = Va::new(args.arg[3]).ok_or(Status::BadPar)?;
        Ec::create_hst(&pd, flags & 0b001 != 0, flags & 0b010 != 0, cpu, evt, sp, hva)?
    };

    let obj = ec.obj().ok_or(Status::Aborted)?;
    obj.insert(args.cap + 1, Capability::new(new, CapPerms::all()))
}

/// Attach a scheduling context to an EC capability.
fn sys_create_sc(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let cap = lookup(ec, args.cap)?;
    if !cap.perms().contains(CapPerms::BIND) {
        return Err(Status::BadCap);
    }
    let target = cap.get::<Ec>().ok_or(Status::BadCap)?;

    let sc = Sc::create(target)?;
    let obj = ec.obj().ok_or(Status::Aborted)?;
    obj.insert(args.arg[0], Capability::new(sc.clone(), CapPerms::CTRL))?;
    Scheduler::ready_enqueue(sc);
    Ok(())
}

/// Create a protection domain; `arg[0]` bit 0 grants a guest space.
fn sys_create_pd(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let cap = lookup(ec, args.cap)?;
    if !cap.perms().contains(CapPerms::CTRL) {
        return Err(Status::BadCap);
    }
    // Only a Pd capability may mint Pds.
    cap.get::<Pd>().ok_or(Status::BadCap)?;

    let pd = Pd::create(args.arg[0] & 1 != 0)?;
    let obj = ec.obj().ok_or(Status::Aborted)?;
    obj.insert(args.arg[1], Capability::new(pd, CapPerms::all()))
}

/// Clear a capability slot; the object's reference follows the usual
/// deferred-destruction road.
fn sys_revoke(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let obj = ec.obj().ok_or(Status::Aborted)?;
    obj.revoke(args.cap)
}

/// Control operations on hardware-facing objects. The one the core owns:
/// initialising a vCPU's register state, which clears its `ILLEGAL`
/// hazard and makes it schedulable.
fn sys_ctrl_hw(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let cap = lookup(ec, args.cap)?;
    if !cap.perms().contains(CapPerms::CTRL) {
        return Err(Status::BadCap);
    }
    let target = cap.get::<Ec>().ok_or(Status::BadCap)?;
    if !target.is_vcpu() {
        return Err(Status::BadFtr);
    }
    if target.cpu() != ec.cpu() {
        return Err(Status::BadCpu);
    }

    // Seed the guest from the manager's transfer page.
    unsafe {
        let utcb = ec.utcb().ok_or(Status::Aborted)?;
        let regs = &mut *target.regs_ptr();
        (*utcb.get()).store_to(&mut regs.exc.sys);
        regs.exc.set_ip((*utcb.get()).ip);
        regs.exc.set_sp((*utcb.get()).sp);
    }
    target.set_cont(Ec::ret_user_vmexit);
    target.hazard().clr(crate::hazard::Hazard::ILLEGAL);
    Ok(())
}

/// Route an interrupt vector to a CPU and bind its event selector.
///
/// The interrupt controller itself is driver territory; the core only
/// validates the binding and records the handler capability at the IRQ
/// event selector.
fn sys_assign_int(ec: &'static Ec, args: &SysArgs) -> Result<(), Status> {
    let cap = lookup(ec, args.cap)?;
    if !cap.perms().contains(CapPerms::BIND) {
        return Err(Status::BadCap);
    }
    let handler = cap.get::<Ec>().ok_or(Status::BadCap)?;
    let cpu = args.arg[0];
    if cpu >= plinth::MAX_CPU || crate::cpu::Cpu::online_mask() & (1 << cpu) == 0 {
        return Err(Status::BadCpu);
    }

    let obj = ec.obj().ok_or(Status::Aborted)?;
    obj.insert(
        handler.evt() + event::HST_ARCH + event::IRQ,
        Capability::new(handler, CapPerms::BIND),
    )
}

fn lookup(ec: &Ec, sel: usize) -> Result<Capability, Status> {
    let obj = ec.obj().ok_or(Status::Aborted)?;
    let cap = obj.lookup(sel);
    if cap.is_null() {
        return Err(Status::BadCap);
    }
    Ok(cap)
}

/// Keep the continuation type in one visible place for the entry vector.
pub const HYPERCALL_CONT: Cont = sys_hypercall;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_decoding() {
        let mut gpr = [0usize; 31];
        gpr[0] = 3;
        gpr[1] = 42;
        gpr[2] = 7;
        let args = SysArgs::decode(&gpr);
        assert_eq!(args.sys, Some(Sys::CreateSc));
        assert_eq!(args.cap, 42);
        assert_eq!(args.arg[0], 7);

        gpr[0] = 99;
        assert_eq!(SysArgs::decode(&gpr).sys, None);
    }
}
