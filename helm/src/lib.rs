//! A microhypervisor core.
//!
//! This crate multiplexes a machine between mutually distrusting guests and
//! user-mode components. The schedulable unit is the *execution context*
//! ([`ec::Ec`]): a kernel thread, a user-mode thread, or a virtual CPU. The
//! kernel keeps no stack across a return to lower privilege; every kernel
//! entry tail-calls the continuation stored on the current EC, and every
//! return to user or guest mode funnels through the hazard dispatcher, which
//! settles pending asynchronous work first.
//!
//! Deferred destruction of kernel objects runs through the grace-period
//! coordinator ([`rcu`]): an object becomes free game only after every CPU
//! has passed a quiescent point since its last reference was dropped.
//!
//! The crate is architecture-neutral; `plinth` supplies the per-architecture
//! intrinsics for the aarch64 (EL2) and x86_64 (VMX root) back-ends, and
//! hosted builds run the same logic with stand-ins, which is how the tests
//! exercise it.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
extern crate plinth;

pub mod counter;
pub mod cpu;
pub mod ec;
pub mod event;
pub mod fpu;
pub mod hazard;
pub mod init;
pub mod kobj;
pub mod pd;
pub mod rcu;
pub mod refcount;
pub mod regs;
pub mod sched;
pub mod space_mem;
pub mod space_obj;
pub mod syscall;
pub mod utcb;
pub mod vmcb;

/// Error conditions surfaced to lower-privilege callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Operation timed out.
    Timeout,
    /// A required object does not exist.
    Aborted,
    /// Invocation of an unimplemented operation.
    BadHyp,
    /// Capability does not name a usable object.
    BadCap,
    /// Malformed argument.
    BadPar,
    /// Feature not available.
    BadFtr,
    /// CPU out of range or offline.
    BadCpu,
    /// Object allocation failed.
    MemObj,
    /// Capability-slot allocation failed.
    MemCap,
}

impl Status {
    /// Wire encoding on the syscall return path; 0 means success.
    pub fn code(self) -> usize {
        match self {
            Status::Timeout => 1,
            Status::Aborted => 2,
            Status::BadHyp => 3,
            Status::BadCap => 4,
            Status::BadPar => 5,
            Status::BadFtr => 6,
            Status::BadCpu => 7,
            Status::MemObj => 8,
            Status::MemCap => 9,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Tests that touch kernel-global state (per-CPU banks, RCU phase word,
    /// event counters) serialise on this gate.
    pub fn lock() -> MutexGuard<'static, ()> {
        static GATE: OnceLock<Mutex<()>> = OnceLock::new();
        GATE.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
