//! Hardware plumbing underneath the hypervisor core.
//!
//! This crate collects the pieces that talk to (or stand in for) the machine:
//! console print macros, kernel address translation, the cycle counter, the
//! software page-table walker, per-CPU slot access, and the per-architecture
//! intrinsics. Everything above it is architecture-neutral.
//!
//! Privileged instructions are only emitted for bare-metal builds
//! (`target_os = "none"`). Hosted builds get functional stand-ins so the
//! upper layers can be exercised as ordinary programs.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod arch;
pub mod ipi;
pub mod percpu;
pub mod ptab;
pub mod timer;

/// Maximum number of CPUs this kernel can support.
pub const MAX_CPU: usize = 4;
