//! Per-architecture intrinsics.
//!
//! Exactly one backend is compiled in: `aarch64` or `x86_64` for bare-metal
//! images, and `hosted` for everything else. The backends agree on this
//! surface:
//!
//! - `cpu_id()` — index of the executing CPU.
//! - `preemption_disable/enable/point`, `halt` — interrupt masking.
//! - `install_root(tag_root)` — install a translation root tagged with its
//!   address-space identifier in the upper bits, in one register write.
//! - `invalidate_tlb(vmid)` — broadcast invalidation for one identifier.
//! - `fpu_trap_enable/disable` — arm or disarm the lower-EL FPU access trap.
//! - `feature_word()` — compact CPU feature vector.

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod aarch64;
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub use aarch64::*;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use x86_64::*;

#[cfg(not(target_os = "none"))]
mod hosted;
#[cfg(not(target_os = "none"))]
pub use hosted::*;
