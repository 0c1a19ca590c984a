//! Hosted stand-ins.
//!
//! Builds that are not bare-metal get no-op privileged operations and a
//! per-thread CPU binding, so a host thread can stand in for a CPU.

std::thread_local! {
    static CPU: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

/// Index of the CPU the calling thread stands in for.
#[inline]
pub fn cpu_id() -> usize {
    CPU.with(|c| c.get())
}

/// Bind the calling thread to a CPU index.
///
/// # Safety
/// Must be called before anything consults [`cpu_id`] on this thread.
pub unsafe fn set_cpu_id(id: usize) {
    CPU.with(|c| c.set(id));
}

#[inline]
pub fn preemption_disable() {}

#[inline]
pub fn preemption_enable() {}

/// A controlled preemption window.
#[inline]
pub fn preemption_point() {}

/// Stand-in for wait-for-interrupt.
#[inline]
pub fn halt() {
    core::hint::spin_loop();
}

#[inline]
pub fn install_root(_tag_root: u64) {}

#[inline]
pub fn invalidate_tlb(_vmid: u16) {}

#[inline]
pub fn fpu_trap_enable() {}

#[inline]
pub fn fpu_trap_disable() {}

/// Compact feature vector.
#[inline]
pub fn feature_word() -> u64 {
    0
}
