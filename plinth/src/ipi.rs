//! Inter-processor interrupt transport.
//!
//! The interrupt controller is a driver concern. The core only needs "poke
//! CPU n"; the embedder registers how that is done.

use spin_lock::SpinLock;

static TRANSPORT: SpinLock<Option<fn(usize)>> = SpinLock::new(None);

/// Register the IPI transport.
pub fn set_transport(f: fn(usize)) {
    *TRANSPORT.lock() = Some(f);
}

/// Poke a remote CPU. Dropped if no transport is registered yet.
pub fn send(cpu: usize) {
    if let Some(f) = *TRANSPORT.lock() {
        f(cpu)
    }
}
