//! Read-Copy Update.
//!
//! The quiescence protocol that defers destruction until no CPU can hold a
//! stale pointer. Callbacks are embedded in the objects they free — nothing
//! on these paths allocates.
//!
//! Global state is a phase word `(batch << 2) | PND | CMP` and a countdown
//! of CPUs that still owe a quiescence report. Per CPU there are three
//! intrusive lists: `next` (registered since the last promotion), `curr`
//! (riding the in-flight batch), and `done` (batch complete, ready to
//! invoke). A callback registered at batch `b` runs strictly after every
//! CPU has reported quiescence during `b` — for ECs that means every CPU
//! has returned to user or guest mode since the free was posted.

use crate::counter;
use crate::cpu::{Cpu, PreemptGuard};
use crate::hazard::Hazard;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use plinth::percpu::PerCpu;
use plinth::MAX_CPU;

/// An intrusive deferred-work node.
///
/// Embed one in any object that needs grace-period destruction; `func`
/// receives the node pointer and owns whatever it points into.
pub struct RcuElem {
    next: AtomicPtr<RcuElem>,
    func: unsafe fn(*mut RcuElem),
}

impl RcuElem {
    pub const fn new(func: unsafe fn(*mut RcuElem)) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            func,
        }
    }
}

struct RcuList {
    head: *mut RcuElem,
    tail: *mut RcuElem,
}

impl RcuList {
    const NEW: Self = Self {
        head: ptr::null_mut(),
        tail: ptr::null_mut(),
    };

    fn enqueue(&mut self, e: *mut RcuElem) {
        unsafe { (*e).next.store(ptr::null_mut(), Ordering::SeqCst) };
        if self.head.is_null() {
            self.head = e;
        } else {
            unsafe { (*self.tail).next.store(e, Ordering::SeqCst) };
        }
        self.tail = e;
    }

    /// Splice `other` onto the tail of `self`, leaving `other` empty.
    fn append(&mut self, other: &mut RcuList) {
        if other.head.is_null() {
            return;
        }
        if self.head.is_null() {
            self.head = other.head;
        } else {
            unsafe { (*self.tail).next.store(other.head, Ordering::SeqCst) };
        }
        self.tail = other.tail;
        *other = Self::NEW;
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

struct RcuCpu {
    /// Last batch number this CPU observed.
    l_batch: usize,
    /// Batch number `curr` is waiting on.
    c_batch: usize,
    next: RcuList,
    curr: RcuList,
    done: RcuList,
}

// The lists hold raw pointers, but a CPU's slot is only ever touched by
// its owner.
unsafe impl Send for RcuCpu {}

impl RcuCpu {
    const NEW: Self = Self {
        l_batch: 0,
        c_batch: 0,
        next: RcuList::NEW,
        curr: RcuList::NEW,
        done: RcuList::NEW,
    };
}

const PCPU_INIT: RcuCpu = RcuCpu::NEW;
static PCPU: PerCpu<RcuCpu> = PerCpu::new([PCPU_INIT; MAX_CPU]);

const CMP: usize = 1 << 0;
const PND: usize = 1 << 1;

static STATE: AtomicUsize = AtomicUsize::new(CMP);
static COUNT: AtomicUsize = AtomicUsize::new(0);

/// Grace-period coordinator.
pub struct Rcu;

impl Rcu {
    #[inline]
    fn batch() -> usize {
        STATE.load(Ordering::SeqCst) >> 2
    }

    /// Whether batch `b` has completed: the phase word has moved past
    /// `(b << 2) | CMP`.
    #[inline]
    fn complete(b: usize) -> bool {
        STATE
            .load(Ordering::SeqCst)
            .wrapping_sub((b << 2) | CMP) as isize
            >= 0
    }

    /// Register a deferred callback on the executing CPU.
    ///
    /// The callback's lifetime obligation transfers to the coordinator: it
    /// must stay valid until invoked, which is what embedding it in the
    /// object being freed guarantees.
    pub fn call(e: *mut RcuElem) {
        let _p = PreemptGuard::new();
        unsafe { (*PCPU.local()).next.enqueue(e) };
    }

    /// Try to move the global phase forward.
    ///
    /// `s` is the phase bit this CPU wants to assert: `PND` when it starts a
    /// batch, `CMP` when the last quiescence report lands. The CPU that
    /// completes the `PND|CMP` pair rearms the countdown and increments the
    /// batch number; the increment also rolls both phase bits back to zero.
    fn start_batch(s: usize) {
        let l_batch = unsafe { (*PCPU.local()).l_batch };
        let mut v;
        loop {
            v = STATE.load(Ordering::SeqCst);
            if v >> 2 != l_batch {
                return;
            }
            if v & s != 0 {
                break;
            }
            if STATE
                .compare_exchange(v, v | s, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        // Advance only on the transition that completed the phase pair.
        if (v ^ !s) & (CMP | PND) != 0 {
            return;
        }

        COUNT.store(Cpu::count(), Ordering::SeqCst);

        // The countdown reset must be visible before any CPU can observe
        // the new batch number.
        core::sync::atomic::fence(Ordering::SeqCst);

        STATE.fetch_add(1, Ordering::SeqCst);
    }

    /// Report a quiescent state for the executing CPU.
    ///
    /// Called from the dispatcher when the `RCU` hazard is pending; the CPU
    /// is then known to hold no protected pointers.
    pub fn quiet() {
        Cpu::hazard().clr(Hazard::RCU);

        if COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
            Self::start_batch(CMP);
        }
    }

    /// Periodic bookkeeping, run from the timer tick.
    ///
    /// Notices a new batch (and arms the `RCU` hazard), retires `curr` into
    /// `done` once its batch completed, promotes `next` into `curr`, and
    /// invokes whatever is ready.
    pub fn update() {
        let _p = PreemptGuard::new();
        let pcpu = unsafe { &mut *PCPU.local() };

        if pcpu.l_batch != Self::batch() {
            pcpu.l_batch = Self::batch();
            Cpu::hazard().set(Hazard::RCU);
        }

        if !pcpu.curr.is_empty() && Self::complete(pcpu.c_batch) {
            pcpu.done.append(&mut pcpu.curr);
        }

        if pcpu.curr.is_empty() && !pcpu.next.is_empty() {
            pcpu.curr.append(&mut pcpu.next);

            pcpu.c_batch = pcpu.l_batch.wrapping_add(1);

            Self::start_batch(PND);
        }

        if !pcpu.done.is_empty() {
            Self::invoke_batch(pcpu);
        }
    }

    fn invoke_batch(pcpu: &mut RcuCpu) {
        let mut e = pcpu.done.head;
        while !e.is_null() {
            let n = unsafe { (*e).next.load(Ordering::SeqCst) };
            counter::RCU_INVOKE.inc();
            unsafe { ((*e).func)(e) };
            e = n;
        }
        pcpu.done = RcuList::NEW;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread::scope;

    static FIRED: AtomicBool = AtomicBool::new(false);

    unsafe fn mark(_: *mut RcuElem) {
        FIRED.store(true, Ordering::SeqCst);
    }

    /// Reset the coordinator to its boot state. Anything still queued from
    /// an earlier test is abandoned (tests only queue heap or dead-stack
    /// elements they no longer care about).
    pub(crate) fn reset(cpus: usize) {
        Cpu::setup(cpus, 0);
        STATE.store(CMP, Ordering::SeqCst);
        COUNT.store(0, Ordering::SeqCst);
        for c in 0..plinth::MAX_CPU {
            unsafe { *PCPU.remote(c) = RcuCpu::NEW };
            Cpu::remote_hazard(c).clr(Hazard::RCU);
        }
    }

    #[test]
    fn grace_period_waits_for_every_cpu() {
        let _gate = crate::testing::lock();
        reset(3);
        FIRED.store(false, Ordering::SeqCst);

        let mut elem = RcuElem::new(mark);

        // CPU 0 posts a callback and starts a batch.
        unsafe { plinth::arch::set_cpu_id(0) };
        Rcu::call(&mut elem);
        Rcu::update();
        // The second pass notices the new batch and owes a report for it.
        Rcu::update();
        assert!(Cpu::hazard().tst(Hazard::RCU));

        // CPUs 1 and 2 pass through quiescence; CPU 0 has not yet.
        scope(|s| {
            for c in 1..3usize {
                s.spawn(move || {
                    unsafe { plinth::arch::set_cpu_id(c) };
                    Rcu::update();
                    assert!(Cpu::hazard().tst(Hazard::RCU));
                    Rcu::quiet();
                });
            }
        });
        assert!(!FIRED.load(Ordering::SeqCst));

        // CPU 0 reports last: countdown hits zero, completion phase starts.
        unsafe { plinth::arch::set_cpu_id(0) };
        Rcu::quiet();
        assert!(!FIRED.load(Ordering::SeqCst));

        // Next periodic pass notices the completed batch and invokes.
        Rcu::update();
        Rcu::update();
        assert!(FIRED.load(Ordering::SeqCst));
    }
}
