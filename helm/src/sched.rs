//! Scheduling contexts and the per-CPU ready queue.
//!
//! Just enough policy to move ECs between CPUs correctly: one round-robin
//! ready queue per CPU, budget accounting on the timer tick, and the
//! `SCHED` hazard as the only preemption signal. An EC becomes runnable by
//! attaching a scheduling context; enqueueing onto another CPU posts the
//! hazard remotely and pokes that CPU.

use crate::counter;
use crate::cpu::Cpu;
use crate::ec::Ec;
use crate::hazard::Hazard;
use crate::kobj::{free_obj, KObj, KObject, Ref, Subtype};
use crate::rcu::Rcu;
use crate::Status;
use alloc::collections::VecDeque;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use plinth::MAX_CPU;
use spin_lock::SpinLock;

/// Default time budget, in timer ticks.
const DEFAULT_BUDGET: u64 = 5;

/// A scheduling context: the right of one EC to run on one CPU.
#[repr(C, align(32))]
pub struct Sc {
    kobj: KObject,
    ec: Ref<Ec>,
    cpu: usize,
    budget: AtomicU64,
}

unsafe impl KObj for Sc {
    const SUBTYPES: &'static [Subtype] = &[Subtype::Sc];

    fn kobj(&self) -> &KObject {
        &self.kobj
    }
}

impl Sc {
    /// Create a context for `ec` on its affine CPU.
    pub fn create(ec: Ref<Ec>) -> Result<Ref<Sc>, Status> {
        let cpu = ec.cpu();
        Ok(Ref::new(Self {
            kobj: KObject::new(Subtype::Sc, free_obj::<Sc>),
            ec,
            cpu,
            budget: AtomicU64::new(DEFAULT_BUDGET),
        }))
    }

    pub fn ec(&self) -> &Ec {
        &self.ec
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

struct Queues {
    ready: [SpinLock<VecDeque<Ref<Sc>>>; MAX_CPU],
    running: [AtomicPtr<Sc>; MAX_CPU],
}

const READY_INIT: SpinLock<VecDeque<Ref<Sc>>> = SpinLock::new(VecDeque::new());
const RUNNING_INIT: AtomicPtr<Sc> = AtomicPtr::new(ptr::null_mut());
static QUEUES: Queues = Queues {
    ready: [READY_INIT; MAX_CPU],
    running: [RUNNING_INIT; MAX_CPU],
};

/// Per-CPU idle ECs, installed at bring-up.
static IDLE: [AtomicPtr<Ec>; MAX_CPU] = [RUNNING_INIT_EC; MAX_CPU];
const RUNNING_INIT_EC: AtomicPtr<Ec> = AtomicPtr::new(ptr::null_mut());

/// The scheduler.
pub struct Scheduler;

impl Scheduler {
    /// Make `sc` runnable on its CPU. Cross-CPU enqueues post the `SCHED`
    /// hazard remotely.
    pub fn ready_enqueue(sc: Ref<Sc>) {
        let cpu = sc.cpu();
        QUEUES.ready[cpu].lock().push_back(sc);
        if cpu == Cpu::id() {
            Cpu::hazard().set(Hazard::SCHED);
        } else {
            Cpu::set_remote_hazard(cpu, Hazard::SCHED);
        }
    }

    /// Install the idle EC for a CPU at bring-up.
    pub(crate) fn set_idle(cpu: usize, ec: Ref<Ec>) {
        let old = IDLE[cpu].swap(ec.into_raw().as_ptr(), Ordering::SeqCst);
        assert!(old.is_null(), "idle EC installed twice");
    }

    /// Bind `ec` as the executing CPU's current EC, dropping the hold on
    /// the previous one.
    pub(crate) fn make_current(ec: Ref<Ec>) -> &'static Ec {
        let ptr = ec.into_raw();
        let prev = Cpu::exchange_current(ptr.as_ptr());
        if let Some(prev) = NonNull::new(prev) {
            drop(unsafe { Ref::from_raw(prev) });
        }
        unsafe { &*ptr.as_ptr() }
    }

    /// Timer tick: charge the running context, arm the reschedule hazard
    /// when its budget is gone, and drive the grace-period machinery.
    pub fn timer_tick() {
        let running = QUEUES.running[Cpu::id()].load(Ordering::SeqCst);
        if let Some(sc) = unsafe { running.as_ref() } {
            if sc.budget.load(Ordering::SeqCst) > 0
                && sc.budget.fetch_sub(1, Ordering::SeqCst) == 1
            {
                Cpu::hazard().set(Hazard::SCHED);
            }
        }
        Rcu::update();
    }

    /// Pick the next context and run it. Never returns; re-entry happens
    /// through the chosen EC's continuation.
    pub fn schedule() -> ! {
        counter::SCHEDULE.inc();
        Cpu::hazard().clr(Hazard::SCHED);

        let cpu = Cpu::id();

        // Requeue whatever was running, with a fresh budget.
        let prev = QUEUES.running[cpu].swap(ptr::null_mut(), Ordering::SeqCst);
        if let Some(prev) = NonNull::new(prev) {
            let prev = unsafe { Ref::from_raw(prev) };
            prev.budget.store(DEFAULT_BUDGET, Ordering::SeqCst);
            QUEUES.ready[cpu].lock().push_back(prev);
        }

        let next = QUEUES.ready[cpu].lock().pop_front();
        match next {
            Some(sc) => {
                let ec = sc.ec().grab();
                assert_eq!(ec.cpu(), cpu, "EC queued on a foreign CPU");
                QUEUES.running[cpu].store(sc.into_raw().as_ptr(), Ordering::SeqCst);
                Scheduler::make_current(ec).invoke_cont()
            }
            None => {
                let idle = NonNull::new(IDLE[cpu].load(Ordering::SeqCst))
                    .expect("CPU without idle EC");
                // The bank keeps its own hold; take a fresh one to bind.
                let idle = unsafe { &*idle.as_ptr() }.grab();
                Scheduler::make_current(idle).invoke_cont()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pd::Pd;
    use plinth::addressing::Va;

    #[test]
    fn cross_cpu_enqueue_posts_sched_hazard() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(0) };
        Cpu::remote_hazard(2).clr(u32::MAX);

        let pd = Pd::create(false).unwrap();
        let ec = crate::ec::Ec::create_hst(
            &pd,
            true,
            false,
            2,
            0,
            0x9000,
            Va::new(0x7d00_0000).unwrap(),
        )
        .unwrap();
        let sc = Sc::create(ec).unwrap();
        assert_eq!(sc.cpu(), 2);

        Scheduler::ready_enqueue(sc);
        assert!(Cpu::remote_hazard(2).tst(Hazard::SCHED));
        assert!(!Cpu::hazard().tst(Hazard::SCHED));

        // Drain the queue again so later tests start clean.
        QUEUES.ready[2].lock().clear();
        Cpu::remote_hazard(2).clr(u32::MAX);
    }

    #[test]
    fn budget_exhaustion_arms_resched() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(1) };
        Cpu::hazard().clr(u32::MAX);
        crate::cpu::Cpu::setup(2, 0);

        let pd = Pd::create(false).unwrap();
        let ec = crate::ec::Ec::create_hst(
            &pd,
            true,
            false,
            1,
            0,
            0x9000,
            Va::new(0x7c00_0000).unwrap(),
        )
        .unwrap();
        let sc = Sc::create(ec).unwrap();
        QUEUES.running[1].store(sc.clone().into_raw().as_ptr(), Ordering::SeqCst);

        for _ in 0..DEFAULT_BUDGET {
            Scheduler::timer_tick();
        }
        assert!(Cpu::hazard().tst(Hazard::SCHED));

        let p = QUEUES.running[1].swap(ptr::null_mut(), Ordering::SeqCst);
        drop(unsafe { Ref::from_raw(NonNull::new(p).unwrap()) });
        Cpu::hazard().clr(u32::MAX);
    }
}
