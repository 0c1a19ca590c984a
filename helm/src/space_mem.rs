//! Memory spaces.
//!
//! A memory space is a translation context: a page-table root tagged with a
//! virtual-machine identifier so TLB entries survive context switches. Host
//! spaces translate user-mode accesses of host ECs; guest spaces are the
//! second translation stage under a vCPU. Both share one implementation —
//! the identifier and the root travel together in a single architectural
//! register write, which is what makes switching atomic.

use crate::counter;
use crate::cpu::Cpu;
use crate::kobj::{free_obj, KObj, KObject, Ref, Subtype};
use crate::Status;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use plinth::addressing::{Pa, Va};
use plinth::arch;
use plinth::ptab::{Memattr, Permissions, Ptab, PtabError};
use plinth::MAX_CPU;
use spin_lock::SpinLock;

/// A TLB tag distinguishing translation contexts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vmid(u16);

static NEXT_VMID: AtomicU16 = AtomicU16::new(1);

impl Vmid {
    /// Allocate a fresh identifier.
    fn allocate() -> Self {
        Self(NEXT_VMID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

/// Per-CPU record of the installed translation root, so re-installing the
/// current space is free.
const NO_ROOT: AtomicU64 = AtomicU64::new(0);
static CURRENT_ROOT: [AtomicU64; MAX_CPU] = [NO_ROOT; MAX_CPU];

/// The shared body of host and guest spaces.
pub struct SpaceMem {
    vmid: Vmid,
    ptab: SpinLock<Ptab>,
}

impl SpaceMem {
    fn new() -> Self {
        Self {
            vmid: Vmid::allocate(),
            ptab: SpinLock::new(Ptab::new()),
        }
    }

    pub fn vmid(&self) -> Vmid {
        self.vmid
    }

    /// Query the mapping covering `va`.
    pub fn lookup(&self, va: Va) -> Option<(Pa, usize, Permissions, Memattr)> {
        self.ptab.lock().lookup(va)
    }

    /// Install or remove a mapping at leaf `order`. Empty permissions
    /// remove. The change is not TLB-visible until [`sync`].
    ///
    /// [`sync`]: Self::sync
    pub fn update(
        &self,
        va: Va,
        pa: Pa,
        order: usize,
        perms: Permissions,
        attr: Memattr,
    ) -> Result<(), Status> {
        self.ptab
            .lock()
            .update(va, pa, order, perms, attr)
            .map_err(|e| match e {
                PtabError::BadOrder | PtabError::Misaligned => Status::BadPar,
            })
    }

    /// Broadcast the TLB invalidation owed for pending updates.
    pub fn sync(&self) {
        counter::TLB_SHOOTDOWN.inc();
        arch::invalidate_tlb(self.vmid.0);
    }

    /// Tagged root value as the architecture installs it.
    fn tagged_root(&self) -> u64 {
        (self.vmid.0 as u64) << 48 | self.ptab.lock().root_addr().into_usize() as u64
    }

    /// Install this space as the active translation on the executing CPU.
    /// No-op when it is already current.
    pub fn make_current(&self) {
        let tag = self.tagged_root();
        let cur = &CURRENT_ROOT[Cpu::id()];
        if cur.load(Ordering::Relaxed) != tag {
            counter::TLB_ROOT.inc();
            arch::install_root(tag);
            cur.store(tag, Ordering::Relaxed);
        }
    }
}

/// Host memory space: the page tables of user-mode components.
#[repr(C, align(32))]
pub struct SpaceHst {
    kobj: KObject,
    mem: SpaceMem,
}

unsafe impl KObj for SpaceHst {
    const SUBTYPES: &'static [Subtype] = &[Subtype::SpaceHst];

    fn kobj(&self) -> &KObject {
        &self.kobj
    }
}

impl SpaceHst {
    pub fn create() -> Result<Ref<SpaceHst>, Status> {
        Ok(Ref::new(Self {
            kobj: KObject::new(Subtype::SpaceHst, free_obj::<SpaceHst>),
            mem: SpaceMem::new(),
        }))
    }
}

impl core::ops::Deref for SpaceHst {
    type Target = SpaceMem;

    fn deref(&self) -> &SpaceMem {
        &self.mem
    }
}

/// Guest memory space: the second translation stage of a virtual machine.
#[repr(C, align(32))]
pub struct SpaceGst {
    kobj: KObject,
    mem: SpaceMem,
}

unsafe impl KObj for SpaceGst {
    const SUBTYPES: &'static [Subtype] = &[Subtype::SpaceGst];

    fn kobj(&self) -> &KObject {
        &self.kobj
    }
}

impl SpaceGst {
    pub fn create() -> Result<Ref<SpaceGst>, Status> {
        Ok(Ref::new(Self {
            kobj: KObject::new(Subtype::SpaceGst, free_obj::<SpaceGst>),
            mem: SpaceMem::new(),
        }))
    }
}

impl core::ops::Deref for SpaceGst {
    type Target = SpaceMem;

    fn deref(&self) -> &SpaceMem {
        &self.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: usize) -> Va {
        Va::new(v).unwrap()
    }

    #[test]
    fn update_then_lookup_after_sync() {
        let _gate = crate::testing::lock();
        let hst = SpaceHst::create().unwrap();
        let pa = Pa::new(0xcafe_0000).unwrap();
        hst.update(va(0x7f00_0000), pa, 0, Permissions::R | Permissions::U, Memattr::Ram)
            .unwrap();
        hst.sync();
        let (p, order, perms, _) = hst.lookup(va(0x7f00_0000)).unwrap();
        assert_eq!(p, pa);
        assert_eq!(order, 0);
        assert!(perms.contains(Permissions::U));
    }

    #[test]
    fn make_current_is_idempotent() {
        let _gate = crate::testing::lock();
        unsafe { plinth::arch::set_cpu_id(1) };
        let a = SpaceHst::create().unwrap();
        let b = SpaceHst::create().unwrap();

        let installs = || counter::TLB_ROOT.get(1);
        let before = installs();
        a.make_current();
        assert_eq!(installs(), before + 1);
        // Second install of the current space writes no translation register.
        a.make_current();
        assert_eq!(installs(), before + 1);
        b.make_current();
        assert_eq!(installs(), before + 2);
        a.make_current();
        assert_eq!(installs(), before + 3);
    }

    #[test]
    fn vmids_are_distinct() {
        let _gate = crate::testing::lock();
        let a = SpaceGst::create().unwrap();
        let b = SpaceGst::create().unwrap();
        assert_ne!(a.vmid(), b.vmid());
    }
}
