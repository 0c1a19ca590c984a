//! Object space.
//!
//! The capability table of a protection domain: a two-level array of atomic
//! slots mapping selectors to kernel objects with permission bits. Slots
//! hold counted references; lookup re-acquires through the refcount, so a
//! reader either gets a live object or nothing — never a corpse.

use crate::kobj::{free_obj, KObj, KObject, Ref, Subtype};
use crate::Status;
use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

bitflags::bitflags! {
    /// Capability permission bits, encoded in the low bits of a slot.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CapPerms: usize {
        /// Invoke control operations on the object.
        const CTRL = 1 << 0;
        /// Send a message / call through the object.
        const CALL = 1 << 1;
        /// Bind the object (event portals, scheduler attachment).
        const BIND = 1 << 2;
        /// Delegate the capability onwards.
        const GRANT = 1 << 3;
    }
}

/// Kernel objects are 32-byte aligned, leaving five low bits for
/// permissions.
const PERM_MASK: usize = 0x1f;

/// A decoded capability: an object pointer and the permissions it conveys.
#[derive(Clone, Copy)]
pub struct Capability(usize);

impl Capability {
    pub const NULL: Capability = Capability(0);

    /// Encode an object reference with permissions. Consumes the counted
    /// reference; it now lives in the slot.
    pub fn new<T: KObj>(obj: Ref<T>, perms: CapPerms) -> Self {
        let ptr = obj.into_raw().as_ptr() as usize;
        debug_assert_eq!(ptr & PERM_MASK, 0);
        Self(ptr | (perms.bits() & PERM_MASK))
    }

    pub fn is_null(self) -> bool {
        self.0 & !PERM_MASK == 0
    }

    pub fn perms(self) -> CapPerms {
        CapPerms::from_bits_truncate(self.0 & PERM_MASK)
    }

    fn header(self) -> Option<NonNull<KObject>> {
        NonNull::new((self.0 & !PERM_MASK) as *mut KObject)
    }

    /// Downcast to a concrete object type, taking a fresh reference.
    ///
    /// Returns nothing when the slot is empty, the subtype does not match,
    /// or the object is already condemned.
    pub fn get<T: KObj>(self) -> Option<Ref<T>> {
        let hdr = self.header()?;
        if !T::SUBTYPES.contains(&unsafe { hdr.as_ref() }.subtype()) {
            return None;
        }
        Ref::try_acquire(hdr.cast::<T>())
    }

    /// Drop the reference a non-null slot value carries.
    unsafe fn release(self) {
        if let Some(hdr) = self.header() {
            KObject::release_raw(hdr.as_ptr());
        }
    }
}

const LEVEL_BITS: usize = 9;
const ENTRIES: usize = 1 << LEVEL_BITS;

struct CapPage([AtomicUsize; ENTRIES]);

impl CapPage {
    fn new() -> Box<Self> {
        const EMPTY: AtomicUsize = AtomicUsize::new(0);
        Box::new(Self([EMPTY; ENTRIES]))
    }
}

/// A capability space.
#[repr(C, align(32))]
pub struct SpaceObj {
    kobj: KObject,
    root: [AtomicUsize; ENTRIES],
}

unsafe impl KObj for SpaceObj {
    const SUBTYPES: &'static [Subtype] = &[Subtype::SpaceObj];

    fn kobj(&self) -> &KObject {
        &self.kobj
    }
}

impl SpaceObj {
    /// Number of selectors a space can hold.
    pub const SELECTORS: usize = ENTRIES * ENTRIES;

    pub fn create() -> Result<Ref<SpaceObj>, Status> {
        const EMPTY: AtomicUsize = AtomicUsize::new(0);
        Ok(Ref::new(Self {
            kobj: KObject::new(Subtype::SpaceObj, free_obj::<SpaceObj>),
            root: [EMPTY; ENTRIES],
        }))
    }

    fn page(&self, sel: usize, alloc: bool) -> Option<&CapPage> {
        let slot = &self.root[sel >> LEVEL_BITS];
        let mut p = slot.load(Ordering::SeqCst);
        if p == 0 {
            if !alloc {
                return None;
            }
            let fresh = Box::into_raw(CapPage::new()) as usize;
            match slot.compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => p = fresh,
                Err(won) => {
                    // Lost the race; free ours and use the winner's.
                    drop(unsafe { Box::from_raw(fresh as *mut CapPage) });
                    p = won;
                }
            }
        }
        Some(unsafe { &*(p as *const CapPage) })
    }

    /// Read the capability at `sel`.
    pub fn lookup(&self, sel: usize) -> Capability {
        if sel >= Self::SELECTORS {
            return Capability::NULL;
        }
        match self.page(sel, false) {
            Some(page) => Capability(page.0[sel & (ENTRIES - 1)].load(Ordering::SeqCst)),
            None => Capability::NULL,
        }
    }

    /// Install a capability at an empty `sel`.
    ///
    /// On failure the reference the capability carried is dropped; the
    /// caller keeps nothing to clean up.
    pub fn insert(&self, sel: usize, cap: Capability) -> Result<(), Status> {
        let res = if sel >= Self::SELECTORS {
            Err(Status::BadPar)
        } else {
            match self.page(sel, true) {
                None => Err(Status::MemCap),
                Some(page) => page.0[sel & (ENTRIES - 1)]
                    .compare_exchange(0, cap.0, Ordering::SeqCst, Ordering::SeqCst)
                    .map(|_| ())
                    .map_err(|_| Status::BadCap),
            }
        };
        if res.is_err() {
            unsafe { cap.release() };
        }
        res
    }

    /// Clear `sel`, releasing whatever reference the slot carried.
    pub fn revoke(&self, sel: usize) -> Result<(), Status> {
        if sel >= Self::SELECTORS {
            return Err(Status::BadPar);
        }
        if let Some(page) = self.page(sel, false) {
            let old = Capability(page.0[sel & (ENTRIES - 1)].swap(0, Ordering::SeqCst));
            unsafe { old.release() };
        }
        Ok(())
    }
}

impl Drop for SpaceObj {
    fn drop(&mut self) {
        for slot in self.root.iter() {
            let p = slot.swap(0, Ordering::SeqCst);
            if p != 0 {
                let page = unsafe { Box::from_raw(p as *mut CapPage) };
                for cap in page.0.iter() {
                    unsafe { Capability(cap.load(Ordering::SeqCst)).release() };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space_mem::SpaceHst;

    #[test]
    fn insert_lookup_revoke() {
        let _gate = crate::testing::lock();
        let space = SpaceObj::create().unwrap();
        let hst = SpaceHst::create().unwrap();
        let ptr = hst.as_ptr();

        space
            .insert(42, Capability::new(hst, CapPerms::CTRL))
            .unwrap();

        let cap = space.lookup(42);
        assert_eq!(cap.perms(), CapPerms::CTRL);
        let got = cap.get::<SpaceHst>().unwrap();
        assert_eq!(got.as_ptr(), ptr);
        // Wrong-type downcast yields nothing.
        assert!(cap.get::<SpaceObj>().is_none());
        drop(got);

        // Occupied slots reject a second insert.
        let other = SpaceHst::create().unwrap();
        assert_eq!(
            space.insert(42, Capability::new(other, CapPerms::CTRL)),
            Err(Status::BadCap)
        );

        space.revoke(42).unwrap();
        assert!(space.lookup(42).is_null());
    }

    #[test]
    fn out_of_range_selector() {
        let _gate = crate::testing::lock();
        let space = SpaceObj::create().unwrap();
        assert!(space.lookup(SpaceObj::SELECTORS).is_null());
        assert_eq!(
            space.revoke(SpaceObj::SELECTORS),
            Err(Status::BadPar)
        );
    }
}
