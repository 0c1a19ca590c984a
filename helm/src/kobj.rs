//! Kernel objects and counted handles.
//!
//! Every first-class kernel object (EC, Pd, Sc, the three spaces) starts
//! with a [`KObject`] header: a deferred-destruction node, a reference
//! count, and a subtype tag for capability downcasts. A [`Ref`] is a
//! counted handle; dropping the last one posts the object to the
//! grace-period coordinator rather than freeing it in place, so a stale
//! pointer read from a shared table stays dereferenceable until every CPU
//! has quiesced (and [`Refcount::acquire`] refuses to revive it).

use crate::rcu::{Rcu, RcuElem};
use crate::refcount::Refcount;
use alloc::boxed::Box;
use core::ops::Deref;
use core::ptr::NonNull;

/// Concrete kind of a kernel object, for capability downcasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subtype {
    Pd,
    EcKernel,
    EcLocal,
    EcGlobal,
    EcVcpuReal,
    EcVcpuOffs,
    Sc,
    SpaceObj,
    SpaceHst,
    SpaceGst,
}

/// Common header of all kernel objects.
///
/// Must be the first field of a `#[repr(C)]` object so the destruction node
/// and the object share an address.
#[repr(C)]
pub struct KObject {
    rcu: RcuElem,
    refcount: Refcount,
    subtype: Subtype,
}

impl KObject {
    pub(crate) fn new(subtype: Subtype, free: unsafe fn(*mut RcuElem)) -> Self {
        Self {
            rcu: RcuElem::new(free),
            refcount: Refcount::new(),
            subtype,
        }
    }

    pub fn subtype(&self) -> Subtype {
        self.subtype
    }

    pub(crate) fn refcount(&self) -> &Refcount {
        &self.refcount
    }

    /// Drop one type-erased reference; posts destruction when it was the
    /// last.
    pub(crate) unsafe fn release_raw(k: *mut KObject) {
        if (*k).refcount.release() {
            Rcu::call(&mut (*k).rcu);
        }
    }
}

/// Objects that carry a [`KObject`] header.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with the header as their first field,
/// and must register [`free_obj::<Self>`] as the header's destruction
/// function.
pub unsafe trait KObj: Sized + Send + Sync + 'static {
    /// Subtypes a capability downcast to `Self` accepts.
    const SUBTYPES: &'static [Subtype];

    fn kobj(&self) -> &KObject;
}

/// Destruction thunk: runs after a grace period, when no CPU can still
/// hold a pre-release pointer.
pub(crate) unsafe fn free_obj<T: KObj>(e: *mut RcuElem) {
    drop(Box::from_raw(e as *mut T));
}

/// A counted handle on a kernel object.
pub struct Ref<T: KObj>(NonNull<T>);

unsafe impl<T: KObj> Send for Ref<T> {}
unsafe impl<T: KObj> Sync for Ref<T> {}

impl<T: KObj> Ref<T> {
    /// Move a freshly constructed object to the heap with its initial
    /// reference.
    pub fn new(val: T) -> Ref<T> {
        Ref(Box::leak(Box::new(val)).into())
    }

    /// Try to take a reference through a raw pointer from a shared table.
    ///
    /// Fails if the object is already on its way to destruction.
    pub fn try_acquire(ptr: NonNull<T>) -> Option<Ref<T>> {
        unsafe { ptr.as_ref() }
            .kobj()
            .refcount()
            .acquire()
            .then_some(Ref(ptr))
    }

    /// Turn the handle into a raw pointer without dropping the reference.
    pub fn into_raw(self) -> NonNull<T> {
        let ptr = self.0;
        core::mem::forget(self);
        ptr
    }

    /// Reconstitute a handle from [`Ref::into_raw`].
    ///
    /// # Safety
    /// `ptr` must carry a reference that was leaked with `into_raw`.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Ref<T> {
        Ref(ptr)
    }

    pub fn as_ptr(&self) -> NonNull<T> {
        self.0
    }
}

impl<T: KObj> Clone for Ref<T> {
    fn clone(&self) -> Self {
        // Cannot fail: we hold a reference, so the count is nonzero.
        let ok = self.kobj().refcount().acquire();
        debug_assert!(ok);
        Ref(self.0)
    }
}

impl<T: KObj> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.0.as_ref() }
    }
}

impl<T: KObj> Drop for Ref<T> {
    fn drop(&mut self) {
        unsafe { KObject::release_raw(self.0.as_ptr() as *mut KObject) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Dummy {
        kobj: KObject,
        payload: usize,
    }

    unsafe impl KObj for Dummy {
        const SUBTYPES: &'static [Subtype] = &[Subtype::Sc];

        fn kobj(&self) -> &KObject {
            &self.kobj
        }
    }

    #[test]
    fn clone_and_reacquire() {
        let _gate = crate::testing::lock();
        let r = Ref::new(Dummy {
            kobj: KObject::new(Subtype::Sc, free_obj::<Dummy>),
            payload: 7,
        });
        let ptr = r.as_ptr();
        let c = r.clone();
        assert_eq!(c.payload, 7);
        drop(r);
        // Still alive through `c`, so a table reader can reacquire.
        let t = Ref::try_acquire(ptr).unwrap();
        drop(t);
        drop(c);
        // Last drop posted destruction; the count is pinned at zero.
        assert!(Ref::try_acquire(ptr).is_none());
    }
}
