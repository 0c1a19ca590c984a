//! Protection domains.
//!
//! A Pd bundles the spaces its ECs run in: the capability table, the host
//! memory space, and — for domains that host virtual machines — a guest
//! memory space. The bundle is immutable once created; EC factories pull
//! their space references from here.

use crate::kobj::{free_obj, KObj, KObject, Ref, Subtype};
use crate::space_mem::{SpaceGst, SpaceHst};
use crate::space_obj::SpaceObj;
use crate::Status;

/// A protection domain.
#[repr(C, align(32))]
pub struct Pd {
    kobj: KObject,
    obj: Option<Ref<SpaceObj>>,
    hst: Option<Ref<SpaceHst>>,
    gst: Option<Ref<SpaceGst>>,
}

unsafe impl KObj for Pd {
    const SUBTYPES: &'static [Subtype] = &[Subtype::Pd];

    fn kobj(&self) -> &KObject {
        &self.kobj
    }
}

impl Pd {
    /// Create a domain with an object space and a host space, and a guest
    /// space when it will host vCPUs.
    pub fn create(guest: bool) -> Result<Ref<Pd>, Status> {
        let obj = SpaceObj::create()?;
        let hst = SpaceHst::create()?;
        let gst = if guest { Some(SpaceGst::create()?) } else { None };
        Ok(Ref::new(Self {
            kobj: KObject::new(Subtype::Pd, free_obj::<Pd>),
            obj: Some(obj),
            hst: Some(hst),
            gst,
        }))
    }

    pub fn get_obj(&self) -> Option<Ref<SpaceObj>> {
        self.obj.clone()
    }

    pub fn get_hst(&self) -> Option<Ref<SpaceHst>> {
        self.hst.clone()
    }

    pub fn get_gst(&self) -> Option<Ref<SpaceGst>> {
        self.gst.clone()
    }
}
