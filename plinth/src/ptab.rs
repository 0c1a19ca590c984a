//! Software page-table walker.
//!
//! A 4-level table with 9-bit levels and 4 KiB leaves, the common shape of
//! both back-end MMU formats. The walker is deliberately format-neutral: it
//! records `(pa, order, permissions, attributes)` leaves instead of encoded
//! descriptors, and the architectural encoding is left to the low-level
//! MMU code that consumes it. Leaves may sit at any level whose order is a
//! multiple of 9 (4 KiB, 2 MiB, 1 GiB).
//!
//! Note that attributes of all levels are **not** combined here; a leaf
//! carries the complete permission set for its range.

use crate::addressing::{Pa, Va, PAGE_SHIFT};
use alloc::boxed::Box;

bitflags::bitflags! {
    /// Possible memory permissions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Range is readable.
        const R = 1 << 0;
        /// Range is writable.
        const W = 1 << 1;
        /// Range is executable at the lower privilege level.
        const XU = 1 << 2;
        /// Range is executable at the supervisor level.
        const XS = 1 << 3;
        /// Range can be referred by the lower privilege level.
        const U = 1 << 4;
        /// Range is global (kept across address-space switches).
        const G = 1 << 5;
    }
}

/// Memory attributes of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Memattr {
    /// Normal cacheable memory.
    Ram,
    /// Device memory, uncached.
    Dev,
}

/// Errors surfaced by [`Ptab::update`].
#[derive(Debug, PartialEq, Eq)]
pub enum PtabError {
    /// Order is not a multiple of the level width, or too large.
    BadOrder,
    /// Address is not aligned to the mapping size.
    Misaligned,
}

const LEVEL_BITS: usize = 9;
const LEVELS: usize = 4;
const ENTRIES: usize = 1 << LEVEL_BITS;

/// Largest supported leaf order (1 GiB).
pub const MAX_ORDER: usize = (LEVELS - 2) * LEVEL_BITS;

#[derive(Clone, Copy)]
struct LeafEntry {
    pa: Pa,
    perms: Permissions,
    attr: Memattr,
}

enum Entry {
    None,
    Table(Box<Table>),
    Leaf(LeafEntry),
}

struct Table([Entry; ENTRIES]);

impl Table {
    fn new() -> Box<Self> {
        Box::new(Table(core::array::from_fn(|_| Entry::None)))
    }

    fn index(va: Va, level: usize) -> usize {
        va.into_usize() >> (PAGE_SHIFT + level * LEVEL_BITS) & (ENTRIES - 1)
    }
}

/// A page table root.
pub struct Ptab {
    root: Box<Table>,
}

impl Ptab {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { root: Table::new() }
    }

    /// Physical address of the root table.
    pub fn root_addr(&self) -> Pa {
        crate::addressing::ptr_to_phys(&*self.root as *const Table)
    }

    /// Install or remove the mapping for `va` at leaf `order` (log2 of the
    /// mapping size in pages). Empty `perms` removes the mapping.
    ///
    /// A new leaf replaces whatever occupied the slot, including an entire
    /// sub-table of smaller mappings.
    pub fn update(
        &mut self,
        va: Va,
        pa: Pa,
        order: usize,
        perms: Permissions,
        attr: Memattr,
    ) -> Result<(), PtabError> {
        if order % LEVEL_BITS != 0 || order > MAX_ORDER {
            return Err(PtabError::BadOrder);
        }
        let size_mask = (1 << (order + PAGE_SHIFT)) - 1;
        if va.into_usize() & size_mask != 0 || pa.into_usize() & size_mask != 0 {
            return Err(PtabError::Misaligned);
        }

        let leaf_level = order / LEVEL_BITS;
        let mut table = self.root.as_mut();
        for level in (leaf_level + 1..LEVELS).rev() {
            let slot = &mut table.0[Table::index(va, level)];
            if !matches!(slot, Entry::Table(_)) {
                if perms.is_empty() {
                    // Nothing mapped underneath; removal is a no-op.
                    return Ok(());
                }
                *slot = Entry::Table(Table::new());
            }
            table = match slot {
                Entry::Table(t) => t.as_mut(),
                _ => unreachable!(),
            };
        }

        table.0[Table::index(va, leaf_level)] = if perms.is_empty() {
            Entry::None
        } else {
            Entry::Leaf(LeafEntry { pa, perms, attr })
        };
        Ok(())
    }

    /// Query the mapping covering `va`.
    ///
    /// Returns the leaf base address, its order, and its attributes.
    pub fn lookup(&self, va: Va) -> Option<(Pa, usize, Permissions, Memattr)> {
        let mut table = self.root.as_ref();
        for level in (0..LEVELS).rev() {
            match &table.0[Table::index(va, level)] {
                Entry::None => return None,
                Entry::Table(t) => table = t.as_ref(),
                Entry::Leaf(l) => {
                    return Some((l.pa, level * LEVEL_BITS, l.perms, l.attr));
                }
            }
        }
        None
    }

    /// Translate `va` to the physical address it maps to.
    pub fn translate(&self, va: Va) -> Option<Pa> {
        self.lookup(va).map(|(pa, order, ..)| {
            let within = va.into_usize() & ((1 << (order + PAGE_SHIFT)) - 1);
            pa + within
        })
    }
}

impl Default for Ptab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: usize) -> Va {
        Va::new(v).unwrap()
    }

    fn pa(v: usize) -> Pa {
        Pa::new(v).unwrap()
    }

    #[test]
    fn map_then_walk() {
        let mut pt = Ptab::new();
        pt.update(va(0x4000_0000), pa(0x1234_5000), 0, Permissions::R | Permissions::W, Memattr::Ram)
            .unwrap();

        let (p, order, perms, attr) = pt.lookup(va(0x4000_0000)).unwrap();
        assert_eq!(p, pa(0x1234_5000));
        assert_eq!(order, 0);
        assert_eq!(perms, Permissions::R | Permissions::W);
        assert_eq!(attr, Memattr::Ram);
        assert!(pt.lookup(va(0x4000_1000)).is_none());
    }

    #[test]
    fn large_leaf_covers_range() {
        let mut pt = Ptab::new();
        pt.update(va(0x8000_0000), pa(0x4000_0000), 9, Permissions::R, Memattr::Dev)
            .unwrap();

        let (p, order, ..) = pt.lookup(va(0x8000_0000 + 0x5_1000)).unwrap();
        assert_eq!(p, pa(0x4000_0000));
        assert_eq!(order, 9);
        assert_eq!(
            pt.translate(va(0x8000_0000 + 0x5_1234)),
            Some(pa(0x4005_1234))
        );
    }

    #[test]
    fn remove_unmaps() {
        let mut pt = Ptab::new();
        pt.update(va(0x1000), pa(0x2000), 0, Permissions::R, Memattr::Ram)
            .unwrap();
        pt.update(va(0x1000), Pa::ZERO, 0, Permissions::empty(), Memattr::Ram)
            .unwrap();
        assert!(pt.lookup(va(0x1000)).is_none());
    }

    #[test]
    fn rejects_bad_shapes() {
        let mut pt = Ptab::new();
        assert_eq!(
            pt.update(va(0), pa(0), 5, Permissions::R, Memattr::Ram),
            Err(PtabError::BadOrder)
        );
        assert_eq!(
            pt.update(va(0x1000), pa(0), 9, Permissions::R, Memattr::Ram),
            Err(PtabError::Misaligned)
        );
    }
}
