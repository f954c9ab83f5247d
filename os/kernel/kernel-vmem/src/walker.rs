//! # Four-Level Table Walker
//!
//! [`PageTables`] owns the PML4 frame of one address space and walks it
//! through a [`PhysAccess`] implementation, allocating intermediate tables
//! from a [`FrameSource`] on demand.
//!
//! ## Design
//!
//! - Intermediate entries are [`PageTableEntry::table_link`]s; permissions are
//!   enforced at the leaf only.
//! - PML4 slots from [`KERNEL_PML4_FIRST`] on belong to the shared kernel
//!   half. They are copied from a template when the root is created and are
//!   never modified or freed through this type.
//! - Leaf frames are not owned by the tables; [`PageTables::destroy`] frees
//!   only the table frames of the user half.

use crate::{ENTRIES, FrameSource, PageTableEntry, PhysAccess, split_indices};
use kernel_info::memory::KERNEL_PML4_FIRST;
use kernel_memory_addresses::{FrameNumber, PageNumber, VirtualAddress};

/// Failure to reach or create a leaf entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    #[error("{0} lies in the shared kernel half")]
    KernelHalf(VirtualAddress),
}

/// Location of one leaf entry: the page-table frame and the index in it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LeafSlot {
    pub table: FrameNumber,
    pub index: usize,
}

/// The page-table tree of one address space.
#[derive(Debug)]
pub struct PageTables {
    root: FrameNumber,
}

impl PageTables {
    /// Allocate and zero a new PML4 and copy the kernel half from `template`.
    ///
    /// # Errors
    /// [`WalkError::OutOfMemory`] if no frame is available for the root.
    pub fn create<P, F>(
        phys: &mut P,
        frames: &mut F,
        template: Option<FrameNumber>,
    ) -> Result<Self, WalkError>
    where
        P: PhysAccess + ?Sized,
        F: FrameSource + ?Sized,
    {
        let root = frames.alloc_table().ok_or(WalkError::OutOfMemory)?;
        phys.zero_frame(root);
        if let Some(template) = template {
            for i in KERNEL_PML4_FIRST..ENTRIES {
                let e = phys.read_entry(template, i);
                phys.write_entry(root, i, e);
            }
        }
        Ok(Self { root })
    }

    /// Wrap an existing root.
    #[inline]
    #[must_use]
    pub const fn from_root(root: FrameNumber) -> Self {
        Self { root }
    }

    /// Frame of the PML4 (the value loaded into `CR3`).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> FrameNumber {
        self.root
    }

    fn next_table<P>(phys: &mut P, table: FrameNumber, index: usize) -> Option<FrameNumber>
    where
        P: PhysAccess + ?Sized,
    {
        let e = phys.read_entry(table, index);
        if e.present() { Some(e.frame()) } else { None }
    }

    fn ensure_next<P, F>(
        phys: &mut P,
        frames: &mut F,
        table: FrameNumber,
        index: usize,
    ) -> Result<FrameNumber, WalkError>
    where
        P: PhysAccess + ?Sized,
        F: FrameSource + ?Sized,
    {
        if let Some(next) = Self::next_table(phys, table, index) {
            return Ok(next);
        }

        let frame = frames.alloc_table().ok_or(WalkError::OutOfMemory)?;
        phys.zero_frame(frame);
        phys.write_entry(table, index, PageTableEntry::table_link(frame));
        log::trace!("page table {frame:?} linked at {table:?}[{index}]");
        Ok(frame)
    }

    /// Find the leaf slot for `page` without creating anything.
    pub fn find_leaf<P>(&self, phys: &mut P, page: PageNumber) -> Option<LeafSlot>
    where
        P: PhysAccess + ?Sized,
    {
        let [i4, i3, i2, i1] = split_indices(page);
        let pdpt = Self::next_table(phys, self.root, i4)?;
        let pd = Self::next_table(phys, pdpt, i3)?;
        let pt = Self::next_table(phys, pd, i2)?;
        Some(LeafSlot {
            table: pt,
            index: i1,
        })
    }

    /// Find the leaf slot for `page`, creating missing intermediate tables.
    ///
    /// # Errors
    /// - [`WalkError::KernelHalf`] if `page` is in the shared kernel half.
    /// - [`WalkError::OutOfMemory`] if a table could not be allocated. Tables
    ///   created before the failure stay linked; they are empty and are freed
    ///   with the address space.
    pub fn leaf_slot<P, F>(
        &self,
        phys: &mut P,
        frames: &mut F,
        page: PageNumber,
    ) -> Result<LeafSlot, WalkError>
    where
        P: PhysAccess + ?Sized,
        F: FrameSource + ?Sized,
    {
        let [i4, i3, i2, i1] = split_indices(page);
        if i4 >= KERNEL_PML4_FIRST {
            return Err(WalkError::KernelHalf(page.base()));
        }

        let pdpt = Self::ensure_next(phys, frames, self.root, i4)?;
        let pd = Self::ensure_next(phys, frames, pdpt, i3)?;
        let pt = Self::ensure_next(phys, frames, pd, i2)?;
        Ok(LeafSlot {
            table: pt,
            index: i1,
        })
    }

    /// Create every table needed to hold leaves for `count` pages from `start`.
    ///
    /// After success, [`find_leaf`](Self::find_leaf) succeeds for every page
    /// in the range, so leaf entries can be written without further
    /// allocation.
    ///
    /// # Errors
    /// As [`leaf_slot`](Self::leaf_slot).
    pub fn ensure_range<P, F>(
        &self,
        phys: &mut P,
        frames: &mut F,
        start: PageNumber,
        count: u64,
    ) -> Result<(), WalkError>
    where
        P: PhysAccess + ?Sized,
        F: FrameSource + ?Sized,
    {
        let end = start.as_u64() + count;
        let mut page = start.as_u64();
        while page < end {
            self.leaf_slot(phys, frames, PageNumber::new(page))?;
            // next page-table boundary
            page = (page | (ENTRIES as u64 - 1)) + 1;
        }
        Ok(())
    }

    /// The leaf entry for `page`, or the zero entry if no table exists.
    pub fn lookup<P>(&self, phys: &mut P, page: PageNumber) -> PageTableEntry
    where
        P: PhysAccess + ?Sized,
    {
        self.find_leaf(phys, page)
            .map_or(PageTableEntry::zero(), |slot| {
                phys.read_entry(slot.table, slot.index)
            })
    }

    #[inline]
    pub fn read<P>(phys: &mut P, slot: LeafSlot) -> PageTableEntry
    where
        P: PhysAccess + ?Sized,
    {
        phys.read_entry(slot.table, slot.index)
    }

    #[inline]
    pub fn write<P>(phys: &mut P, slot: LeafSlot, entry: PageTableEntry)
    where
        P: PhysAccess + ?Sized,
    {
        phys.write_entry(slot.table, slot.index, entry);
    }

    /// Visit every used leaf entry for `count` pages from `start`.
    ///
    /// Ranges without page tables are skipped a whole table at a time.
    pub fn for_each_leaf<P, V>(&self, phys: &mut P, start: PageNumber, count: u64, mut f: V)
    where
        P: PhysAccess + ?Sized,
        V: FnMut(&mut P, PageNumber, LeafSlot, PageTableEntry),
    {
        let end = start.as_u64() + count;
        let mut page = start.as_u64();
        while page < end {
            let next_table = ((page | (ENTRIES as u64 - 1)) + 1).min(end);
            if let Some(slot) = self.find_leaf(phys, PageNumber::new(page)) {
                for p in page..next_table {
                    #[allow(clippy::cast_possible_truncation)]
                    let slot = LeafSlot {
                        table: slot.table,
                        index: (p % ENTRIES as u64) as usize,
                    };
                    let e = phys.read_entry(slot.table, slot.index);
                    if !e.is_unused() {
                        f(phys, PageNumber::new(p), slot, e);
                    }
                }
            }
            page = next_table;
        }
    }

    /// Free every user-half table frame and the root.
    ///
    /// Leaf frames are left alone; the caller must have released them.
    pub fn destroy<P, F>(self, phys: &mut P, frames: &mut F)
    where
        P: PhysAccess + ?Sized,
        F: FrameSource + ?Sized,
    {
        for i4 in 0..KERNEL_PML4_FIRST {
            let Some(pdpt) = Self::next_table(phys, self.root, i4) else {
                continue;
            };
            for i3 in 0..ENTRIES {
                let Some(pd) = Self::next_table(phys, pdpt, i3) else {
                    continue;
                };
                for i2 in 0..ENTRIES {
                    if let Some(pt) = Self::next_table(phys, pd, i2) {
                        frames.free_table(pt);
                    }
                }
                frames.free_table(pd);
            }
            frames.free_table(pdpt);
        }
        frames.free_table(self.root);
    }
}
