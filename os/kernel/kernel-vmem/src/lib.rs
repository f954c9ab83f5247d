//! # Virtual Memory Support
//!
//! x86-64 paging primitives for the memory manager.
//!
//! ## What you get
//! - The [`PageTableEntry`] format, including the software bits that carry
//!   per-page permission, load and copy-on-write state.
//! - [`Protection`] flags for mappings.
//! - A [`PageTables`] walker for one PML4-rooted address space.
//! - Hardware seams: [`PhysAccess`] (read/write physical frames),
//!   [`FrameSource`] (frames for page tables) and [`Mmu`] (TLB, `CR3`, and
//!   the scratch window), with an [`X86Mmu`] implementation.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   (Page Table Entry)  → maps 4 KiB page
//!   │        │        └────────────► PDE   (Page Directory Entry)
//!   │        └─────────────────────► PDPTE (Page Directory Pointer Table Entry)
//!   └──────────────────────────────► PML4E (Page Map Level 4 Entry)
//! ```
//!
//! Only 4 KiB leaves are created. Every non-leaf entry is a plain link to the
//! next table; the leaf carries all permissions.
//!
//! ## Physical access
//!
//! Page tables live in physical frames that are not permanently mapped. All
//! reads and writes go through [`PhysAccess`], which the memory manager
//! implements on top of its scratch window; tests implement it over a heap
//! buffer.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod entry;
mod protection;
mod walker;
#[cfg(target_arch = "x86_64")]
mod x86;

use core::ptr::NonNull;
use kernel_memory_addresses::{FrameNumber, PageNumber, VirtualAddress};

pub use crate::entry::PageTableEntry;
pub use crate::protection::Protection;
pub use crate::walker::{LeafSlot, PageTables, WalkError};
#[cfg(target_arch = "x86_64")]
pub use crate::x86::X86Mmu;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Number of entries in every paging table.
pub const ENTRIES: usize = 512;

/// Split a page number into its PML4, PDPT, PD and PT indices.
///
/// ```rust
/// # use kernel_vmem::split_indices;
/// # use kernel_memory_addresses::VirtualAddress;
/// let va = VirtualAddress::new(0x0000_7f12_3456_7000);
/// assert_eq!(split_indices(va.page()), [0xfe, 0x48, 0x1a2, 0x167]);
/// ```
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_indices(page: PageNumber) -> [usize; 4] {
    let p = page.as_u64();
    [
        ((p >> 27) & 0x1FF) as usize,
        ((p >> 18) & 0x1FF) as usize,
        ((p >> 9) & 0x1FF) as usize,
        (p & 0x1FF) as usize,
    ]
}

/// Frames for page tables.
///
/// Returned frames need not be zeroed; the walker clears them through
/// [`PhysAccess::zero_frame`]. Returns `None` on out-of-memory.
pub trait FrameSource {
    fn alloc_table(&mut self) -> Option<FrameNumber>;
    fn free_table(&mut self, frame: FrameNumber);
}

/// Access to physical memory for page-table maintenance.
///
/// Implementations decide how a frame becomes addressable (scratch window,
/// identity map, heap buffer in tests).
pub trait PhysAccess {
    /// Read entry `index` (0..512) of the table in `table`.
    fn read_entry(&mut self, table: FrameNumber, index: usize) -> PageTableEntry;

    /// Write entry `index` (0..512) of the table in `table`.
    fn write_entry(&mut self, table: FrameNumber, index: usize, entry: PageTableEntry);

    /// Fill `frame` with zeros.
    fn zero_frame(&mut self, frame: FrameNumber);
}

/// The memory-management unit as seen by the memory manager.
pub trait Mmu: Send + Sync {
    /// Point the scratch window at `frame` and return its first byte.
    ///
    /// # Safety
    /// The caller must hold the scratch window lock for as long as it uses
    /// the returned pointer; the next bind invalidates it.
    unsafe fn bind_scratch(&self, frame: FrameNumber) -> NonNull<u8>;

    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Make `root` the active PML4.
    ///
    /// # Safety
    /// `root` must hold a valid PML4 whose kernel half maps the running
    /// kernel.
    unsafe fn load_root(&self, root: FrameNumber);
}
