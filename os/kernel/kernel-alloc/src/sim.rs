//! Hosted stand-in for the MMU.
//!
//! [`SimMmu`] owns a heap arena that plays the role of physical RAM for a
//! contiguous range of frame numbers. Binding the scratch window simply
//! returns a pointer into the arena; TLB invalidations and root switches are
//! counted so tests can observe them.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::boot::PhysicalRegion;
use kernel_memory_addresses::{FrameNumber, PAGE_BYTES, PAGE_SIZE, VirtualAddress};
use kernel_vmem::Mmu;

#[repr(C, align(4096))]
struct RamFrame(UnsafeCell<[u8; PAGE_BYTES]>);

pub struct SimMmu {
    base: FrameNumber,
    ram: Box<[RamFrame]>,
    binds: AtomicU64,
    invalidations: AtomicU64,
    root: AtomicU64,
}

// SAFETY: the arena is only reached through `bind_scratch`, whose callers
// serialize on the scratch window lock.
unsafe impl Sync for SimMmu {}
// SAFETY: see above.
unsafe impl Send for SimMmu {}

impl SimMmu {
    /// Simulated RAM covering `frames` frames starting at `base`.
    #[must_use]
    pub fn new(base: FrameNumber, frames: usize) -> Self {
        let ram: Vec<RamFrame> = (0..frames)
            .map(|_| RamFrame(UnsafeCell::new([0; PAGE_BYTES])))
            .collect();
        Self {
            base,
            ram: ram.into_boxed_slice(),
            binds: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            root: AtomicU64::new(u64::MAX),
        }
    }

    /// The simulated RAM as a boot memory region.
    #[must_use]
    pub fn region(&self) -> PhysicalRegion {
        PhysicalRegion::new(self.base.base().as_u64(), self.ram.len() as u64 * PAGE_SIZE)
    }

    #[must_use]
    pub fn binds(&self) -> u64 {
        self.binds.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// The page-table root most recently loaded, if any.
    #[must_use]
    pub fn active_root(&self) -> Option<FrameNumber> {
        match self.root.load(Ordering::Acquire) {
            u64::MAX => None,
            n => Some(FrameNumber::new(n)),
        }
    }
}

impl Mmu for SimMmu {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn bind_scratch(&self, frame: FrameNumber) -> NonNull<u8> {
        assert!(
            frame >= self.base && frame - self.base < self.ram.len() as u64,
            "{frame:?} is outside simulated RAM"
        );
        self.binds.fetch_add(1, Ordering::Relaxed);
        let slot = &self.ram[(frame - self.base) as usize];
        // SAFETY: `UnsafeCell::get` never returns null.
        unsafe { NonNull::new_unchecked(slot.0.get().cast()) }
    }

    fn invalidate_page(&self, _va: VirtualAddress) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn load_root(&self, root: FrameNumber) {
        self.root.store(root.as_u64(), Ordering::Release);
    }
}
