//! # Memory Manager
//!
//! Owns the machine-wide memory state: the buddy allocator, the page-info
//! table and the scratch window, plus the [`Mmu`] they drive. One instance
//! exists per kernel; every address space borrows it.
//!
//! Frames handed out through [`new_frame`](MemoryManager::new_frame) and
//! friends are reference counted in the page-info table and go back to the
//! allocator when [`decref`](MemoryManager::decref) drops the last
//! reference. Page-table frames come straight from the allocator and are not
//! counted.

use crate::buddy::BuddyAllocator;
use crate::config::MemoryConfig;
use crate::page_info::{PageFlags, PageInfoTable};
use crate::scratch::{ScratchGuard, ScratchWindow};
use kernel_info::boot::PhysicalRegion;
use kernel_memory_addresses::{FrameNumber, PAGE_BYTES, PAGE_SIZE, PhysicalAddress};
use kernel_sync::TicketMutex;
use kernel_vmem::{FrameSource, Mmu, PageTableEntry};

/// Allocator occupancy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_frames: u64,
    pub free_frames: u64,
}

pub struct MemoryManager<M: Mmu> {
    mmu: M,
    config: MemoryConfig,
    buddy: TicketMutex<BuddyAllocator>,
    page_info: PageInfoTable,
    scratch: ScratchWindow,
}

impl<M: Mmu> MemoryManager<M> {
    pub fn new(mmu: M, regions: &[PhysicalRegion], config: MemoryConfig) -> Self {
        if !config.is_valid() {
            log::warn!("memory config has an inconsistent user window: {config:?}");
        }
        let buddy = BuddyAllocator::new(regions);
        log::info!(
            "memory manager online: {} MiB usable",
            (buddy.total_frames() * PAGE_SIZE) >> 20
        );
        Self {
            mmu,
            config,
            buddy: TicketMutex::new(buddy),
            page_info: PageInfoTable::new(),
            scratch: ScratchWindow::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub const fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn allocate(&self, order: usize) -> Option<FrameNumber> {
        self.buddy.lock_irq().allocate(order)
    }

    pub fn free(&self, block: FrameNumber, order: usize) {
        self.buddy.lock_irq().free(block, order);
    }

    pub fn allocate_frames(&self, count: u64) -> Option<FrameNumber> {
        self.buddy.lock_irq().allocate_frames(count)
    }

    pub fn free_frames(&self, base: FrameNumber, count: u64) {
        self.buddy.lock_irq().free_frames(base, count);
    }

    pub fn stats(&self) -> MemoryStats {
        let b = self.buddy.lock_irq();
        MemoryStats {
            total_frames: b.total_frames(),
            free_frames: b.free_frames_count(),
        }
    }

    /// Copy of the allocator state, for before/after comparisons.
    pub fn buddy_snapshot(&self) -> BuddyAllocator {
        self.buddy.lock_irq().clone()
    }

    /// Take the scratch window.
    pub fn scratch(&self) -> ScratchGuard<'_, M> {
        self.scratch.acquire(&self.mmu)
    }

    /// Allocate a counted frame without initializing its content.
    fn counted_frame(&self, flags: PageFlags) -> Option<FrameNumber> {
        let frame = self.allocate(0)?;
        self.page_info.init(frame, flags);
        Some(frame)
    }

    /// Allocate a zeroed frame with refcount 1.
    pub fn new_frame(&self, flags: PageFlags) -> Option<FrameNumber> {
        let frame = self.counted_frame(flags)?;
        self.scratch().zero(frame);
        Some(frame)
    }

    /// Allocate a frame holding `bytes` (at most one page), zero filled.
    pub fn new_frame_from(&self, bytes: &[u8]) -> Option<FrameNumber> {
        let frame = self.counted_frame(PageFlags::empty())?;
        let mut s = self.scratch();
        s.zero(frame);
        s.write(frame.base(), &bytes[..bytes.len().min(PAGE_BYTES)]);
        Some(frame)
    }

    /// Allocate a frame holding a copy of `src`.
    pub fn new_frame_copy(&self, src: FrameNumber) -> Option<FrameNumber> {
        let frame = self.counted_frame(PageFlags::empty())?;
        self.scratch().copy_frame(frame, src);
        Some(frame)
    }

    pub fn incref(&self, frame: FrameNumber) {
        self.page_info.incref(frame);
    }

    /// Drop a reference; at zero the frame returns to the allocator unless
    /// the file cache still holds it.
    pub fn decref(&self, frame: FrameNumber) {
        if self.page_info.decref(frame) {
            log::trace!("releasing {frame:?}");
            self.page_info.clear(frame);
            self.free(frame, 0);
        }
    }

    /// Take a frame out of the file cache; it returns to the allocator if
    /// no references are left. Returns whether it was released.
    pub fn uncache(&self, frame: FrameNumber) -> bool {
        if self.page_info.uncache(frame) {
            log::trace!("releasing uncached {frame:?}");
            self.page_info.clear(frame);
            self.free(frame, 0);
            true
        } else {
            false
        }
    }

    pub fn mark_dirty(&self, frame: FrameNumber) {
        self.page_info.mark_dirty(frame);
    }

    pub fn mark_accessed(&self, frame: FrameNumber) {
        self.page_info.mark_accessed(frame);
    }

    #[must_use]
    pub fn check_flush(&self, frame: FrameNumber) -> bool {
        self.page_info.check_flush(frame)
    }

    /// Pin a frame that is not allocator managed (firmware, MMIO).
    pub fn static_frame(&self, frame: FrameNumber) {
        self.page_info.static_frame(frame);
    }

    #[must_use]
    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.page_info.refcount(frame)
    }

    #[must_use]
    pub fn page_flags(&self, frame: FrameNumber) -> PageFlags {
        self.page_info.flags(frame)
    }

    #[must_use]
    pub fn needs_copy_on_write(&self, frame: FrameNumber) -> bool {
        self.page_info.needs_copy_on_write(frame)
    }

    /// Move the hardware accessed/dirty bits of a retiring entry into the
    /// page-info table.
    pub(crate) fn absorb_access_bits(&self, entry: PageTableEntry) {
        if let Some(frame) = entry.loaded_frame() {
            if entry.dirty() {
                self.page_info.mark_dirty(frame);
            }
            if entry.accessed() {
                self.page_info.mark_accessed(frame);
            }
        }
    }

    /// Read physical memory into `dst`, crossing frame boundaries as needed.
    pub fn pmem_read(&self, dst: &mut [u8], phys: PhysicalAddress) {
        self.scratch().read(dst, phys);
    }

    pub fn pmem_write(&self, phys: PhysicalAddress, src: &[u8]) {
        self.scratch().write(phys, src);
    }

    pub(crate) const fn table_frames(&self) -> TableFrames<'_, M> {
        TableFrames { mm: self }
    }
}

/// Page-table frames drawn from the allocator, uncounted.
pub(crate) struct TableFrames<'a, M: Mmu> {
    mm: &'a MemoryManager<M>,
}

impl<M: Mmu> FrameSource for TableFrames<'_, M> {
    fn alloc_table(&mut self) -> Option<FrameNumber> {
        self.mm.allocate(0)
    }

    fn free_table(&mut self, frame: FrameNumber) {
        self.mm.free(frame, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMmu;

    fn manager(frames: usize) -> MemoryManager<SimMmu> {
        let mmu = SimMmu::new(FrameNumber::new(0x100), frames);
        let region = mmu.region();
        MemoryManager::new(mmu, &[region], MemoryConfig::default())
    }

    #[test]
    fn frames_return_to_the_allocator_at_zero() {
        let mm = manager(16);
        let before = mm.buddy_snapshot();
        let f = mm.new_frame(PageFlags::empty()).unwrap();
        mm.incref(f);
        assert_eq!(mm.stats().free_frames, 15);
        mm.decref(f);
        assert_eq!(mm.stats().free_frames, 15);
        mm.decref(f);
        assert_eq!(mm.stats().free_frames, 16);
        assert_eq!(mm.refcount(f), 0);
        assert_eq!(mm.buddy_snapshot(), before);
    }

    #[test]
    fn new_frames_are_zeroed() {
        let mm = manager(4);
        let dirty = mm.allocate(0).unwrap();
        mm.pmem_write(dirty.base(), &[0xAA; 64]);
        mm.free(dirty, 0);

        let f = mm.new_frame(PageFlags::empty()).unwrap();
        assert_eq!(f, dirty);
        let mut buf = [0xFF_u8; 64];
        mm.pmem_read(&mut buf, f.base());
        assert_eq!(buf, [0; 64]);
    }

    #[test]
    fn copies_are_independent() {
        let mm = manager(4);
        let a = mm.new_frame_from(b"hello").unwrap();
        let b = mm.new_frame_copy(a).unwrap();
        mm.pmem_write(a.base(), b"HELLO");

        let mut buf = [0_u8; 6];
        mm.pmem_read(&mut buf, b.base());
        assert_eq!(&buf, b"hello\0");
    }

    #[test]
    fn cached_frames_wait_for_uncache() {
        let mm = manager(4);
        let f = mm.new_frame(PageFlags::CACHE).unwrap();
        mm.incref(f);
        mm.decref(f);
        mm.decref(f);
        assert_eq!(mm.stats().free_frames, 3);
        assert!(mm.uncache(f));
        assert_eq!(mm.stats().free_frames, 4);
        assert!(!mm.uncache(f));
    }

    #[test]
    fn dirty_bits_flow_from_entries() {
        let mm = manager(4);
        let f = mm.new_frame(PageFlags::empty()).unwrap();
        let entry = PageTableEntry::zero()
            .with_frame(f)
            .with_loaded(true)
            .with_dirty(true);
        mm.absorb_access_bits(entry);
        assert!(mm.check_flush(f));
        assert!(!mm.page_flags(f).contains(PageFlags::ACCESSED));
    }
}
