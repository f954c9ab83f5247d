use super::{BackingFile, MapFlags, ThreadId};
use crate::frame_list::FrameListRef;
use alloc::sync::Arc;
use core::ops::Range;
use kernel_memory_addresses::{PAGE_SIZE, PageNumber, VirtualAddress};
use kernel_vmem::{Mmu, Protection};

/// File range behind a segment; `offset` belongs to slot 0 of the frame
/// list.
#[derive(Clone)]
pub(crate) struct FileWindow {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
}

/// A contiguous run of pages in one address space, backed by a slice of a
/// frame list starting at `first_slot`.
pub(crate) struct Segment<'m, M: Mmu> {
    pub start: PageNumber,
    pub pages: u64,
    pub frames: FrameListRef<'m, M>,
    pub first_slot: usize,
    pub protection: Protection,
    pub flags: MapFlags,
    pub file: Option<FileWindow>,
    pub thread: Option<ThreadId>,
}

impl<'m, M: Mmu> Segment<'m, M> {
    pub fn end(&self) -> PageNumber {
        self.start + self.pages
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.start <= page && page < self.end()
    }

    pub fn overlaps(&self, start: PageNumber, end: PageNumber) -> bool {
        self.start < end && start < self.end()
    }

    pub const fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    /// Frame-list slot holding `page`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot_of(&self, page: PageNumber) -> usize {
        self.first_slot + (page - self.start) as usize
    }

    /// Frame-list slots this segment covers.
    pub fn slots(&self) -> Range<usize> {
        self.first_slot..self.slot_of(self.end())
    }

    /// Byte offset in the backing file of frame-list slot `slot`.
    pub fn file_offset_of(&self, slot: usize) -> Option<(&Arc<dyn BackingFile>, u64)> {
        self.file
            .as_ref()
            .map(|w| (&w.file, w.offset + slot as u64 * PAGE_SIZE))
    }

    /// Whether writes through this segment may be made visible in its file.
    pub fn may_write_file(&self) -> bool {
        !self.is_shared() || self.file.as_ref().is_none_or(|w| w.file.writable())
    }

    /// A segment over `[start, start + pages)` of this one, sharing its
    /// frame list.
    pub fn piece(&self, start: PageNumber, pages: u64) -> Self {
        debug_assert!(start >= self.start && start + pages <= self.end());
        Self {
            start,
            pages,
            frames: self.frames.clone(),
            first_slot: self.slot_of(start),
            protection: self.protection,
            flags: self.flags,
            file: self.file.clone(),
            thread: self.thread,
        }
    }

    pub fn info(&self) -> SegmentInfo {
        let slots = self.frames.snapshot(self.slots());
        SegmentInfo {
            start: self.start.base(),
            len: self.pages * PAGE_SIZE,
            protection: self.protection,
            flags: self.flags,
            file_backed: self.file.is_some(),
            resident: slots.iter().flatten().count(),
        }
    }
}

/// Public view of one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub start: VirtualAddress,
    pub len: u64,
    pub protection: Protection,
    pub flags: MapFlags,
    pub file_backed: bool,
    /// Pages with a frame in the backing list.
    pub resident: usize,
}

impl SegmentInfo {
    #[must_use]
    pub fn end(&self) -> VirtualAddress {
        self.start + self.len
    }
}
