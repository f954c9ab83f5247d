//! # Process Memory
//!
//! One user address space: a page-table tree plus the ordered, non
//! overlapping segments mapped into it. Every structural change happens
//! under the segment lock; page-table memory is reached through the scratch
//! window.
//!
//! The segment lock is never held while a backing file is read: a demand
//! load records what it needs, reads with the lock released, and installs
//! the page only if the mapping is still the one it read for.
//!
//! Page-table entries never own frames. A loaded leaf always names the frame
//! held by the matching frame-list slot, and the frame list owns the
//! reference. The entry layout is described in `kernel_vmem::entry`.

use super::fault::{AccessType, FaultOutcome, Privilege};
use super::segment::{Segment, SegmentInfo};
use super::{BackingFile, MapFlags, ThreadId};
use crate::error::VmError;
use crate::frame_list::FrameListRef;
use crate::manager::MemoryManager;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::{
    FrameNumber, PAGE_BYTES, PAGE_SIZE, PageNumber, PhysicalAddress, VirtualAddress, pages_for,
};
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, PageTableEntry, PageTables, Protection};

type Segments<'m, M> = BTreeMap<PageNumber, Segment<'m, M>>;

pub struct ProcessMemory<'m, M: Mmu> {
    mm: &'m MemoryManager<M>,
    tables: PageTables,
    segments: SpinLock<Segments<'m, M>>,
}

fn segment_at<'a, 'm, M: Mmu>(
    segments: &'a Segments<'m, M>,
    page: PageNumber,
) -> Option<&'a Segment<'m, M>> {
    segments
        .range(..=page)
        .next_back()
        .map(|(_, s)| s)
        .filter(|s| s.contains(page))
}

fn collides<M: Mmu>(segments: &Segments<'_, M>, start: PageNumber, end: PageNumber) -> bool {
    segments
        .range(..end)
        .next_back()
        .is_some_and(|(_, s)| s.overlaps(start, end))
}

/// Highest free run of `pages` pages in `[floor, top)`.
fn find_gap<M: Mmu>(
    segments: &Segments<'_, M>,
    pages: u64,
    floor: PageNumber,
    top: PageNumber,
) -> Option<PageNumber> {
    let mut top = top;
    for seg in segments.values().rev() {
        if seg.start >= top {
            continue;
        }
        let below = seg.end().max(floor);
        if top >= below && top - below >= pages {
            return Some(PageNumber::new(top.as_u64() - pages));
        }
        top = seg.start;
        if top <= floor {
            return None;
        }
    }
    (top >= floor && top - floor >= pages).then(|| PageNumber::new(top.as_u64() - pages))
}

const fn permits(protection: Protection, access: AccessType) -> bool {
    match access {
        AccessType::Read => protection.contains(Protection::READ),
        AccessType::Write => protection.contains(Protection::WRITE),
        AccessType::Execute => protection.contains(Protection::EXEC),
    }
}

/// Build the leaf entry for `page` of `seg`.
///
/// Per-page protection overrides in `prev` survive; everything else is
/// derived from the segment and the frame's sharing state.
fn make_leaf<M: Mmu>(
    mm: &MemoryManager<M>,
    seg: &Segment<'_, M>,
    prev: PageTableEntry,
    frame: Option<FrameNumber>,
) -> PageTableEntry {
    let base = if prev.protection_override() {
        PageTableEntry::zero()
            .with_software_protection(prev.software_protection())
            .with_protection_override(true)
    } else {
        PageTableEntry::zero().with_software_protection(seg.protection)
    };
    let entry = base.with_shared(seg.is_shared());
    match frame {
        Some(f) => entry
            .with_frame(f)
            .with_loaded(true)
            .with_copy_on_write(!seg.is_shared() && mm.needs_copy_on_write(f)),
        None => entry,
    }
    .refresh_hardware()
}

/// Return the frames in `slots` of `frames` to the allocator once nothing
/// can reach them: the list is private and every other holder is a segment
/// of this address space covering none of those slots.
fn release_unreachable<'m, M: Mmu>(
    segments: &Segments<'m, M>,
    frames: &FrameListRef<'m, M>,
    slots: Range<usize>,
) {
    if frames.is_shared() || slots.is_empty() {
        return;
    }
    let mut holders = 1;
    for seg in segments.values().filter(|s| FrameListRef::ptr_eq(&s.frames, frames)) {
        let covered = seg.slots();
        if covered.start < slots.end && slots.start < covered.end {
            return;
        }
        holders += 1;
    }
    if frames.holders() == holders {
        let n = frames.release_slots(slots.clone());
        log::trace!("released {n} frame(s) of slots {slots:?}");
    }
}

/// A demand load waiting for its file read.
struct PendingLoad<'m, M: Mmu> {
    frames: FrameListRef<'m, M>,
    index: usize,
    file: Arc<dyn BackingFile>,
    offset: u64,
}

/// A page read for slot `index` of `frames`, not yet installed. Dropping it
/// gives the frame back.
struct LoadedPage<'m, M: Mmu> {
    mm: &'m MemoryManager<M>,
    frames: FrameListRef<'m, M>,
    index: usize,
    frame: Option<FrameNumber>,
}

impl<M: Mmu> LoadedPage<'_, M> {
    fn is_for(&self, frames: &FrameListRef<'_, M>, index: usize) -> bool {
        FrameListRef::ptr_eq(&self.frames, frames) && self.index == index
    }

    /// Move the frame into its slot; a frame loaded there in the meantime
    /// wins.
    fn install(mut self) -> Option<FrameNumber> {
        let frame = self.frame.take()?;
        let installed = self.frames.install(self.index, frame);
        if installed != Ok(frame) {
            self.mm.decref(frame);
        }
        match installed {
            Ok(f) => Some(f),
            Err(existing) => (existing != frame).then_some(existing),
        }
    }
}

impl<M: Mmu> Drop for LoadedPage<'_, M> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.mm.decref(frame);
        }
    }
}

enum Load<'m, M: Mmu> {
    Installed,
    /// The slot is empty; read the file and try again.
    Read(PendingLoad<'m, M>),
}

impl<'m, M: Mmu> ProcessMemory<'m, M> {
    /// An empty address space sharing the kernel half of the configured
    /// template.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table cannot be allocated.
    pub fn new(mm: &'m MemoryManager<M>) -> Result<Arc<Self>, VmError> {
        let tables = PageTables::create(
            &mut mm.scratch(),
            &mut mm.table_frames(),
            mm.config().kernel_template,
        )?;
        log::debug!("address space created, root {:?}", tables.root());
        Ok(Arc::new(Self {
            mm,
            tables,
            segments: SpinLock::new(BTreeMap::new()),
        }))
    }

    #[must_use]
    pub const fn manager(&self) -> &'m MemoryManager<M> {
        self.mm
    }

    #[must_use]
    pub const fn root(&self) -> FrameNumber {
        self.tables.root()
    }

    /// Switch the MMU to this address space.
    ///
    /// # Safety
    /// The kernel half of the tables must map the running code and stack.
    pub unsafe fn activate(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.mm.mmu().load_root(self.tables.root()) };
    }

    /// Map every page of `frames` at `start`.
    ///
    /// # Errors
    /// - [`VmError::InvalidArgument`] if `start` is unaligned, the list is
    ///   empty, or the range leaves the user window.
    /// - [`VmError::Collision`] if the range overlaps a mapping.
    /// - [`VmError::OutOfMemory`] if page tables cannot be allocated; no
    ///   leaf entry is written in that case.
    pub fn add_segment(
        &self,
        start: VirtualAddress,
        frames: FrameListRef<'m, M>,
        protection: Protection,
    ) -> Result<(), VmError> {
        if !start.is_page_aligned() || frames.is_empty() {
            return Err(VmError::InvalidArgument);
        }
        let flags = if frames.is_shared() {
            MapFlags::SHARED
        } else {
            MapFlags::PRIVATE
        };
        let seg = Segment {
            start: start.page(),
            pages: frames.len() as u64,
            frames,
            first_slot: 0,
            protection: protection.normalized(),
            flags,
            file: None,
            thread: None,
        };
        self.insert(&mut self.segments.lock(), seg)
    }

    /// Place `seg` at `at`, or in the highest free gap above the placement
    /// floor, and map it.
    pub(crate) fn add_mapping(
        &self,
        at: Option<PageNumber>,
        mut seg: Segment<'m, M>,
    ) -> Result<VirtualAddress, VmError> {
        let mut segments = self.segments.lock();
        seg.start = match at {
            Some(page) => page,
            None => {
                let cfg = self.mm.config();
                find_gap(
                    &segments,
                    seg.pages,
                    cfg.placement_floor.page(),
                    cfg.user_end.page(),
                )
                .ok_or(VmError::OutOfMemory)?
            }
        };
        let va = seg.start.base();
        self.insert(&mut segments, seg)?;
        Ok(va)
    }

    fn insert(&self, segments: &mut Segments<'m, M>, seg: Segment<'m, M>) -> Result<(), VmError> {
        let end = seg.end();
        if !self.mm.config().contains(seg.start.base(), end.base()) {
            return Err(VmError::InvalidArgument);
        }
        if collides(segments, seg.start, end) {
            log::debug!("mapping at {} collides", seg.start.base());
            return Err(VmError::Collision);
        }

        #[allow(clippy::cast_possible_truncation)]
        let slots = seg
            .frames
            .snapshot(seg.first_slot..seg.first_slot + seg.pages as usize);
        {
            let mut s = self.mm.scratch();
            self.tables
                .ensure_range(&mut s, &mut self.mm.table_frames(), seg.start, seg.pages)?;
            for (page, frame) in (seg.start.as_u64()..).map(PageNumber::new).zip(slots) {
                let Some(frame) = frame else {
                    continue;
                };
                if let Some(slot) = self.tables.find_leaf(&mut s, page) {
                    let entry = make_leaf(self.mm, &seg, PageTableEntry::zero(), Some(frame));
                    PageTables::write(&mut s, slot, entry);
                }
            }
        }

        log::debug!(
            "segment {}..{} {:?} {:?}",
            seg.start.base(),
            end.base(),
            seg.protection,
            seg.flags
        );
        segments.insert(seg.start, seg);
        Ok(())
    }

    /// Zero the leaves of `[start, start + pages)`, moving their
    /// accessed/dirty bits into the page-info table.
    fn clear_range(&self, start: PageNumber, pages: u64) {
        let mm = self.mm;
        let mut s = mm.scratch();
        self.tables
            .for_each_leaf(&mut s, start, pages, |s, page, slot, entry| {
                mm.absorb_access_bits(entry);
                PageTables::write(s, slot, PageTableEntry::zero());
                mm.mmu().invalidate_page(page.base());
            });
    }

    /// Remove the segment starting exactly at `start`.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] if no segment starts there.
    pub fn remove_segment(&self, start: VirtualAddress) -> Result<(), VmError> {
        if !start.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        let mut segments = self.segments.lock();
        let seg = segments.remove(&start.page()).ok_or(VmError::NotMapped)?;
        self.clear_range(seg.start, seg.pages);
        release_unreachable(&segments, &seg.frames, seg.slots());
        log::debug!("unmapped segment at {start}");
        drop(seg);
        Ok(())
    }

    /// Unmap `[addr, addr + len)`, trimming or splitting segments that
    /// straddle the range. Pieces left behind share their frame list; the
    /// frames of the cut-out part of a private list go back right away.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an unaligned address, zero length or
    /// a range outside the user window.
    pub fn unmap_range(&self, addr: VirtualAddress, len: u64) -> Result<(), VmError> {
        if !addr.is_page_aligned() || len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let end_addr = pages_for(len)
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| addr.checked_add(bytes))
            .ok_or(VmError::InvalidArgument)?;
        if !self.mm.config().contains(addr, end_addr) {
            return Err(VmError::InvalidArgument);
        }
        let start = addr.page();
        let end = end_addr.page();

        let mut segments = self.segments.lock();
        let hits: Vec<PageNumber> = segments
            .range(..end)
            .filter(|(_, s)| s.end() > start)
            .map(|(k, _)| *k)
            .collect();
        for key in hits {
            let Some(seg) = segments.remove(&key) else {
                continue;
            };
            let cut_start = seg.start.max(start);
            let cut_end = seg.end().min(end);
            self.clear_range(cut_start, cut_end - cut_start);
            if seg.start < cut_start {
                segments.insert(seg.start, seg.piece(seg.start, cut_start - seg.start));
            }
            if cut_end < seg.end() {
                segments.insert(cut_end, seg.piece(cut_end, seg.end() - cut_end));
            }
            release_unreachable(
                &segments,
                &seg.frames,
                seg.slot_of(cut_start)..seg.slot_of(cut_end),
            );
        }
        log::debug!("unmapped {addr}..{}", end.base());
        Ok(())
    }

    /// Remove the thread-local mappings created by `thread`.
    pub fn unmap_thread(&self, thread: ThreadId) {
        let mut segments = self.segments.lock();
        let doomed: Vec<PageNumber> = segments
            .values()
            .filter(|s| s.flags.contains(MapFlags::THREAD) && s.thread == Some(thread))
            .map(|s| s.start)
            .collect();
        for key in doomed {
            if let Some(seg) = segments.remove(&key) {
                self.clear_range(seg.start, seg.pages);
                release_unreachable(&segments, &seg.frames, seg.slots());
            }
        }
    }

    /// Set the protection of every page in `[start, start + pages)`.
    ///
    /// The new bits are stored per page and take precedence over the
    /// segment's protection from then on.
    pub(crate) fn protect(
        &self,
        start: PageNumber,
        pages: u64,
        protection: Protection,
    ) -> Result<(), VmError> {
        let end = start + pages;
        let segments = self.segments.lock();

        let mut cursor = start;
        for seg in segments.values().filter(|s| s.overlaps(start, end)) {
            if seg.start > cursor {
                return Err(VmError::NotMapped);
            }
            if protection.contains(Protection::WRITE) && !seg.may_write_file() {
                return Err(VmError::PermissionDenied);
            }
            cursor = seg.end();
        }
        if cursor < end {
            return Err(VmError::NotMapped);
        }

        let mut s = self.mm.scratch();
        for page in (start.as_u64()..end.as_u64()).map(PageNumber::new) {
            let slot = self
                .tables
                .leaf_slot(&mut s, &mut self.mm.table_frames(), page)?;
            let old = PageTables::read(&mut s, slot);
            let new = old
                .with_software_protection(protection)
                .with_protection_override(true)
                .refresh_hardware();
            PageTables::write(&mut s, slot, new);
            if old.present() {
                self.mm.mmu().invalidate_page(page.base());
            }
        }
        log::debug!("protection of {}..{} set to {protection:?}", start.base(), end.base());
        Ok(())
    }

    /// Copy this address space for a fork.
    ///
    /// Private segments get duplicated frame lists: every loaded page
    /// becomes copy-on-write in both spaces. Shared segments keep sharing
    /// their list. Thread-local mappings turn into normal ones in the child.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the child's page tables cannot be built.
    /// The parent stays usable; pages already marked copy-on-write are
    /// copied or re-enabled lazily.
    pub fn duplicate(&self) -> Result<Arc<Self>, VmError> {
        let child = Self::new(self.mm)?;
        let segments = self.segments.lock();
        let mut child_segments = child.segments.lock();
        let mut copies: Vec<(FrameListRef<'m, M>, FrameListRef<'m, M>)> = Vec::new();

        for seg in segments.values() {
            let frames = if seg.frames.is_shared() {
                seg.frames.clone()
            } else if let Some((_, copy)) = copies
                .iter()
                .find(|(orig, _)| FrameListRef::ptr_eq(orig, &seg.frames))
            {
                copy.clone()
            } else {
                let copy = seg.frames.duplicate();
                copies.push((seg.frames.clone(), copy.clone()));
                copy
            };

            let mut flags = seg.flags;
            flags.remove(MapFlags::THREAD);
            let mut piece = seg.piece(seg.start, seg.pages);
            piece.frames = frames;
            piece.flags = flags;
            piece.thread = None;

            let mut parent_entries = Vec::new();
            {
                let mm = self.mm;
                let mut s = mm.scratch();
                self.tables
                    .for_each_leaf(&mut s, seg.start, seg.pages, |s, page, slot, entry| {
                        parent_entries.push((page, entry));
                        if entry.loaded() && !seg.is_shared() {
                            PageTables::write(
                                s,
                                slot,
                                entry.with_copy_on_write(true).refresh_hardware(),
                            );
                            mm.mmu().invalidate_page(page.base());
                        }
                    });
            }

            child.mirror(&piece, &parent_entries)?;
            child_segments.insert(piece.start, piece);
        }

        log::debug!(
            "address space {:?} duplicated into {:?} ({} segment(s))",
            self.root(),
            child.root(),
            child_segments.len()
        );
        drop(child_segments);
        Ok(child)
    }

    /// Write the leaves of a freshly inserted fork piece from the parent's
    /// entries.
    fn mirror(
        &self,
        seg: &Segment<'m, M>,
        parent: &[(PageNumber, PageTableEntry)],
    ) -> Result<(), VmError> {
        let mut s = self.mm.scratch();
        self.tables
            .ensure_range(&mut s, &mut self.mm.table_frames(), seg.start, seg.pages)?;
        for &(page, entry) in parent {
            let Some(slot) = self.tables.find_leaf(&mut s, page) else {
                continue;
            };
            PageTables::write(&mut s, slot, make_leaf(self.mm, seg, entry, entry.loaded_frame()));
        }
        Ok(())
    }

    /// Resolve a page fault at `addr`.
    pub fn on_page_fault(
        &self,
        addr: VirtualAddress,
        access: AccessType,
        privilege: Privilege,
    ) -> FaultOutcome {
        let cfg = self.mm.config();
        if addr < cfg.user_start || addr >= cfg.user_end {
            log::debug!("{access:?} fault at {addr}: outside user space");
            return FaultOutcome::Unmapped;
        }
        let page = addr.page();
        let mut loaded = None;
        loop {
            let segments = self.segments.lock();
            let Some(seg) = segment_at(&segments, page) else {
                log::debug!("{access:?} fault at {addr}: no mapping");
                return FaultOutcome::Unmapped;
            };

            let mut entry = self.tables.lookup(&mut self.mm.scratch(), page);
            let protection = if entry.protection_override() {
                entry.software_protection()
            } else {
                seg.protection
            };
            if !permits(protection, access) {
                match privilege {
                    Privilege::Kernel => {
                        log::error!("kernel {access:?} at {addr} violates {protection:?}");
                    }
                    Privilege::User => log::debug!("{access:?} at {addr} violates {protection:?}"),
                }
                return FaultOutcome::AccessViolation;
            }

            let was_loaded = entry.loaded();
            if !was_loaded {
                match self.load_page(seg, page, loaded.take()) {
                    Ok(Load::Installed) => {}
                    Ok(Load::Read(pending)) => {
                        drop(segments);
                        match self.read_page(pending) {
                            Ok(read) => loaded = Some(read),
                            Err(e) => return Self::outcome_of(addr, &e),
                        }
                        continue;
                    }
                    Err(e) => return Self::outcome_of(addr, &e),
                }
                entry = self.tables.lookup(&mut self.mm.scratch(), page);
            }

            if access == AccessType::Write && entry.copy_on_write() {
                if let Err(e) = self.copy_page(seg, page) {
                    return Self::outcome_of(addr, &e);
                }
            } else if was_loaded {
                // Stale TLB entry
                self.mm.mmu().invalidate_page(page.base());
            }
            return FaultOutcome::Resolved;
        }
    }

    fn outcome_of(addr: VirtualAddress, e: &VmError) -> FaultOutcome {
        match e {
            VmError::OutOfMemory => {
                log::warn!("out of memory resolving fault at {addr}");
                FaultOutcome::OutOfMemory
            }
            VmError::Backing(err) => {
                log::warn!("backing read for {addr} failed: {err}");
                FaultOutcome::BusError
            }
            other => {
                log::debug!("fault at {addr} not resolvable: {other}");
                FaultOutcome::AccessViolation
            }
        }
    }

    /// Install the page at `addr` from its frame list, loading it from the
    /// backing file if the slot is empty.
    ///
    /// # Errors
    /// - [`VmError::NotDemandPaged`] if `addr` is not mapped, or the slot is
    ///   empty and the mapping has no file behind it.
    /// - [`VmError::OutOfMemory`] or [`VmError::Backing`] from loading.
    pub fn try_load_on_demand(&self, addr: VirtualAddress) -> Result<(), VmError> {
        let page = addr.page();
        let mut loaded = None;
        loop {
            let segments = self.segments.lock();
            let seg = segment_at(&segments, page).ok_or(VmError::NotDemandPaged)?;
            match self.load_page(seg, page, loaded.take())? {
                Load::Installed => return Ok(()),
                Load::Read(pending) => {
                    drop(segments);
                    loaded = Some(self.read_page(pending)?);
                }
            }
        }
    }

    /// Map the frame of `page` into the tables. `loaded` is consumed if it
    /// was read for this very slot; otherwise an empty slot of a file
    /// mapping asks for a read.
    fn load_page(
        &self,
        seg: &Segment<'m, M>,
        page: PageNumber,
        loaded: Option<LoadedPage<'m, M>>,
    ) -> Result<Load<'m, M>, VmError> {
        let index = seg.slot_of(page);
        let frame = match seg.frames.slot(index) {
            Some(frame) => frame,
            None => match loaded.filter(|l| l.is_for(&seg.frames, index)) {
                Some(l) => l.install().ok_or(VmError::NotDemandPaged)?,
                None => {
                    let (file, offset) =
                        seg.file_offset_of(index).ok_or(VmError::NotDemandPaged)?;
                    return Ok(Load::Read(PendingLoad {
                        frames: seg.frames.clone(),
                        index,
                        file: Arc::clone(file),
                        offset,
                    }));
                }
            },
        };

        let mut s = self.mm.scratch();
        let slot = self
            .tables
            .leaf_slot(&mut s, &mut self.mm.table_frames(), page)?;
        let prev = PageTables::read(&mut s, slot);
        self.mm.absorb_access_bits(prev);
        PageTables::write(&mut s, slot, make_leaf(self.mm, seg, prev, Some(frame)));
        self.mm.mmu().invalidate_page(page.base());
        log::trace!("loaded {frame:?} at {}", page.base());
        Ok(Load::Installed)
    }

    /// Read one page of file data into a fresh frame. Runs without the
    /// segment lock.
    fn read_page(&self, pending: PendingLoad<'m, M>) -> Result<LoadedPage<'m, M>, VmError> {
        let mut buf = vec![0_u8; PAGE_BYTES];
        let n = pending.file.read(pending.offset, &mut buf)?;
        buf[n.min(PAGE_BYTES)..].fill(0);
        let frame = self.mm.new_frame_from(&buf).ok_or(VmError::OutOfMemory)?;
        Ok(LoadedPage {
            mm: self.mm,
            frames: pending.frames,
            index: pending.index,
            frame: Some(frame),
        })
    }

    /// Give the page at `addr` a private writable frame.
    ///
    /// # Errors
    /// - [`VmError::NotCopyOnWrite`] unless `addr` is a loaded
    ///   copy-on-write page.
    /// - [`VmError::OutOfMemory`]; the shared mapping is left untouched.
    pub fn try_copy_on_write(&self, addr: VirtualAddress) -> Result<(), VmError> {
        let page = addr.page();
        let segments = self.segments.lock();
        let seg = segment_at(&segments, page).ok_or(VmError::NotCopyOnWrite)?;
        self.copy_page(seg, page)
    }

    fn copy_page(&self, seg: &Segment<'m, M>, page: PageNumber) -> Result<(), VmError> {
        let (slot, entry) = {
            let mut s = self.mm.scratch();
            let slot = self
                .tables
                .find_leaf(&mut s, page)
                .ok_or(VmError::NotCopyOnWrite)?;
            (slot, PageTables::read(&mut s, slot))
        };
        if !entry.loaded() || !entry.copy_on_write() {
            return Err(VmError::NotCopyOnWrite);
        }

        self.mm.absorb_access_bits(entry);
        let frame = seg.frames.break_cow(seg.slot_of(page))?;

        let mut s = self.mm.scratch();
        let entry = PageTables::read(&mut s, slot)
            .with_frame(frame)
            .with_copy_on_write(false)
            .with_accessed(false)
            .with_dirty(false)
            .refresh_hardware();
        PageTables::write(&mut s, slot, entry);
        self.mm.mmu().invalidate_page(page.base());
        log::trace!("private copy {frame:?} at {}", page.base());
        Ok(())
    }

    /// Resolve the page at `addr` for kernel access and hold a reference on
    /// its frame until the returned guard drops.
    ///
    /// # Errors
    /// [`VmError::NotMapped`], [`VmError::PermissionDenied`],
    /// [`VmError::OutOfMemory`] or [`VmError::Backing`], as the equivalent
    /// user fault would.
    pub fn pin(&self, addr: VirtualAddress, access: AccessType) -> Result<PinnedPage<'m, M>, VmError> {
        for _ in 0..3 {
            {
                let segments = self.segments.lock();
                let seg = segment_at(&segments, addr.page()).ok_or(VmError::NotMapped)?;
                let entry = self.tables.lookup(&mut self.mm.scratch(), addr.page());
                let protection = if entry.protection_override() {
                    entry.software_protection()
                } else {
                    seg.protection
                };
                if !permits(protection, access) {
                    return Err(VmError::PermissionDenied);
                }
                if entry.loaded() && !(access == AccessType::Write && entry.copy_on_write()) {
                    let frame = entry.frame();
                    self.mm.incref(frame);
                    return Ok(PinnedPage {
                        mm: self.mm,
                        frame,
                        offset: addr.page_offset(),
                    });
                }
            }

            match self.on_page_fault(addr, access, Privilege::User) {
                FaultOutcome::Resolved => {}
                FaultOutcome::Unmapped => return Err(VmError::NotMapped),
                FaultOutcome::AccessViolation => return Err(VmError::PermissionDenied),
                FaultOutcome::OutOfMemory => return Err(VmError::OutOfMemory),
                FaultOutcome::BusError => {
                    return Err(super::BackingError::Io("page could not be loaded").into());
                }
            }
        }
        Err(VmError::NotMapped)
    }

    /// Copy user memory at `addr` into `buf`.
    ///
    /// # Errors
    /// As [`pin`](Self::pin).
    pub fn read_user(&self, addr: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr.checked_add(done as u64).ok_or(VmError::InvalidArgument)?;
            let pin = self.pin(at, AccessType::Read)?;
            let n = pin.room().min(buf.len() - done);
            self.mm.pmem_read(&mut buf[done..done + n], pin.phys());
            done += n;
        }
        Ok(())
    }

    /// Copy `data` into user memory at `addr`, breaking copy-on-write where
    /// needed.
    ///
    /// # Errors
    /// As [`pin`](Self::pin).
    pub fn write_user(&self, addr: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let at = addr.checked_add(done as u64).ok_or(VmError::InvalidArgument)?;
            let pin = self.pin(at, AccessType::Write)?;
            let n = pin.room().min(data.len() - done);
            self.mm.pmem_write(pin.phys(), &data[done..done + n]);
            self.mm.mark_dirty(pin.frame());
            done += n;
        }
        Ok(())
    }

    /// The leaf entry for `addr`; zero if none.
    pub fn page_entry(&self, addr: VirtualAddress) -> PageTableEntry {
        let _segments = self.segments.lock();
        self.tables.lookup(&mut self.mm.scratch(), addr.page())
    }

    /// Physical address `addr` currently translates to.
    pub fn translate(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        self.page_entry(addr)
            .loaded_frame()
            .map(|f| f.base() + addr.page_offset())
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.lock().values().map(Segment::info).collect()
    }

    /// Log the segment list.
    pub fn dump(&self) {
        let segments = self.segments.lock();
        log::info!(
            "address space {:?}: {} segment(s)",
            self.root(),
            segments.len()
        );
        for seg in segments.values() {
            let info = seg.info();
            log::info!(
                "  {}-{} {:?} {:?}{} {}/{} resident",
                info.start,
                info.end(),
                info.protection,
                info.flags,
                if info.file_backed { " file" } else { "" },
                info.resident,
                seg.pages
            );
        }
    }
}

impl<M: Mmu> Drop for ProcessMemory<'_, M> {
    fn drop(&mut self) {
        let mm = self.mm;
        let segments = core::mem::take(self.segments.get_mut());
        {
            let mut s = mm.scratch();
            for seg in segments.values() {
                self.tables
                    .for_each_leaf(&mut s, seg.start, seg.pages, |_, _, _, entry| {
                        mm.absorb_access_bits(entry);
                    });
            }
        }
        drop(segments);

        let root = self.tables.root();
        PageTables::from_root(root).destroy(&mut mm.scratch(), &mut mm.table_frames());
        log::debug!("address space {root:?} destroyed");
    }
}

/// A frame held for kernel access to user memory.
pub struct PinnedPage<'m, M: Mmu> {
    mm: &'m MemoryManager<M>,
    frame: FrameNumber,
    offset: u64,
}

impl<M: Mmu> PinnedPage<'_, M> {
    #[must_use]
    pub const fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Physical address of the pinned byte.
    #[must_use]
    pub fn phys(&self) -> PhysicalAddress {
        self.frame.base() + self.offset
    }

    /// Bytes from the pinned byte to the end of the page.
    #[allow(clippy::cast_possible_truncation)]
    const fn room(&self) -> usize {
        (PAGE_SIZE - self.offset) as usize
    }
}

impl<M: Mmu> Drop for PinnedPage<'_, M> {
    fn drop(&mut self) {
        self.mm.decref(self.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::frame_list::FrameListFlags;
    use crate::sim::SimMmu;

    fn manager(frames: usize) -> MemoryManager<SimMmu> {
        let mmu = SimMmu::new(FrameNumber::new(0x1000), frames);
        let region = mmu.region();
        MemoryManager::new(mmu, &[region], MemoryConfig::default())
    }

    fn list(mm: &MemoryManager<SimMmu>, pages: usize) -> FrameListRef<'_, SimMmu> {
        FrameListRef::allocate(mm, pages, FrameListFlags::empty()).unwrap()
    }

    #[test]
    fn gap_search_prefers_the_top() {
        let mm = manager(64);
        let pm = ProcessMemory::new(&mm).unwrap();
        let floor = PageNumber::new(0x200);
        let top = PageNumber::new(0x300);

        let segs = pm.segments.lock();
        assert_eq!(find_gap(&segs, 4, floor, top), Some(PageNumber::new(0x2FC)));
        assert_eq!(find_gap(&segs, 0x101, floor, top), None);
        drop(segs);

        pm.add_segment(PageNumber::new(0x2F0).base(), list(&mm, 16), Protection::READ)
            .unwrap();
        pm.add_segment(PageNumber::new(0x200).base(), list(&mm, 2), Protection::READ)
            .unwrap();
        let segs = pm.segments.lock();
        assert_eq!(find_gap(&segs, 16, floor, top), Some(PageNumber::new(0x2E0)));
        assert_eq!(find_gap(&segs, 0xEE, floor, top), Some(PageNumber::new(0x202)));
        assert_eq!(find_gap(&segs, 0xEF, floor, top), None);
    }

    #[test]
    fn leaves_follow_the_segment() {
        let mm = manager(64);
        let pm = ProcessMemory::new(&mm).unwrap();
        let frames = list(&mm, 2);
        let f0 = frames.slot(0).unwrap();
        pm.add_segment(VirtualAddress::new(0x40_0000), frames, Protection::READ | Protection::WRITE)
            .unwrap();

        let e = pm.page_entry(VirtualAddress::new(0x40_0000));
        assert!(e.present() && e.writable() && e.user_access() && e.no_execute());
        assert!(!e.copy_on_write());
        assert_eq!(e.frame(), f0);
        assert_eq!(
            pm.translate(VirtualAddress::new(0x40_0123)),
            Some(f0.base() + 0x123)
        );
        assert!(pm.page_entry(VirtualAddress::new(0x40_2000)).is_unused());
    }

    #[test]
    fn kernel_faults_are_access_violations() {
        let mm = manager(64);
        let pm = ProcessMemory::new(&mm).unwrap();
        pm.add_segment(VirtualAddress::new(0x40_0000), list(&mm, 1), Protection::READ)
            .unwrap();
        assert_eq!(
            pm.on_page_fault(VirtualAddress::new(0x40_0000), AccessType::Write, Privilege::Kernel),
            FaultOutcome::AccessViolation
        );
        assert_eq!(
            pm.on_page_fault(VirtualAddress::new(0x40_0000), AccessType::Execute, Privilege::User),
            FaultOutcome::AccessViolation
        );
        assert_eq!(
            pm.on_page_fault(VirtualAddress::new(0x40_0000), AccessType::Read, Privilege::User),
            FaultOutcome::Resolved
        );
    }

    #[test]
    fn teardown_returns_every_frame() {
        let mm = manager(64);
        let before = mm.stats().free_frames;
        {
            let pm = ProcessMemory::new(&mm).unwrap();
            pm.add_segment(VirtualAddress::new(0x40_0000), list(&mm, 3), Protection::READ)
                .unwrap();
            pm.add_segment(VirtualAddress::new(0x7F_0000_0000), list(&mm, 1), Protection::READ)
                .unwrap();
            let child = pm.duplicate().unwrap();
            child.write_user(VirtualAddress::new(0x40_0010), b"x").unwrap_err();
        }
        assert_eq!(mm.stats().free_frames, before);
    }

    #[test]
    fn pin_holds_a_reference() {
        let mm = manager(64);
        let pm = ProcessMemory::new(&mm).unwrap();
        pm.add_segment(VirtualAddress::new(0x40_0000), list(&mm, 1), Protection::READ)
            .unwrap();
        let pin = pm.pin(VirtualAddress::new(0x40_0008), AccessType::Read).unwrap();
        assert_eq!(mm.refcount(pin.frame()), 2);
        assert_eq!(pin.phys().page_offset(), 8);
        let frame = pin.frame();
        drop(pin);
        assert_eq!(mm.refcount(frame), 1);
        assert_eq!(
            pm.pin(VirtualAddress::new(0x40_0008), AccessType::Write).err(),
            Some(VmError::PermissionDenied)
        );
        assert_eq!(
            pm.pin(VirtualAddress::new(0x50_0000), AccessType::Read).err(),
            Some(VmError::NotMapped)
        );
    }
}
