//! # Frame Lists
//!
//! A [`FrameList`] is the ordered set of frames backing one mapping: slot
//! `i` holds the frame for the `i`-th page, or nothing while a demand-paged
//! page is not loaded yet. Each occupied slot owns one page-info reference
//! on its frame.
//!
//! Lists are held through [`FrameListRef`] handles. Cloning a handle adds a
//! holder; dropping the last handle releases every frame. Segments split
//! out of one mapping, and shared mappings across a fork, hold the same
//! list. Private mappings across a fork get a [`duplicate`] instead: a new
//! list over the same frames, joined with the original in a [`CowList`].
//!
//! [`duplicate`]: FrameListRef::duplicate

use crate::cow_list::CowList;
use crate::error::VmError;
use crate::manager::MemoryManager;
use crate::page_info::PageFlags;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::{Deref, Range};
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::FrameNumber;
use kernel_sync::SpinLock;
use kernel_vmem::Mmu;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct FrameListFlags: u8 {
        /// Backs a shared mapping; never duplicated, never copy-on-write.
        const SHARED = 1 << 0;
    }
}

pub struct FrameList<'m, M: Mmu> {
    mm: &'m MemoryManager<M>,
    flags: FrameListFlags,
    holders: AtomicU32,
    inner: SpinLock<Slots>,
}

struct Slots {
    frames: Vec<Option<FrameNumber>>,
    cow: Option<Arc<CowList>>,
}

impl<'m, M: Mmu> FrameList<'m, M> {
    fn with_slots(
        mm: &'m MemoryManager<M>,
        frames: Vec<Option<FrameNumber>>,
        flags: FrameListFlags,
        cow: Option<Arc<CowList>>,
    ) -> Self {
        Self {
            mm,
            flags,
            holders: AtomicU32::new(1),
            inner: SpinLock::new(Slots { frames, cow }),
        }
    }

    fn upref(&self) {
        self.holders.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one holder; the last one releases the frames.
    pub(crate) fn downref(&self) {
        let prev = self.holders.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.holders.store(0, Ordering::Release);
            log::error!("frame list released twice");
            debug_assert!(false, "frame list released twice");
            return;
        }
        if prev == 1 {
            self.release();
        }
    }

    fn release(&self) {
        let (frames, cow) = {
            let mut s = self.inner.lock();
            (core::mem::take(&mut s.frames), s.cow.take())
        };
        for frame in frames.into_iter().flatten() {
            if let Some(cow) = &cow {
                cow.release(frame);
            }
            self.mm.decref(frame);
        }
    }

    /// Current number of handles.
    #[must_use]
    pub fn holders(&self) -> u32 {
        self.holders.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.flags.contains(FrameListFlags::SHARED)
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> Option<FrameNumber> {
        self.inner.lock().frames.get(index).copied().flatten()
    }

    /// Slot contents for a range of indices; out-of-range slots read empty.
    #[must_use]
    pub fn snapshot(&self, range: Range<usize>) -> Vec<Option<FrameNumber>> {
        let s = self.inner.lock();
        range
            .map(|i| s.frames.get(i).copied().flatten())
            .collect()
    }

    /// All loaded frames, in slot order.
    #[must_use]
    pub fn frames(&self) -> Vec<FrameNumber> {
        self.inner.lock().frames.iter().flatten().copied().collect()
    }

    #[must_use]
    pub fn cow_list(&self) -> Option<Arc<CowList>> {
        self.inner.lock().cow.clone()
    }

    /// Store a freshly loaded frame in an empty slot, taking over its
    /// reference.
    ///
    /// # Errors
    /// If the slot is already occupied the occupant is returned and the
    /// caller keeps its reference to `frame`.
    pub fn install(&self, index: usize, frame: FrameNumber) -> Result<FrameNumber, FrameNumber> {
        let mut guard = self.inner.lock();
        let s = &mut *guard;
        let len = s.frames.len();
        match s.frames.get_mut(index) {
            Some(Some(existing)) => Err(*existing),
            Some(slot) => {
                *slot = Some(frame);
                if let Some(cow) = &s.cow {
                    cow.attach(frame);
                }
                Ok(frame)
            }
            None => {
                log::error!("frame list: install at {index} beyond {len} slots");
                Err(frame)
            }
        }
    }

    /// Drop the frames in `slots`, leaving the slots empty.
    ///
    /// Only for slots no mapping can reach any more.
    pub fn release_slots(&self, slots: Range<usize>) -> usize {
        let released: Vec<FrameNumber> = {
            let mut guard = self.inner.lock();
            let s = &mut *guard;
            let end = slots.end.min(s.frames.len());
            let start = slots.start.min(end);
            let released: Vec<FrameNumber> =
                s.frames[start..end].iter_mut().filter_map(Option::take).collect();
            if let Some(cow) = &s.cow {
                for &f in &released {
                    cow.release(f);
                }
            }
            released
        };
        for &f in &released {
            self.mm.decref(f);
        }
        released.len()
    }

    /// Give this list a private copy of the frame in slot `index`.
    ///
    /// If nobody else references the frame it is kept as is. Otherwise a
    /// copy replaces it and this list's reference on the old frame is
    /// dropped.
    ///
    /// # Errors
    /// - [`VmError::NotCopyOnWrite`] if the slot is empty.
    /// - [`VmError::OutOfMemory`] if no frame is available for the copy; the
    ///   slot is unchanged.
    pub fn break_cow(&self, index: usize) -> Result<FrameNumber, VmError> {
        let mut guard = self.inner.lock();
        let s = &mut *guard;
        let Some(old) = s.frames.get(index).copied().flatten() else {
            return Err(VmError::NotCopyOnWrite);
        };
        if !self.mm.needs_copy_on_write(old) {
            return Ok(old);
        }

        let copy = self.mm.new_frame_copy(old).ok_or(VmError::OutOfMemory)?;
        s.frames[index] = Some(copy);
        if let Some(cow) = &s.cow {
            cow.release(old);
            cow.attach(copy);
            if cow.remaining() == 0 {
                // Nothing of ours is shared any more; leave the family.
                for f in s.frames.iter().flatten() {
                    cow.release(*f);
                }
                s.cow = None;
            }
        }
        drop(guard);

        self.mm.decref(old);
        log::trace!("copy-on-write: {old:?} -> {copy:?}");
        Ok(copy)
    }
}

/// Slot table with room for `capacity` entries, the first `len` empty.
fn empty_slots(len: usize, capacity: usize) -> Result<Vec<Option<FrameNumber>>, VmError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(capacity)
        .map_err(|_| VmError::OutOfMemory)?;
    slots.resize(len, None);
    Ok(slots)
}

/// Counted handle on a [`FrameList`].
pub struct FrameListRef<'m, M: Mmu> {
    list: Arc<FrameList<'m, M>>,
}

impl<'m, M: Mmu> FrameListRef<'m, M> {
    /// A list of `count` fresh zeroed frames.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; frames obtained before the failure are
    /// released again.
    pub fn allocate(
        mm: &'m MemoryManager<M>,
        count: usize,
        flags: FrameListFlags,
    ) -> Result<Self, VmError> {
        let available = u64::try_from(count).is_ok_and(|n| n <= mm.stats().free_frames);
        if !available {
            log::debug!("frame list: {count} frames requested, not enough free");
            return Err(VmError::OutOfMemory);
        }
        let mut frames = empty_slots(0, count)?;
        for _ in 0..count {
            let Some(f) = mm.new_frame(PageFlags::empty()) else {
                log::debug!("frame list: out of memory after {} of {count} frames", frames.len());
                for f in frames.into_iter().flatten() {
                    mm.decref(f);
                }
                return Err(VmError::OutOfMemory);
            };
            frames.push(Some(f));
        }
        Ok(Self::wrap(FrameList::with_slots(mm, frames, flags, None)))
    }

    /// A list of `count` empty slots, filled by demand paging.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the slot table cannot be allocated.
    pub fn demand(
        mm: &'m MemoryManager<M>,
        count: usize,
        flags: FrameListFlags,
    ) -> Result<Self, VmError> {
        let frames = empty_slots(count, count)?;
        Ok(Self::wrap(FrameList::with_slots(mm, frames, flags, None)))
    }

    fn wrap(list: FrameList<'m, M>) -> Self {
        Self {
            list: Arc::new(list),
        }
    }

    /// A private copy of this list sharing every frame copy-on-write.
    ///
    /// Both lists join the same [`CowList`]; it is created on first
    /// duplication and records the original's frames too.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        let mut guard = self.list.inner.lock();
        let s = &mut *guard;
        let cow = match s.cow.clone() {
            Some(cow) => cow,
            None => {
                let cow = Arc::new(CowList::new());
                for f in s.frames.iter().flatten() {
                    cow.attach(*f);
                }
                s.cow = Some(Arc::clone(&cow));
                cow
            }
        };
        for f in s.frames.iter().flatten() {
            self.list.mm.incref(*f);
            cow.attach(*f);
        }
        let frames = s.frames.clone();
        drop(guard);

        Self::wrap(FrameList::with_slots(
            self.list.mm,
            frames,
            self.list.flags,
            Some(cow),
        ))
    }

    /// Whether both handles refer to the same list.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.list, &b.list)
    }
}

impl<M: Mmu> Clone for FrameListRef<'_, M> {
    fn clone(&self) -> Self {
        self.list.upref();
        Self {
            list: Arc::clone(&self.list),
        }
    }
}

impl<M: Mmu> Drop for FrameListRef<'_, M> {
    fn drop(&mut self) {
        self.list.downref();
    }
}

impl<'m, M: Mmu> Deref for FrameListRef<'m, M> {
    type Target = FrameList<'m, M>;

    fn deref(&self) -> &Self::Target {
        &self.list
    }
}
