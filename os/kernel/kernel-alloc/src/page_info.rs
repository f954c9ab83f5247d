//! # Page-Info Table
//!
//! One 64-bit word of metadata per physical frame, kept in a sparse
//! four-level radix tree indexed by frame number (9 bits per level, the
//! same split as a page-table walk). Interior nodes are created on first
//! touch and never removed while the table lives.
//!
//! ```text
//! 63        35  34   33   32  31               0
//! ┌───────────┬────┬────┬────┬──────────────────┐
//! │ reserved  │ A  │ D  │ C  │    refcount      │
//! └───────────┴────┴────┴────┴──────────────────┘
//! ```
//!
//! All updates are lock-free compare-and-swap loops on the word; node
//! creation is serialized by a small spin lock and published with release
//! stores, so readers never take a lock.

use alloc::boxed::Box;
use bitflags::bitflags;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use kernel_memory_addresses::FrameNumber;
use kernel_sync::SpinLock;

const FANOUT: usize = 512;
const REFCOUNT_MASK: u64 = 0xFFFF_FFFF;

/// Refcount given to frames that must never be reclaimed.
pub const STATIC_REFCOUNT: u32 = 0x00FF_FFFF;

bitflags! {
    /// Flag bits of a page-info word.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PageFlags: u64 {
        /// Frame belongs to the file cache.
        const CACHE    = 1 << 32;
        /// Frame content was modified since it was last written back.
        const DIRTY    = 1 << 33;
        /// Frame was touched since the flag was last cleared.
        const ACCESSED = 1 << 34;
    }
}

struct Leaf {
    words: [AtomicU64; FANOUT],
}

struct Branch<T> {
    slots: [AtomicPtr<T>; FANOUT],
}

trait Node {
    fn empty() -> Self;
}

impl Node for Leaf {
    fn empty() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; FANOUT],
        }
    }
}

impl<T> Node for Branch<T> {
    fn empty() -> Self {
        Self {
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; FANOUT],
        }
    }
}

impl<T> Drop for Branch<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            let p = *slot.get_mut();
            if !p.is_null() {
                // SAFETY: non-null slots hold pointers from `Box::into_raw`
                // and are owned exclusively by this branch.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// Per-frame reference counts and flags.
pub struct PageInfoTable {
    root: Branch<Branch<Branch<Leaf>>>,
    grow: SpinLock<()>,
}

impl Default for PageInfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageInfoTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Branch::empty(),
            grow: SpinLock::new(()),
        }
    }

    /// Split a frame number into its four radix indices.
    #[allow(clippy::cast_possible_truncation)]
    const fn indices(frame: FrameNumber) -> [usize; 4] {
        let n = frame.as_u64();
        [
            ((n >> 27) & 0x1FF) as usize,
            ((n >> 18) & 0x1FF) as usize,
            ((n >> 9) & 0x1FF) as usize,
            (n & 0x1FF) as usize,
        ]
    }

    fn child<'a, T: Node>(&self, slot: &'a AtomicPtr<T>, create: bool) -> Option<&'a T> {
        let p = slot.load(Ordering::Acquire);
        if !p.is_null() {
            // SAFETY: published nodes live as long as the table.
            return Some(unsafe { &*p });
        }
        if !create {
            return None;
        }

        let _g = self.grow.lock();
        let p = slot.load(Ordering::Acquire);
        if !p.is_null() {
            // SAFETY: as above; another CPU won the race.
            return Some(unsafe { &*p });
        }
        let node = Box::into_raw(Box::new(T::empty()));
        slot.store(node, Ordering::Release);
        // SAFETY: just published, never freed before the table.
        Some(unsafe { &*node })
    }

    fn word(&self, frame: FrameNumber, create: bool) -> Option<&AtomicU64> {
        let [i3, i2, i1, i0] = Self::indices(frame);
        let l2 = self.child(&self.root.slots[i3], create)?;
        let l1 = self.child(&l2.slots[i2], create)?;
        let leaf = self.child(&l1.slots[i1], create)?;
        Some(&leaf.words[i0])
    }

    fn update(&self, frame: FrameNumber, f: impl Fn(u64) -> u64) -> u64 {
        let Some(w) = self.word(frame, true) else {
            return 0;
        };
        let mut cur = w.load(Ordering::Acquire);
        loop {
            match w.compare_exchange_weak(cur, f(cur), Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => return prev,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Initialize a freshly allocated frame: refcount 1 plus `flags`.
    pub fn init(&self, frame: FrameNumber, flags: PageFlags) {
        if let Some(w) = self.word(frame, true) {
            w.store(1 | flags.bits(), Ordering::Release);
        }
    }

    /// Forget everything about a frame that went back to the allocator.
    pub fn clear(&self, frame: FrameNumber) {
        if let Some(w) = self.word(frame, false) {
            w.store(0, Ordering::Release);
        }
    }

    pub fn incref(&self, frame: FrameNumber) {
        let prev = self.update(frame, |w| w + 1);
        debug_assert!(
            prev & REFCOUNT_MASK != REFCOUNT_MASK,
            "refcount overflow on {frame:?}"
        );
    }

    /// Drop one reference. Returns `true` when the count reached zero on a
    /// frame outside the file cache; the caller must then hand the frame
    /// back to the allocator.
    ///
    /// Decrementing a frame that has no references is a bug; it trips a
    /// debug assertion and leaves the word untouched.
    #[must_use]
    pub fn decref(&self, frame: FrameNumber) -> bool {
        let prev = self.update(frame, |w| if w & REFCOUNT_MASK == 0 { w } else { w - 1 });
        if prev & REFCOUNT_MASK == 0 {
            log::error!("page-info: refcount underflow on {frame:?}");
            debug_assert!(false, "refcount underflow on {frame:?}");
            return false;
        }
        prev & REFCOUNT_MASK == 1 && prev & PageFlags::CACHE.bits() == 0
    }

    pub fn mark_dirty(&self, frame: FrameNumber) {
        self.update(frame, |w| w | PageFlags::DIRTY.bits());
    }

    pub fn mark_accessed(&self, frame: FrameNumber) {
        self.update(frame, |w| w | PageFlags::ACCESSED.bits());
    }

    /// Test and clear the dirty flag; `true` means the frame needs writing
    /// back.
    #[must_use]
    pub fn check_flush(&self, frame: FrameNumber) -> bool {
        let prev = self.update(frame, |w| w & !PageFlags::DIRTY.bits());
        prev & PageFlags::DIRTY.bits() != 0
    }

    /// Take a frame out of the file cache by clearing `CACHE`.
    ///
    /// Returns `true` if no references were left, in which case the caller
    /// must hand the frame back to the allocator.
    #[must_use]
    pub fn uncache(&self, frame: FrameNumber) -> bool {
        if self.word(frame, false).is_none() {
            return false;
        }
        let prev = self.update(frame, |w| w & !PageFlags::CACHE.bits());
        prev & PageFlags::CACHE.bits() != 0 && prev & REFCOUNT_MASK == 0
    }

    /// Pin a frame forever (firmware tables, kernel image, MMIO).
    pub fn static_frame(&self, frame: FrameNumber) {
        if let Some(w) = self.word(frame, true) {
            w.store(
                u64::from(STATIC_REFCOUNT) | PageFlags::CACHE.bits(),
                Ordering::Release,
            );
        }
    }

    /// More than one holder: writes must copy first.
    #[must_use]
    pub fn needs_copy_on_write(&self, frame: FrameNumber) -> bool {
        self.refcount(frame) > 1
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.word(frame, false)
            .map_or(0, |w| (w.load(Ordering::Acquire) & REFCOUNT_MASK) as u32)
    }

    #[must_use]
    pub fn flags(&self, frame: FrameNumber) -> PageFlags {
        self.word(frame, false)
            .map_or(PageFlags::empty(), |w| {
                PageFlags::from_bits_truncate(w.load(Ordering::Acquire))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: FrameNumber = FrameNumber::new(0x12_3456);

    #[test]
    fn untouched_frames_read_as_zero() {
        let t = PageInfoTable::new();
        assert_eq!(t.refcount(F), 0);
        assert_eq!(t.flags(F), PageFlags::empty());
        assert!(!t.needs_copy_on_write(F));
    }

    #[test]
    fn counts_up_and_down() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::empty());
        t.incref(F);
        assert!(t.needs_copy_on_write(F));
        assert!(!t.decref(F));
        assert!(!t.needs_copy_on_write(F));
        assert!(t.decref(F));
        assert_eq!(t.refcount(F), 0);
    }

    #[test]
    fn neighbouring_frames_are_independent() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::CACHE);
        t.init(F + 1, PageFlags::empty());
        t.init(FrameNumber::new(F.as_u64() + (1 << 27)), PageFlags::empty());
        t.incref(F + 1);
        assert_eq!(t.refcount(F), 1);
        assert_eq!(t.refcount(F + 1), 2);
        assert_eq!(t.flags(F), PageFlags::CACHE);
    }

    #[test]
    fn dirty_flag_is_test_and_clear() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::empty());
        assert!(!t.check_flush(F));
        t.mark_dirty(F);
        t.mark_accessed(F);
        assert!(t.check_flush(F));
        assert!(!t.check_flush(F));
        assert_eq!(t.flags(F), PageFlags::ACCESSED);
        assert_eq!(t.refcount(F), 1);
    }

    #[test]
    fn cached_frames_outlive_their_references() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::CACHE);
        t.incref(F);
        assert!(!t.decref(F));
        assert!(!t.decref(F));
        assert_eq!(t.refcount(F), 0);
        assert!(t.uncache(F));
        assert_eq!(t.flags(F), PageFlags::empty());
        assert!(!t.uncache(F));
    }

    #[test]
    fn uncache_of_a_referenced_frame_defers_the_free() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::CACHE);
        assert!(!t.uncache(F));
        assert!(t.decref(F));
    }

    #[test]
    fn static_frames_stay_pinned() {
        let t = PageInfoTable::new();
        t.static_frame(F);
        assert_eq!(t.refcount(F), STATIC_REFCOUNT);
        assert!(t.flags(F).contains(PageFlags::CACHE));
        assert!(!t.decref(F));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn underflow_is_detected() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::empty());
        assert!(t.decref(F));
        let _ = t.decref(F);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let t = PageInfoTable::new();
        t.init(F, PageFlags::empty());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        t.incref(F);
                    }
                });
            }
        });
        assert_eq!(t.refcount(F), 4001);
    }
}
