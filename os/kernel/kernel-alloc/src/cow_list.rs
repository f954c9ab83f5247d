//! Sharing bookkeeping for a family of duplicated frame lists.
//!
//! When a private frame list is duplicated, the original and the copy refer
//! to the same frames. The [`CowList`] they share records, per frame, how
//! many lists of the family still hold it, and how many frames are held by
//! more than one list. Once that number drops to zero no copy-on-write
//! breaking is left to do and the lists may forget the family.

use alloc::collections::BTreeMap;
use kernel_memory_addresses::FrameNumber;
use kernel_sync::SpinLock;

#[derive(Default)]
pub struct CowList {
    state: SpinLock<CowState>,
}

#[derive(Default)]
struct CowState {
    sharers: BTreeMap<FrameNumber, u32>,
    remaining: u64,
}

impl CowList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more list holding `frame`.
    pub fn attach(&self, frame: FrameNumber) {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        let n = s.sharers.entry(frame).or_insert(0);
        *n += 1;
        if *n == 2 {
            s.remaining += 1;
        }
    }

    /// Record that one list stopped holding `frame`.
    pub fn release(&self, frame: FrameNumber) {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        let Some(n) = s.sharers.get_mut(&frame) else {
            log::error!("cow list: release of untracked {frame:?}");
            debug_assert!(false, "release of untracked {frame:?}");
            return;
        };
        *n -= 1;
        let left = *n;
        match left {
            0 => {
                s.sharers.remove(&frame);
            }
            1 => s.remaining -= 1,
            _ => {}
        }
    }

    /// Number of lists holding `frame`.
    #[must_use]
    pub fn sharers(&self, frame: FrameNumber) -> u32 {
        self.state.lock().sharers.get(&frame).copied().unwrap_or(0)
    }

    /// Frames still held by more than one list.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.state.lock().remaining
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().sharers.is_empty()
    }
}
