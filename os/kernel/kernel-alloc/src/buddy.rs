//! # Buddy Frame Allocator
//!
//! Hands out naturally aligned blocks of `2^order` physical frames, for
//! `order` in `0..=MAX_ORDER`.
//!
//! ## Layout
//!
//! Each boot region is managed independently. Block positions are in-region
//! frame indices, so "naturally aligned" means aligned relative to the
//! region's first frame. Per region and order the allocator keeps:
//!
//! * an intrusive doubly linked free list, threaded through two per-frame
//!   `u32` arrays (`next`/`prev`) and a list head, and
//! * a bitmap with one bit per block marking it free at that order.
//!
//! Blocks are taken from and returned to the list head. Freeing coalesces a
//! block with its buddy (`index ^ 2^order`) while the buddy is free at the
//! same order, so an `allocate(order)` immediately followed by
//! `free(block, order)` restores the exact previous state.
//!
//! Link entries of frames that are not the first frame of a free block are
//! always [`NIL`]; every removal resets them.

use alloc::vec;
use alloc::vec::Vec;
use kernel_info::boot::PhysicalRegion;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, align_down, align_up};

/// Largest supported order: `2^10` frames, 4 MiB blocks.
pub const MAX_ORDER: usize = 10;

/// End-of-list marker in the link arrays.
const NIL: u32 = u32::MAX;

/// Largest region managed as one unit; bigger boot regions are split.
const MAX_REGION_FRAMES: u64 = 1 << 30;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Region {
    base: FrameNumber,
    frames: u32,
    heads: [u32; MAX_ORDER + 1],
    next: Vec<u32>,
    prev: Vec<u32>,
    free: [Vec<u64>; MAX_ORDER + 1],
}

impl Region {
    fn new(base: FrameNumber, frames: u32) -> Self {
        let free = core::array::from_fn(|order| {
            let blocks = (frames as usize >> order) + 1;
            vec![0_u64; blocks.div_ceil(64)]
        });
        let mut region = Self {
            base,
            frames,
            heads: [NIL; MAX_ORDER + 1],
            next: vec![NIL; frames as usize],
            prev: vec![NIL; frames as usize],
            free,
        };

        // Carve into maximal naturally aligned blocks.
        let mut idx = 0_u32;
        while idx < frames {
            let mut order = MAX_ORDER;
            while order > 0
                && (idx % (1 << order) != 0 || u64::from(idx) + (1 << order) > u64::from(frames))
            {
                order -= 1;
            }
            region.push(order, idx);
            idx += 1 << order;
        }
        region
    }

    fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.base && frame - self.base < u64::from(self.frames)
    }

    fn bit(idx: u32, order: usize) -> (usize, u64) {
        let block = (idx >> order) as usize;
        (block / 64, 1 << (block % 64))
    }

    fn is_free(&self, order: usize, idx: u32) -> bool {
        let (word, mask) = Self::bit(idx, order);
        self.free[order][word] & mask != 0
    }

    fn push(&mut self, order: usize, idx: u32) {
        let head = self.heads[order];
        self.next[idx as usize] = head;
        self.prev[idx as usize] = NIL;
        if head != NIL {
            self.prev[head as usize] = idx;
        }
        self.heads[order] = idx;

        let (word, mask) = Self::bit(idx, order);
        self.free[order][word] |= mask;
    }

    fn unlink(&mut self, order: usize, idx: u32) {
        let next = self.next[idx as usize];
        let prev = self.prev[idx as usize];
        if prev == NIL {
            self.heads[order] = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next != NIL {
            self.prev[next as usize] = prev;
        }
        self.next[idx as usize] = NIL;
        self.prev[idx as usize] = NIL;

        let (word, mask) = Self::bit(idx, order);
        self.free[order][word] &= !mask;
    }

    fn pop(&mut self, order: usize) -> Option<u32> {
        let head = self.heads[order];
        if head == NIL {
            return None;
        }
        self.unlink(order, head);
        Some(head)
    }

    /// Whether `idx` lies inside a block that is free at `order` or above.
    fn covered_by_free_block(&self, idx: u32, order: usize) -> bool {
        (order..=MAX_ORDER).any(|o| {
            let start = idx & !((1 << o) - 1);
            u64::from(start) + (1 << o) <= u64::from(self.frames) && self.is_free(o, start)
        })
    }

    fn free(&mut self, mut idx: u32, mut order: usize) {
        while order < MAX_ORDER {
            let buddy = idx ^ (1 << order);
            if u64::from(buddy) + (1 << order) > u64::from(self.frames)
                || !self.is_free(order, buddy)
            {
                break;
            }
            self.unlink(order, buddy);
            idx = idx.min(buddy);
            order += 1;
        }
        self.push(order, idx);
    }
}

/// Snapshot-comparable buddy allocator over the boot memory regions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuddyAllocator {
    regions: Vec<Region>,
    total_frames: u64,
    free_frames: u64,
}

impl BuddyAllocator {
    /// Build the allocator from the usable RAM ranges reported at boot.
    ///
    /// Region bases are rounded up and ends rounded down to whole frames;
    /// empty regions are ignored.
    #[must_use]
    pub fn new(regions: &[PhysicalRegion]) -> Self {
        let mut out = Vec::new();
        for r in regions {
            let Some(start) = align_up(r.base, PAGE_SIZE) else {
                continue;
            };
            let end = align_down(r.end(), PAGE_SIZE);
            if end <= start {
                continue;
            }

            let mut first = start / PAGE_SIZE;
            let last = end / PAGE_SIZE;
            while first < last {
                let count = (last - first).min(MAX_REGION_FRAMES);
                #[allow(clippy::cast_possible_truncation)]
                out.push(Region::new(FrameNumber::new(first), count as u32));
                first += count;
            }
        }
        out.sort_by_key(|r| r.base);

        let total_frames = out.iter().map(|r| u64::from(r.frames)).sum();
        log::debug!(
            "buddy allocator: {} region(s), {total_frames} frames",
            out.len()
        );
        Self {
            regions: out,
            total_frames,
            free_frames: total_frames,
        }
    }

    /// Allocate a block of `2^order` frames; `None` when exhausted.
    ///
    /// The smallest free block of at least `order` is split down, each upper
    /// half going to the head of its order's free list in the same region.
    pub fn allocate(&mut self, order: usize) -> Option<FrameNumber> {
        if order > MAX_ORDER {
            return None;
        }

        for from in order..=MAX_ORDER {
            for region in &mut self.regions {
                let Some(idx) = region.pop(from) else {
                    continue;
                };
                let mut o = from;
                while o > order {
                    o -= 1;
                    region.push(o, idx + (1 << o));
                }
                self.free_frames -= 1 << order;
                return Some(region.base + u64::from(idx));
            }
        }
        None
    }

    /// Return a block previously obtained with [`allocate`](Self::allocate)
    /// at the same `order`.
    ///
    /// Freeing a block that is already free, or that is not inside any
    /// managed region, is a bug: it trips a debug assertion and is otherwise
    /// ignored.
    pub fn free(&mut self, block: FrameNumber, order: usize) {
        let Some(region) = self.regions.iter_mut().find(|r| r.contains(block)) else {
            log::error!("buddy: free of unmanaged frame {block:?}");
            debug_assert!(false, "free of unmanaged frame {block:?}");
            return;
        };

        #[allow(clippy::cast_possible_truncation)]
        let idx = (block - region.base) as u32;
        if order > MAX_ORDER
            || idx % (1 << order) != 0
            || u64::from(idx) + (1 << order) > u64::from(region.frames)
        {
            log::error!("buddy: misaligned free of {block:?} at order {order}");
            debug_assert!(false, "misaligned free of {block:?} at order {order}");
            return;
        }
        if region.covered_by_free_block(idx, order) {
            log::error!("buddy: double free of {block:?} at order {order}");
            debug_assert!(false, "double free of {block:?} at order {order}");
            return;
        }

        region.free(idx, order);
        self.free_frames += 1 << order;
    }

    /// Allocate `count` contiguous frames, rounded up to a power of two.
    pub fn allocate_frames(&mut self, count: u64) -> Option<FrameNumber> {
        self.allocate(order_for(count)?)
    }

    /// Free a run obtained with [`allocate_frames`](Self::allocate_frames).
    pub fn free_frames(&mut self, base: FrameNumber, count: u64) {
        match order_for(count) {
            Some(order) => self.free(base, order),
            None => {
                log::error!("buddy: free of {count} frames exceeds the largest block");
                debug_assert!(false, "free of {count} frames exceeds the largest block");
            }
        }
    }

    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total_frames
    }

    #[must_use]
    pub const fn free_frames_count(&self) -> u64 {
        self.free_frames
    }
}

/// Smallest order whose block holds `count` frames.
#[must_use]
pub const fn order_for(count: u64) -> Option<usize> {
    if count == 0 || count > (1 << MAX_ORDER) {
        return None;
    }
    Some(count.next_power_of_two().trailing_zeros() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(base: u64, count: u64) -> PhysicalRegion {
        PhysicalRegion::new(base * PAGE_SIZE, count * PAGE_SIZE)
    }

    #[test]
    fn region_is_carved_into_aligned_blocks() {
        // 1024 + 16 + 4 + 1 frames
        let b = BuddyAllocator::new(&[frames(0x100, 1045)]);
        let r = &b.regions[0];
        assert_eq!(r.heads[10], 0);
        assert_eq!(r.heads[4], 1024);
        assert_eq!(r.heads[2], 1040);
        assert_eq!(r.heads[0], 1044);
        assert_eq!(r.heads[1], NIL);
        assert_eq!(b.total_frames(), 1045);
    }

    #[test]
    fn unaligned_region_bounds_are_trimmed() {
        let b = BuddyAllocator::new(&[PhysicalRegion::new(0x1001, 0x3000)]);
        // [0x2000, 0x4000) survives
        assert_eq!(b.total_frames(), 2);
        assert_eq!(b.regions[0].base, FrameNumber::new(2));
        assert!(BuddyAllocator::new(&[PhysicalRegion::new(0x1001, 0x100)]).regions.is_empty());
    }

    #[test]
    fn split_then_coalesce() {
        let mut b = BuddyAllocator::new(&[frames(0, 8)]);
        let a = b.allocate(0).unwrap();
        assert_eq!(a, FrameNumber::new(0));
        assert_eq!(b.free_frames_count(), 7);
        let r = &b.regions[0];
        assert_eq!(r.heads[0], 1);
        assert_eq!(r.heads[1], 2);
        assert_eq!(r.heads[2], 4);
        assert_eq!(r.heads[3], NIL);

        b.free(a, 0);
        let r = &b.regions[0];
        assert_eq!(r.heads[3], 0);
        assert_eq!(r.heads[0], NIL);
        assert_eq!(b.free_frames_count(), 8);
    }

    #[test]
    fn round_trip_restores_identical_state() {
        let mut b = BuddyAllocator::new(&[frames(0x10, 1000), frames(0x1000, 37)]);
        let _keep = b.allocate(3).unwrap();
        for order in 0..=MAX_ORDER {
            let before = b.clone();
            if let Some(block) = b.allocate(order) {
                b.free(block, order);
            }
            assert_eq!(b, before, "order {order}");
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut b = BuddyAllocator::new(&[frames(0, 3)]);
        assert!(b.allocate(2).is_none());
        assert!(b.allocate(1).is_some());
        assert!(b.allocate(0).is_some());
        assert!(b.allocate(0).is_none());
        assert_eq!(b.free_frames_count(), 0);
        assert!(b.allocate(MAX_ORDER + 1).is_none());
    }

    #[test]
    fn falls_through_to_later_regions() {
        let mut b = BuddyAllocator::new(&[frames(0x10, 1), frames(0x20, 1)]);
        assert_eq!(b.allocate(0), Some(FrameNumber::new(0x10)));
        assert_eq!(b.allocate(0), Some(FrameNumber::new(0x20)));
        assert_eq!(b.allocate(0), None);
    }

    #[test]
    fn contiguous_runs_round_up() {
        let mut b = BuddyAllocator::new(&[frames(0, 16)]);
        let run = b.allocate_frames(5).unwrap();
        assert_eq!(b.free_frames_count(), 8);
        b.free_frames(run, 5);
        assert_eq!(b.free_frames_count(), 16);
        assert_eq!(order_for(0), None);
        assert_eq!(order_for(1), Some(0));
        assert_eq!(order_for(1024), Some(10));
        assert_eq!(order_for(1025), None);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected() {
        let mut b = BuddyAllocator::new(&[frames(0, 4)]);
        let f = b.allocate(0).unwrap();
        b.free(f, 0);
        b.free(f, 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn freeing_inside_a_free_block_is_detected() {
        let mut b = BuddyAllocator::new(&[frames(0, 4)]);
        b.free(FrameNumber::new(1), 0);
    }
}
