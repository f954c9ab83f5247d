//! # Scratch Window
//!
//! Physical frames are not identity mapped, so any access to physical
//! memory (page tables, zeroing, copying, file data) goes through a single
//! one-page virtual window whose backing frame is re-pointed on demand.
//!
//! A [`ScratchGuard`] owns the window: interrupts are disabled for its
//! whole lifetime and the window lock is held, so nothing else can move the
//! window while a pointer into it is alive. Copying between two frames
//! bounces through a page-sized kernel buffer, since only one frame can be
//! visible at a time.

use alloc::boxed::Box;
use core::ptr::NonNull;
use kernel_memory_addresses::{FrameNumber, PAGE_BYTES, PhysicalAddress};
use kernel_sync::{IrqGuard, SpinLock, SpinLockGuard};
use kernel_vmem::{Mmu, PageTableEntry, PhysAccess};

pub struct ScratchWindow {
    state: SpinLock<ScratchState>,
}

struct ScratchState {
    bounce: Box<[u8; PAGE_BYTES]>,
}

impl Default for ScratchWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SpinLock::new(ScratchState {
                bounce: Box::new([0; PAGE_BYTES]),
            }),
        }
    }

    /// Take exclusive use of the window.
    pub fn acquire<'a, M: Mmu>(&'a self, mmu: &'a M) -> ScratchGuard<'a, M> {
        let irq = IrqGuard::new();
        let state = self.state.lock();
        ScratchGuard {
            state,
            mmu,
            _irq: irq,
        }
    }
}

/// Exclusive handle on the scratch window.
///
/// Fields drop in order: the lock is released before interrupts come back.
pub struct ScratchGuard<'a, M: Mmu> {
    state: SpinLockGuard<'a, ScratchState>,
    mmu: &'a M,
    _irq: IrqGuard,
}

impl<M: Mmu> ScratchGuard<'_, M> {
    /// Point the window at `frame` and return the window base.
    ///
    /// The pointer is only valid until the next `set_frame` on this guard.
    pub fn set_frame(&mut self, frame: FrameNumber) -> NonNull<u8> {
        // SAFETY: the guard serializes all users of the window.
        unsafe { self.mmu.bind_scratch(frame) }
    }

    /// Copy `dst.len()` bytes starting at `phys` into `dst`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(&mut self, dst: &mut [u8], mut phys: PhysicalAddress) {
        let mut done = 0;
        while done < dst.len() {
            let offset = phys.page_offset() as usize;
            let n = (PAGE_BYTES - offset).min(dst.len() - done);
            let base = self.set_frame(phys.frame());
            // SAFETY: `offset + n <= PAGE_BYTES` stays inside the window.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    base.as_ptr().add(offset),
                    dst[done..].as_mut_ptr(),
                    n,
                );
            }
            done += n;
            phys += n as u64;
        }
    }

    /// Copy `src` into physical memory starting at `phys`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&mut self, mut phys: PhysicalAddress, src: &[u8]) {
        let mut done = 0;
        while done < src.len() {
            let offset = phys.page_offset() as usize;
            let n = (PAGE_BYTES - offset).min(src.len() - done);
            let base = self.set_frame(phys.frame());
            // SAFETY: `offset + n <= PAGE_BYTES` stays inside the window.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src[done..].as_ptr(),
                    base.as_ptr().add(offset),
                    n,
                );
            }
            done += n;
            phys += n as u64;
        }
    }

    pub fn zero(&mut self, frame: FrameNumber) {
        let base = self.set_frame(frame);
        // SAFETY: the window maps exactly one page.
        unsafe { core::ptr::write_bytes(base.as_ptr(), 0, PAGE_BYTES) };
    }

    /// Copy a whole frame.
    pub fn copy_frame(&mut self, dst: FrameNumber, src: FrameNumber) {
        let base = self.set_frame(src);
        // SAFETY: one page from the window into the bounce buffer.
        unsafe {
            core::ptr::copy_nonoverlapping(
                base.as_ptr(),
                self.state.bounce.as_mut_ptr(),
                PAGE_BYTES,
            );
        }
        let base = self.set_frame(dst);
        // SAFETY: and back out into the destination frame.
        unsafe {
            core::ptr::copy_nonoverlapping(self.state.bounce.as_ptr(), base.as_ptr(), PAGE_BYTES);
        }
    }

    /// Volatile read of the `index`-th `u64` of a frame.
    pub fn read_u64(&mut self, frame: FrameNumber, index: usize) -> u64 {
        debug_assert!(index < PAGE_BYTES / 8);
        let base = self.set_frame(frame).cast::<u64>();
        // SAFETY: aligned and inside the window.
        unsafe { base.add(index).read_volatile() }
    }

    pub fn write_u64(&mut self, frame: FrameNumber, index: usize, value: u64) {
        debug_assert!(index < PAGE_BYTES / 8);
        let base = self.set_frame(frame).cast::<u64>();
        // SAFETY: aligned and inside the window.
        unsafe { base.add(index).write_volatile(value) };
    }
}

impl<M: Mmu> PhysAccess for ScratchGuard<'_, M> {
    fn read_entry(&mut self, table: FrameNumber, index: usize) -> PageTableEntry {
        PageTableEntry::from_bits(self.read_u64(table, index))
    }

    fn write_entry(&mut self, table: FrameNumber, index: usize, entry: PageTableEntry) {
        self.write_u64(table, index, entry.into_bits());
    }

    fn zero_frame(&mut self, frame: FrameNumber) {
        self.zero(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMmu;

    #[test]
    fn reads_and_writes_span_frames() {
        let mmu = SimMmu::new(FrameNumber::new(0x100), 4);
        let window = ScratchWindow::new();
        let mut g = window.acquire(&mmu);

        let data: alloc::vec::Vec<u8> = (0..6000_u32).map(|i| (i % 251) as u8).collect();
        let start = FrameNumber::new(0x100).base() + 0xF00;
        g.write(start, &data);

        let mut back = alloc::vec![0_u8; data.len()];
        g.read(&mut back, start);
        assert_eq!(back, data);
        assert!(mmu.binds() >= 4);

        // The write crossed into the second and third frame.
        assert_eq!(g.read_u64(FrameNumber::new(0x101), 0) & 0xFF, u64::from(data[0x100]));
    }

    #[test]
    fn copy_and_zero() {
        let mmu = SimMmu::new(FrameNumber::new(0x10), 2);
        let window = ScratchWindow::new();
        let mut g = window.acquire(&mmu);

        g.write_u64(FrameNumber::new(0x10), 7, 0xDEAD_BEEF);
        g.copy_frame(FrameNumber::new(0x11), FrameNumber::new(0x10));
        assert_eq!(g.read_u64(FrameNumber::new(0x11), 7), 0xDEAD_BEEF);

        g.zero(FrameNumber::new(0x10));
        assert_eq!(g.read_u64(FrameNumber::new(0x10), 7), 0);
        assert_eq!(g.read_u64(FrameNumber::new(0x11), 7), 0xDEAD_BEEF);
    }

    #[test]
    fn interrupts_are_off_while_held() {
        let mmu = SimMmu::new(FrameNumber::new(0x10), 1);
        let window = ScratchWindow::new();
        let g = window.acquire(&mmu);
        assert!(!kernel_sync::irq::interrupts_enabled());
        drop(g);
    }
}
