//! x86-64 implementation of [`Mmu`].

use crate::{Mmu, PageTableEntry};
use core::ptr::NonNull;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_registers::StoreRegisterUnsafe;
use kernel_registers::cr3::Cr3;

/// Drives the real MMU: `invlpg`, `CR3` and the scratch window PTE.
pub struct X86Mmu {
    /// Kernel-virtual pointer to the leaf entry that maps the scratch window.
    scratch_pte: NonNull<PageTableEntry>,
    /// The scratch window page itself.
    window: NonNull<u8>,
}

// SAFETY: both pointers are fixed kernel addresses, valid on every CPU.
unsafe impl Send for X86Mmu {}
// SAFETY: the scratch PTE is only written from `bind_scratch`, whose callers
// hold the scratch lock; the other methods touch no shared state.
unsafe impl Sync for X86Mmu {}

impl X86Mmu {
    /// # Safety
    /// `scratch_pte` must point at the live leaf entry that translates
    /// `window`, and nothing else may modify that entry.
    #[must_use]
    pub const unsafe fn new(scratch_pte: NonNull<PageTableEntry>, window: NonNull<u8>) -> Self {
        Self {
            scratch_pte,
            window,
        }
    }
}

#[inline]
fn invlpg(va: u64) {
    // SAFETY: `invlpg` only drops a TLB entry; it touches no memory and any
    // address is accepted.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}

impl Mmu for X86Mmu {
    unsafe fn bind_scratch(&self, frame: FrameNumber) -> NonNull<u8> {
        let e = PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
            .with_frame(frame);
        // SAFETY: `scratch_pte` is the live leaf for the window (see `new`)
        // and the caller holds the scratch lock.
        unsafe { self.scratch_pte.as_ptr().write_volatile(e) };
        invlpg(self.window.as_ptr().addr() as u64);
        self.window
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        invlpg(va.as_u64());
    }

    unsafe fn load_root(&self, root: FrameNumber) {
        // SAFETY: forwarded from the caller.
        unsafe { Cr3::from_root(root).store_unsafe() };
    }
}
