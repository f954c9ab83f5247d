//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the addresses and page indices the memory
//! manager passes around.
//!
//! ## Overview
//!
//! The memory manager deals in two address spaces and, for each of them, in
//! two granularities:
//!
//! | Type | Space | Granularity | Description |
//! |------|-------|-------------|-------------|
//! | [`PhysicalAddress`] | physical | byte | Host RAM or MMIO address. |
//! | [`FrameNumber`] | physical | page | Index of a physical frame (`address >> 12`). |
//! | [`VirtualAddress`] | virtual | byte | Page-table translated address. |
//! | [`PageNumber`] | virtual | page | Index of a virtual page (`address >> 12`). |
//!
//! All four are `#[repr(transparent)]` newtypes over `u64`, so they cost
//! nothing at runtime but cannot be mixed up at compile time. Frames are not
//! objects: everything that refers to physical memory does so by
//! [`FrameNumber`].
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x40_1234);
//! assert_eq!(va.page(), PageNumber::new(0x401));
//! assert_eq!(va.page_offset(), 0x234);
//! assert_eq!(va.page().base(), VirtualAddress::new(0x40_1000));
//!
//! let pa = PhysicalAddress::new(0x0010_2042);
//! assert_eq!(pa.frame(), FrameNumber::new(0x102));
//! assert_eq!(pa.frame().base() + pa.page_offset(), pa);
//! ```
//!
//! Only 4 KiB pages exist in this memory manager; huge pages are never
//! created for user mappings.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod page_number;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use page_number::PageNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Number of low address bits that select a byte within a page.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// [`PAGE_SIZE`] as `usize`, for buffer lengths.
#[allow(clippy::cast_possible_truncation)]
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `len` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(0x4000), 4);
/// assert_eq!(pages_for(0x4001), 5);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_and_page_round_trip() {
        let pa = PhysicalAddress::new(0x1234_5678);
        assert_eq!(pa.frame().as_u64(), 0x1234_5);
        assert_eq!(pa.frame().base().as_u64(), 0x1234_5000);
        assert_eq!(pa.page_offset(), 0x678);

        let va = VirtualAddress::new(0x7fff_ffff_f123);
        assert_eq!(va.page().as_u64(), 0x7_ffff_fff1);
        assert_eq!(va.page().base() + va.page_offset(), va);
    }

    #[test]
    fn alignment_helpers() {
        assert!(VirtualAddress::new(0x40_0000).is_page_aligned());
        assert!(!VirtualAddress::new(0x40_0001).is_page_aligned());
        assert_eq!(
            VirtualAddress::new(0x40_0fff).align_down(),
            VirtualAddress::new(0x40_0000)
        );
        assert_eq!(
            VirtualAddress::new(0x40_0001).align_up(),
            Some(VirtualAddress::new(0x40_1000))
        );
        assert_eq!(VirtualAddress::new(u64::MAX).align_up(), None);
    }

    #[test]
    fn page_arithmetic() {
        let p = PageNumber::new(0x400);
        assert_eq!(p + 3, PageNumber::new(0x403));
        assert_eq!(PageNumber::new(0x403) - p, 3);
        assert_eq!(FrameNumber::new(7) + 1, FrameNumber::new(8));
    }

    #[test]
    fn debug_formatting_names_the_space() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000)),
            "VA(0x0000000000001000)"
        );
        assert_eq!(format!("{:?}", FrameNumber::new(0x10)), "PFN(0x10)");
        assert_eq!(format!("{:?}", PageNumber::new(0x10)), "VPN(0x10)");
    }
}
