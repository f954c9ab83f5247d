//! # Page-Table Entry
//!
//! One 64-bit entry format for every paging level. Only 4 KiB leaves are
//! ever created, so the `PS` position is treated as `PAT` at every level and
//! always left clear.
//!
//! ## Software bits
//!
//! Bits 52..=58 are ignored by the MMU and carry the memory manager's own
//! per-page state:
//!
//! | Bit | Field | Meaning |
//! |-----|-------|---------|
//! | 52 | `sw_read` | Page may be read. |
//! | 53 | `sw_write` | Page may be written. |
//! | 54 | `sw_exec` | Page may be executed. |
//! | 55 | `loaded` | A frame is installed; `frame_bits` is valid. |
//! | 56 | `copy_on_write` | The frame is shared; a write must copy it first. |
//! | 57 | `shared` | Page belongs to a shared mapping and never becomes COW. |
//! | 58 | `protection_override` | `sw_*` bits were set by a protection change and win over the segment's protection. |
//!
//! The hardware bits are always derived from the software bits with
//! [`PageTableEntry::refresh_hardware`], so a not-yet-loaded page keeps its
//! permissions while `present` is clear.

use crate::Protection;
use bitfield_struct::bitfield;
use kernel_memory_addresses::FrameNumber;

/// A single x86-64 page-table entry.
///
/// ### Bit layout
///
/// | Bits      | Name              | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P`               | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed (set by the CPU) |
/// | 6         | `D`               | Dirty (leaf only, set by the CPU) |
/// | 7         | `PAT`             | Always clear here |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Unused |
/// | 12–51     | frame             | Physical frame number |
/// | 52–58     | software bits     | See the module docs |
/// | 59–62     | `PKU`             | Protection key, unused |
/// | 63        | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::{PageTableEntry, Protection};
/// # use kernel_memory_addresses::FrameNumber;
/// let e = PageTableEntry::new()
///     .with_frame(FrameNumber::new(0x1234))
///     .with_loaded(true)
///     .with_software_protection(Protection::READ | Protection::WRITE)
///     .refresh_hardware();
/// assert!(e.present());
/// assert!(e.writable());
/// assert!(e.no_execute());
/// assert_eq!(e.frame(), FrameNumber::new(0x1234));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Checked for user accesses and, with `CR0.WP`, for supervisor writes.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on any access through the entry.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a leaf.
    pub dirty: bool,

    /// PAT (bit 7 at L1); PS at L2/L3. Never set by this crate.
    pub pat: bool,

    /// Global (G, bit 8).
    pub global_translation: bool,

    #[bits(3)]
    pub os_available_low: u8,

    /// Physical frame number (bits 12..=51).
    #[bits(40)]
    frame_bits: u64,

    /// Software read permission (bit 52).
    pub sw_read: bool,

    /// Software write permission (bit 53).
    pub sw_write: bool,

    /// Software execute permission (bit 54).
    pub sw_exec: bool,

    /// A frame is installed (bit 55).
    pub loaded: bool,

    /// The installed frame is shared copy-on-write (bit 56).
    pub copy_on_write: bool,

    /// The page belongs to a shared mapping (bit 57).
    pub shared: bool,

    /// `sw_*` were set explicitly and override the segment (bit 58).
    pub protection_override: bool,

    /// Protection key (bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// The all-zero entry: not present, nothing recorded.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// An intermediate entry pointing at the next-level table in `frame`.
    ///
    /// Links are maximally permissive; access control happens at the leaf.
    #[inline]
    #[must_use]
    pub const fn table_link(frame: FrameNumber) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame_bits(frame.as_u64())
    }

    /// Whether nothing at all is recorded in the entry.
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.frame_bits())
    }

    #[inline]
    pub const fn set_frame(&mut self, frame: FrameNumber) {
        self.set_frame_bits(frame.as_u64());
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: FrameNumber) -> Self {
        self.with_frame_bits(frame.as_u64())
    }

    /// The frame, if one is installed.
    #[inline]
    #[must_use]
    pub const fn loaded_frame(&self) -> Option<FrameNumber> {
        if self.loaded() {
            Some(self.frame())
        } else {
            None
        }
    }

    /// The software permission bits as a [`Protection`].
    #[inline]
    #[must_use]
    pub const fn software_protection(&self) -> Protection {
        let mut bits = 0;
        if self.sw_read() {
            bits |= Protection::READ.bits();
        }
        if self.sw_write() {
            bits |= Protection::WRITE.bits();
        }
        if self.sw_exec() {
            bits |= Protection::EXEC.bits();
        }
        Protection::from_bits_truncate(bits)
    }

    #[inline]
    #[must_use]
    pub const fn with_software_protection(self, prot: Protection) -> Self {
        self.with_sw_read(prot.contains(Protection::READ))
            .with_sw_write(prot.contains(Protection::WRITE))
            .with_sw_exec(prot.contains(Protection::EXEC))
    }

    /// Recompute the hardware bits from the software state.
    ///
    /// * `present` = loaded and readable
    /// * `writable` = loaded, writable and not copy-on-write
    /// * `no_execute` = not executable
    /// * `user_access` always set for user leaves
    #[inline]
    #[must_use]
    pub const fn refresh_hardware(self) -> Self {
        let loaded = self.loaded();
        self.with_user_access(true)
            .with_present(loaded && self.sw_read())
            .with_writable(loaded && self.sw_write() && !self.copy_on_write())
            .with_no_execute(!self.sw_exec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_bits_sit_above_the_frame() {
        let e = PageTableEntry::new()
            .with_frame(FrameNumber::new(0xF_FFFF_FFFF))
            .with_sw_read(true)
            .with_protection_override(true);
        assert_eq!(e.into_bits() & (1 << 52), 1 << 52);
        assert_eq!(e.into_bits() & (1 << 58), 1 << 58);
        assert_eq!(e.frame(), FrameNumber::new(0xF_FFFF_FFFF));
    }

    #[test]
    fn copy_on_write_hides_write_permission() {
        let e = PageTableEntry::new()
            .with_loaded(true)
            .with_copy_on_write(true)
            .with_software_protection(Protection::READ | Protection::WRITE)
            .refresh_hardware();
        assert!(e.present());
        assert!(!e.writable());
        assert!(e.no_execute());
        assert!(e.user_access());
    }

    #[test]
    fn unloaded_entry_is_not_present_but_keeps_permissions() {
        let e = PageTableEntry::new()
            .with_software_protection(Protection::READ | Protection::EXEC)
            .refresh_hardware();
        assert!(!e.present());
        assert!(!e.is_unused());
        assert!(!e.no_execute());
        assert_eq!(e.software_protection(), Protection::READ | Protection::EXEC);
        assert_eq!(e.loaded_frame(), None);
    }

    #[test]
    fn write_only_page_is_not_present() {
        let e = PageTableEntry::new()
            .with_loaded(true)
            .with_software_protection(Protection::empty())
            .refresh_hardware();
        assert!(!e.present());
        assert!(!e.writable());
    }

    #[test]
    fn table_link_is_permissive() {
        let e = PageTableEntry::table_link(FrameNumber::new(9));
        assert!(e.present() && e.writable() && e.user_access());
        assert!(!e.no_execute());
        assert_eq!(e.frame(), FrameNumber::new(9));
    }
}
