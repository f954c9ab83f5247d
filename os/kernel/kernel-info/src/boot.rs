//! # Boot Memory Map

/// One range of usable RAM reported by the bootloader.
///
/// Keep this `#[repr(C)]`; the bootloader writes an array of these.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalRegion {
    /// Physical base address in bytes. Need not be page aligned.
    pub base: u64,

    /// Length in bytes.
    pub length: u64,
}

impl PhysicalRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    /// One past the last byte, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Location of the [`PhysicalRegion`] array passed by the bootloader.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryMapInfo {
    /// Physical (identity mapped) address of the first region.
    pub regions_ptr: u64,

    /// Number of regions.
    pub regions_len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_end_saturates() {
        assert_eq!(PhysicalRegion::new(0x1000, 0x2000).end(), 0x3000);
        assert_eq!(PhysicalRegion::new(u64::MAX - 1, 16).end(), u64::MAX);
    }
}
