use bitfield_struct::bitfield;
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the frame of the PML4 table and cache-control flags for PML4 walks.
/// Assumes no PCID (CR4.PCIDE = 0).
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT, page-level write-through for the PML4.
    pub pwt: bool,

    /// Bit 4: PCD, page-level cache disable for the PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51: PML4 frame number.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// A `Cr3` value pointing at the PML4 in `root`, write-back cached.
    #[must_use]
    pub fn from_root(root: FrameNumber) -> Self {
        Self::new().with_pml4_frame(root.as_u64())
    }

    /// The frame holding the PML4.
    #[must_use]
    pub fn root(&self) -> FrameNumber {
        let bits = self.into_bits();
        debug_assert_eq!(bits >> 52, 0, "CR3 has nonzero high bits: {bits:#018x}");
        FrameNumber::new(self.pml4_frame())
    }

    /// Physical address of the PML4.
    #[must_use]
    pub fn pml4_phys(&self) -> PhysicalAddress {
        self.root().base()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
