use kernel_memory_addresses::VirtualAddress;

/// CR2: Page-Fault Linear Address.
///
/// Written by the CPU with the address that caused the most recent `#PF`.
/// Must be read before anything else can fault.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cr2(u64);

impl Cr2 {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The faulting virtual address.
    #[must_use]
    pub const fn address(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(cr2)
    }
}
