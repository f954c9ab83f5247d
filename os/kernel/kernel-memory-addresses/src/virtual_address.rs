use crate::{PAGE_SIZE, PageNumber, align_down, align_up};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Virtual memory address.
///
/// Carries the *kind* of address at the type level so virtual and physical
/// values cannot be mixed. Canonicality is not validated; user mappings are
/// range-checked against the configured user window instead.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x40_0123);
/// assert_eq!(va.page(), PageNumber::new(0x400));
/// assert_eq!(va.align_down(), VirtualAddress::new(0x40_0000));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.addr() as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page that contains this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PageNumber {
        PageNumber::containing(self)
    }

    /// Byte offset within the containing page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    /// Round up to the next page boundary, or `None` if that overflows.
    #[inline]
    #[must_use]
    pub const fn align_up(self) -> Option<Self> {
        match align_up(self.0, PAGE_SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PageNumber> for VirtualAddress {
    #[inline]
    fn from(value: PageNumber) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
