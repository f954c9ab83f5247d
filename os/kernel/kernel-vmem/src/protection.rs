bitflags::bitflags! {
    /// Access permissions of a mapping.
    ///
    /// `WRITE` or `EXEC` without `READ` is normalized to include `READ`;
    /// the MMU cannot express write-only or execute-only pages.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Protection: u8 {
        /// Page may be read.
        const READ  = 1 << 0;
        /// Page may be written.
        const WRITE = 1 << 1;
        /// Page may be executed.
        const EXEC  = 1 << 2;
    }
}

impl Protection {
    /// Parse raw protection bits, rejecting anything outside `R|W|X`.
    ///
    /// ```rust
    /// # use kernel_vmem::Protection;
    /// assert_eq!(Protection::from_user_bits(2), Some(Protection::READ | Protection::WRITE));
    /// assert_eq!(Protection::from_user_bits(8), None);
    /// ```
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_user_bits(bits: u32) -> Option<Self> {
        if bits > Self::all().bits() as u32 {
            return None;
        }
        match Self::from_bits(bits as u8) {
            Some(p) => Some(p.normalized()),
            None => None,
        }
    }

    /// Add `READ` if `WRITE` or `EXEC` is present.
    #[must_use]
    pub const fn normalized(self) -> Self {
        if self.intersects(Self::WRITE.union(Self::EXEC)) {
            self.union(Self::READ)
        } else {
            self
        }
    }
}
