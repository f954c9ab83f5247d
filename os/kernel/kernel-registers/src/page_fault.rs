use bitfield_struct::bitfield;

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultErrorCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (not mapped or not yet loaded)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_user_write_to_present_page() {
        let err = PageFaultErrorCode::from_bits(0b111);
        assert!(err.present());
        assert!(err.write());
        assert!(err.user());
        assert!(!err.instruction_fetch());
        assert_eq!(err.explain(), "Write access to protected page");
    }

    #[test]
    fn non_present_wins_explanation() {
        let err = PageFaultErrorCode::new().with_write(true);
        assert_eq!(err.explain(), "Non-present page (not mapped or not yet loaded)");
    }
}
