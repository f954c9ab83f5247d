use kernel_info::memory::{PLACEMENT_FLOOR, USER_END, USER_START};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use utils_accessors_derive::Setters;

/// Tunables of the memory manager.
///
/// ```rust
/// # use kernel_alloc::MemoryConfig;
/// # use kernel_memory_addresses::{FrameNumber, VirtualAddress};
/// let cfg = MemoryConfig::default()
///     .with_placement_floor(VirtualAddress::new(0x40_0000))
///     .with_kernel_template(FrameNumber::new(0x1000));
/// assert_eq!(cfg.kernel_template, Some(FrameNumber::new(0x1000)));
/// assert!(cfg.is_valid());
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Setters)]
pub struct MemoryConfig {
    /// Lowest user address that may be mapped.
    pub user_start: VirtualAddress,
    /// One past the highest user address.
    pub user_end: VirtualAddress,
    /// Lower bound for mappings placed without an address hint.
    pub placement_floor: VirtualAddress,
    /// Root table whose kernel-half entries every new address space shares.
    #[setters(strip_option)]
    pub kernel_template: Option<FrameNumber>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            user_start: VirtualAddress::new(USER_START),
            user_end: VirtualAddress::new(USER_END),
            placement_floor: VirtualAddress::new(PLACEMENT_FLOOR),
            kernel_template: None,
        }
    }
}

impl MemoryConfig {
    /// Page aligned bounds with `user_start <= placement_floor < user_end`.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.user_start.is_page_aligned()
            && self.user_end.is_page_aligned()
            && self.placement_floor.is_page_aligned()
            && self.user_start.as_u64() <= self.placement_floor.as_u64()
            && self.placement_floor.as_u64() < self.user_end.as_u64()
    }

    /// Whether `[start, end)` lies inside the user window.
    #[must_use]
    pub const fn contains(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.user_start.as_u64() <= start.as_u64()
            && start.as_u64() < end.as_u64()
            && end.as_u64() <= self.user_end.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window() {
        let cfg = MemoryConfig::default();
        assert!(cfg.is_valid());
        assert!(cfg.contains(VirtualAddress::new(0x1_0000), VirtualAddress::new(0x1_4000)));
        assert!(!cfg.contains(VirtualAddress::new(0x0), VirtualAddress::new(0x1000)));
        assert!(!cfg.contains(VirtualAddress::new(0x1_0000), VirtualAddress::new(0x1_0000)));
        assert!(!cfg.contains(
            VirtualAddress::new(USER_END - 0x1000),
            VirtualAddress::new(USER_END + 0x1000)
        ));
    }

    #[test]
    fn floor_below_start_is_invalid() {
        let cfg = MemoryConfig::default().with_placement_floor(VirtualAddress::new(0x1000));
        assert!(!cfg.is_valid());
    }
}
