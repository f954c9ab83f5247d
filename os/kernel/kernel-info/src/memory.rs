//! # Memory Layout

/// Lowest address a user mapping may occupy. The pages below stay unmapped
/// so that null pointer dereferences fault.
pub const USER_START: u64 = 0x0000_0000_0001_0000;

/// One past the highest user address (512 GiB, one PML4 slot).
pub const USER_END: u64 = 0x0000_0080_0000_0000;

/// Mappings without an address hint are never placed below this address.
pub const PLACEMENT_FLOOR: u64 = 0x0000_0000_0020_0000;

/// First PML4 index of the kernel half. Entries from here on are copied
/// from the kernel template into every new address space.
pub const KERNEL_PML4_FIRST: usize = 256;

/// Virtual address of the scratch physical-access page.
///
/// The PTE for this page is rebound to one physical frame at a time.
pub const SCRATCH_WINDOW_BASE: u64 = 0xffff_8080_0000_0000;

/// Start of the canonical higher half.
pub const KERNEL_HALF: u64 = 0xffff_8000_0000_0000;

const _: () = {
    assert!(USER_START.is_multiple_of(4096));
    assert!(USER_START < PLACEMENT_FLOOR);
    assert!(PLACEMENT_FLOOR < USER_END);
    assert!(SCRATCH_WINDOW_BASE >= KERNEL_HALF);
    assert!(SCRATCH_WINDOW_BASE.is_multiple_of(4096));
};
