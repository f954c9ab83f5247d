//! # Kernel Memory Layout and Boot Interface
//!
//! Constants and boot-time records shared by the memory manager, the
//! bootloader handoff and the interrupt layer.
//!
//! ## Overview
//!
//! ### Memory Layout ([`memory`])
//! Fixes the virtual address space split:
//! * **User window**: `[USER_START, USER_END)` may hold user mappings.
//! * **Placement floor**: mappings without an address hint are placed at or
//!   above [`PLACEMENT_FLOOR`](memory::PLACEMENT_FLOOR).
//! * **Scratch window**: one reserved kernel page that is rebound to
//!   arbitrary physical frames for physical memory access.
//! * **Kernel half**: PML4 slots shared by every address space.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │          Null guard             │
//! USER_START            ├─────────────────────────────────┤ 0x0000_0000_0001_0000
//!                       │   Fixed / hinted user mappings  │
//! PLACEMENT_FLOOR       ├─────────────────────────────────┤ 0x0000_0000_0020_0000
//!                       │   Placed user mappings (grow    │
//!                       │   downward from USER_END)       │
//! USER_END              ├─────────────────────────────────┤ 0x0000_0080_0000_0000
//!                       │          Unused                 │
//! KERNEL_HALF           ├─────────────────────────────────┤ 0xFFFF_8000_0000_0000
//!                       │  Kernel (shared PML4 entries)   │
//! SCRATCH_WINDOW_BASE   │  Scratch physical-access page   │ 0xFFFF_8080_0000_0000
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ### Boot Information ([`boot`])
//! Describes the usable physical memory handed over by the bootloader as a
//! list of [`PhysicalRegion`](boot::PhysicalRegion) records.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
