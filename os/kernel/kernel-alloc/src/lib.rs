//! # Kernel Memory Manager
//!
//! Physical frame management and user address spaces.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  vmm: map / unmap / change_protection / fork        │
//! │       page-fault resolution                         │
//! └───────┬───────────────────────────┬─────────────────┘
//!         │                           │
//! ┌───────▼─────────┐        ┌────────▼────────────────┐
//! │ ProcessMemory   │        │ FrameList / CowList     │
//! │  segments       │───────▶│  frame ownership        │
//! │  page tables    │        │  copy-on-write sharing  │
//! └───────┬─────────┘        └────────┬────────────────┘
//!         │                           │
//! ┌───────▼───────────────────────────▼─────────────────┐
//! │ MemoryManager                                       │
//! │  buddy allocator · page-info table · scratch window │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Frame ownership
//!
//! Every frame mapped into user space is owned by a [`FrameList`]; page
//! table entries never hold a reference of their own. A frame returns to the
//! buddy allocator once its reference count reaches zero and the page cache
//! no longer holds it.
//!
//! ## Physical memory access
//!
//! The kernel has no direct map. Physical memory is reached through a single
//! scratch window, rebound to one frame at a time under
//! [`ScratchWindow::acquire`], with interrupts disabled while bound.
//!
//! ## Lock order
//!
//! Address-space segments, then frame lists, then copy-on-write lists, then
//! the scratch window, then the buddy allocator.
//!
//! ## Hosted testing
//!
//! [`sim::SimMmu`] implements [`kernel_vmem::Mmu`] over a heap arena so the
//! whole stack runs in ordinary unit and integration tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod buddy;
pub mod config;
pub mod cow_list;
pub mod error;
pub mod frame_list;
pub mod manager;
pub mod page_info;
pub mod scratch;
pub mod sim;
pub mod vmm;

pub use buddy::BuddyAllocator;
pub use config::MemoryConfig;
pub use cow_list::CowList;
pub use error::VmError;
pub use frame_list::{FrameList, FrameListFlags, FrameListRef};
pub use manager::{MemoryManager, MemoryStats};
pub use page_info::{PageFlags, PageInfoTable};
pub use scratch::{ScratchGuard, ScratchWindow};
pub use vmm::ProcessMemory;
