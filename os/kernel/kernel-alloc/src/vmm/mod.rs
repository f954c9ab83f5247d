//! # Virtual Memory Management
//!
//! User address spaces and the operations the system-call layer exposes on
//! them:
//!
//! * [`map`] / [`map_with`]: create a mapping, anonymous or file backed
//! * [`unmap`] / [`unmap_range`]: remove mappings
//! * [`change_protection`]: per-page protection changes
//! * [`fork_address_space`]: copy-on-write duplication
//! * [`on_page_fault`]: fault resolution through the installed handler
//!
//! ## Placement
//!
//! An address hint is honoured exactly or the call fails; there is no
//! fallback search. Without a hint the highest free gap at or above the
//! configured placement floor is used.
//!
//! ## Backing
//!
//! Anonymous memory is allocated and zeroed when mapped, so running out of
//! memory surfaces from [`map`]. File mappings start empty and are filled
//! page by page on first access.
//!
//! ```rust
//! # use kernel_alloc::{MemoryConfig, MemoryManager, sim::SimMmu};
//! # use kernel_alloc::vmm::{self, Backing, ProcessMemory};
//! # use kernel_memory_addresses::{FrameNumber, VirtualAddress};
//! # use kernel_vmem::Protection;
//! let mmu = SimMmu::new(FrameNumber::new(0x100), 64);
//! let region = mmu.region();
//! let mm = MemoryManager::new(mmu, &[region], MemoryConfig::default());
//! let pm = ProcessMemory::new(&mm).unwrap();
//!
//! let va = vmm::map(&pm, None, 0x2000, Protection::READ | Protection::WRITE, Backing::Anonymous).unwrap();
//! pm.write_user(va, b"hi").unwrap();
//! vmm::unmap(&pm, va).unwrap();
//! ```

mod backing;
mod fault;
mod process;
mod segment;

pub use backing::{Backing, BackingError, BackingFile};
pub use fault::{
    AccessType, FaultHandler, FaultOutcome, Privilege, Scheduler, SchedulerFaultHandler,
    decode_x86_fault, install_fault_handler, on_page_fault, on_x86_page_fault,
};
pub use process::{PinnedPage, ProcessMemory};
pub use segment::SegmentInfo;

use crate::error::VmError;
use crate::frame_list::{FrameListFlags, FrameListRef};
use alloc::sync::Arc;
use bitflags::bitflags;
use kernel_memory_addresses::{PAGE_SIZE, PageNumber, VirtualAddress, pages_for};
use kernel_vmem::{Mmu, Protection};
use segment::{FileWindow, Segment};
use utils_accessors_derive::Setters;

bitflags! {
    /// Mapping flags.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        /// Writes stay private to this address space (copy-on-write on fork).
        const PRIVATE = 1 << 0;
        /// Writes are seen by every address space sharing the mapping.
        const SHARED  = 1 << 1;
        /// The address hint must be used as given.
        const FIXED   = 1 << 3;
        /// Owned by the creating thread and removed when it exits.
        const THREAD  = 1 << 4;
    }
}

/// Identifier the scheduler assigns to a thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Full parameter set of a mapping request.
#[derive(Debug, Clone, Setters)]
pub struct MapRequest {
    #[setters(strip_option)]
    hint: Option<VirtualAddress>,
    len: u64,
    protection: Protection,
    flags: MapFlags,
    #[setters(skip)]
    backing: Backing,
    #[setters(strip_option)]
    thread: Option<ThreadId>,
}

impl MapRequest {
    #[must_use]
    pub const fn new(len: u64, protection: Protection, backing: Backing) -> Self {
        Self {
            hint: None,
            len,
            protection,
            flags: MapFlags::empty(),
            backing,
            thread: None,
        }
    }
}

/// Map `len` bytes with default flags: private, placed at `hint` if given.
///
/// # Errors
/// See [`map_with`].
pub fn map<'m, M: Mmu>(
    pm: &ProcessMemory<'m, M>,
    hint: Option<VirtualAddress>,
    len: u64,
    protection: Protection,
    backing: Backing,
) -> Result<VirtualAddress, VmError> {
    let mut request = MapRequest::new(len, protection, backing).with_flags(MapFlags::PRIVATE);
    if let Some(hint) = hint {
        request.set_hint(hint);
    }
    map_with(pm, request)
}

/// Create a mapping and return its start address.
///
/// # Errors
/// - [`VmError::InvalidArgument`]: zero length, unknown protection bits,
///   both or neither of `PRIVATE`/`SHARED` on a file mapping, `THREAD`
///   without a thread, unaligned file offset, unaligned `FIXED` hint,
///   `FIXED` without a hint, or a hinted range outside the user window.
/// - [`VmError::PermissionDenied`]: shared writable mapping of a read-only
///   file.
/// - [`VmError::Collision`]: the hinted range overlaps a mapping.
/// - [`VmError::OutOfMemory`]: no frames, no page tables, or no free gap.
pub fn map_with<'m, M: Mmu>(
    pm: &ProcessMemory<'m, M>,
    request: MapRequest,
) -> Result<VirtualAddress, VmError> {
    let MapRequest {
        hint,
        len,
        protection,
        mut flags,
        backing,
        thread,
    } = request;

    if len == 0 || !Protection::all().contains(protection) {
        return Err(VmError::InvalidArgument);
    }
    let pages = pages_for(len);
    let protection = protection.normalized();

    match (flags.contains(MapFlags::PRIVATE), flags.contains(MapFlags::SHARED)) {
        (true, true) => return Err(VmError::InvalidArgument),
        (false, false) if backing.is_anonymous() => flags |= MapFlags::PRIVATE,
        (false, false) => return Err(VmError::InvalidArgument),
        _ => {}
    }
    let thread = if flags.contains(MapFlags::THREAD) {
        Some(thread.ok_or(VmError::InvalidArgument)?)
    } else {
        None
    };

    let file = match backing {
        Backing::Anonymous => None,
        Backing::File { file, offset } => {
            if offset % PAGE_SIZE != 0 {
                return Err(VmError::InvalidArgument);
            }
            if flags.contains(MapFlags::SHARED)
                && protection.contains(Protection::WRITE)
                && !file.writable()
            {
                return Err(VmError::PermissionDenied);
            }
            Some(FileWindow { file, offset })
        }
    };

    let cfg = pm.manager().config();
    let at = match hint {
        Some(hint) => {
            if flags.contains(MapFlags::FIXED) && !hint.is_page_aligned() {
                return Err(VmError::InvalidArgument);
            }
            let start = hint.align_down();
            let end = pages
                .checked_mul(PAGE_SIZE)
                .and_then(|bytes| start.checked_add(bytes))
                .ok_or(VmError::InvalidArgument)?;
            if !cfg.contains(start, end) {
                return Err(VmError::InvalidArgument);
            }
            Some(start.page())
        }
        None if flags.contains(MapFlags::FIXED) => return Err(VmError::InvalidArgument),
        None => {
            if pages > cfg.user_end.page() - cfg.placement_floor.page() {
                return Err(VmError::OutOfMemory);
            }
            None
        }
    };

    let count = usize::try_from(pages).map_err(|_| VmError::InvalidArgument)?;
    let list_flags = if flags.contains(MapFlags::SHARED) {
        FrameListFlags::SHARED
    } else {
        FrameListFlags::empty()
    };
    let frames = if file.is_some() {
        FrameListRef::demand(pm.manager(), count, list_flags)?
    } else {
        FrameListRef::allocate(pm.manager(), count, list_flags).inspect_err(|_| {
            log::warn!("map of {len:#x} bytes: out of memory");
        })?
    };

    let seg = Segment {
        start: PageNumber::new(0),
        pages,
        frames,
        first_slot: 0,
        protection,
        flags,
        file,
        thread,
    };
    let va = pm.add_mapping(at, seg)?;
    log::debug!("mapped {va} +{len:#x} {protection:?} {flags:?}");
    Ok(va)
}

/// Remove the mapping that starts at `addr`.
///
/// # Errors
/// [`VmError::NotMapped`] if no mapping starts there.
pub fn unmap<M: Mmu>(pm: &ProcessMemory<'_, M>, addr: VirtualAddress) -> Result<(), VmError> {
    pm.remove_segment(addr)
}

/// Remove every page in `[addr, addr + len)`.
///
/// # Errors
/// See [`ProcessMemory::unmap_range`].
pub fn unmap_range<M: Mmu>(
    pm: &ProcessMemory<'_, M>,
    addr: VirtualAddress,
    len: u64,
) -> Result<(), VmError> {
    pm.unmap_range(addr, len)
}

/// Change the protection of `[addr, addr + len)`.
///
/// # Errors
/// - [`VmError::InvalidArgument`]: unaligned address, zero length, or a
///   range outside the user window.
/// - [`VmError::NotMapped`]: some page in the range has no mapping.
/// - [`VmError::PermissionDenied`]: write access to a shared mapping of a
///   read-only file.
/// - [`VmError::OutOfMemory`]: a page table could not be allocated.
pub fn change_protection<M: Mmu>(
    pm: &ProcessMemory<'_, M>,
    addr: VirtualAddress,
    len: u64,
    protection: Protection,
) -> Result<(), VmError> {
    if !addr.is_page_aligned() || len == 0 || !Protection::all().contains(protection) {
        return Err(VmError::InvalidArgument);
    }
    let pages = pages_for(len);
    let end = pages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| addr.checked_add(bytes))
        .ok_or(VmError::InvalidArgument)?;
    if !pm.manager().config().contains(addr, end) {
        return Err(VmError::InvalidArgument);
    }
    pm.protect(addr.page(), pages, protection.normalized())
}

/// Duplicate an address space for a fork.
///
/// # Errors
/// [`VmError::OutOfMemory`].
pub fn fork_address_space<'m, M: Mmu>(
    pm: &ProcessMemory<'m, M>,
) -> Result<Arc<ProcessMemory<'m, M>>, VmError> {
    pm.duplicate()
}
