//! # Page-Fault Entry
//!
//! The trap layer reports a fault through [`on_page_fault`] (or
//! [`on_x86_page_fault`] with the raw `CR2` and error code). Resolution is
//! delegated to the [`FaultHandler`] installed once at boot, normally a
//! [`SchedulerFaultHandler`] that forwards to the current address space.

use super::process::ProcessMemory;
use alloc::sync::Arc;
use core::marker::PhantomData;
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::cr2::Cr2;
use kernel_registers::page_fault::PageFaultErrorCode;
use kernel_sync::SyncOnceCell;
use kernel_vmem::Mmu;

/// How a fault ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The access can be retried.
    Resolved,
    /// No mapping covers the address (segmentation fault, map error).
    Unmapped,
    /// The mapping forbids the access (segmentation fault, access error).
    AccessViolation,
    OutOfMemory,
    /// The backing file could not be read.
    BusError,
}

impl FaultOutcome {
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// Receives every page fault.
pub trait FaultHandler: Sync {
    fn handle(&self, addr: VirtualAddress, access: AccessType, privilege: Privilege)
    -> FaultOutcome;
}

/// The scheduler's view the fault path needs.
pub trait Scheduler<'m, M: Mmu>: Send + Sync {
    /// Address space of the thread running on this CPU.
    fn current_address_space(&self) -> Option<Arc<ProcessMemory<'m, M>>>;
}

/// Forwards faults to the current address space.
pub struct SchedulerFaultHandler<'m, M: Mmu, S> {
    scheduler: S,
    _mm: PhantomData<fn() -> &'m M>,
}

impl<'m, M: Mmu, S: Scheduler<'m, M>> SchedulerFaultHandler<'m, M, S> {
    pub const fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            _mm: PhantomData,
        }
    }
}

impl<'m, M: Mmu, S: Scheduler<'m, M>> FaultHandler for SchedulerFaultHandler<'m, M, S> {
    fn handle(
        &self,
        addr: VirtualAddress,
        access: AccessType,
        privilege: Privilege,
    ) -> FaultOutcome {
        let Some(pm) = self.scheduler.current_address_space() else {
            log::error!("{access:?} fault at {addr} without an address space");
            return FaultOutcome::Unmapped;
        };
        pm.on_page_fault(addr, access, privilege)
    }
}

static HANDLER: SyncOnceCell<&'static dyn FaultHandler> = SyncOnceCell::new();

/// Install the system fault handler. Only the first call has an effect;
/// returns whether this call installed `handler`.
pub fn install_fault_handler(handler: &'static dyn FaultHandler) -> bool {
    HANDLER.set(handler).is_ok()
}

/// Resolve a page fault through the installed handler.
pub fn on_page_fault(addr: VirtualAddress, access: AccessType, privilege: Privilege) -> FaultOutcome {
    let Some(handler) = HANDLER.get() else {
        log::error!("{access:?} fault at {addr} before a fault handler was installed");
        return FaultOutcome::Unmapped;
    };
    let outcome = handler.handle(addr, access, privilege);
    log::trace!("{access:?} fault at {addr}: {outcome:?}");
    outcome
}

/// Decode the `#PF` error code into access type and privilege.
#[must_use]
pub const fn decode_x86_fault(code: PageFaultErrorCode) -> (AccessType, Privilege) {
    let access = if code.instruction_fetch() {
        AccessType::Execute
    } else if code.write() {
        AccessType::Write
    } else {
        AccessType::Read
    };
    let privilege = if code.user() {
        Privilege::User
    } else {
        Privilege::Kernel
    };
    (access, privilege)
}

/// `#PF` entry point for the x86-64 trap handler.
pub fn on_x86_page_fault(cr2: Cr2, code: PageFaultErrorCode) -> FaultOutcome {
    let (access, privilege) = decode_x86_fault(code);
    on_page_fault(cr2.address(), access, privilege)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_decode() {
        let code = PageFaultErrorCode::new().with_present(true).with_write(true).with_user(true);
        assert_eq!(decode_x86_fault(code), (AccessType::Write, Privilege::User));

        let code = PageFaultErrorCode::new().with_instruction_fetch(true).with_write(true);
        assert_eq!(decode_x86_fault(code), (AccessType::Execute, Privilege::Kernel));

        assert_eq!(
            decode_x86_fault(PageFaultErrorCode::new()),
            (AccessType::Read, Privilege::Kernel)
        );
    }

    #[test]
    fn outcome_predicate() {
        assert!(FaultOutcome::Resolved.is_resolved());
        assert!(!FaultOutcome::BusError.is_resolved());
    }
}
