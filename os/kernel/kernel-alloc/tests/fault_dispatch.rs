//! The fault handler is process global, so this file holds a single test.

mod common;

use common::{MemFile, RO, manager, va};
use kernel_alloc::MemoryManager;
use kernel_alloc::sim::SimMmu;
use kernel_alloc::vmm::{
    self, AccessType, Backing, FaultHandler, FaultOutcome, Privilege, ProcessMemory, Scheduler,
    SchedulerFaultHandler, install_fault_handler, on_page_fault, on_x86_page_fault,
};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_registers::cr2::Cr2;
use kernel_registers::page_fault::PageFaultErrorCode;
use std::sync::{Arc, Mutex};

type Space = Arc<ProcessMemory<'static, SimMmu>>;

static CURRENT: Mutex<Option<Space>> = Mutex::new(None);

struct Current;

impl Scheduler<'static, SimMmu> for Current {
    fn current_address_space(&self) -> Option<Space> {
        CURRENT.lock().unwrap().clone()
    }
}

#[test]
fn faults_reach_the_current_address_space() {
    let user_read = PageFaultErrorCode::new().with_user(true);
    assert_eq!(
        on_page_fault(va(0x40_0000), AccessType::Read, Privilege::User),
        FaultOutcome::Unmapped
    );

    let handler: SchedulerFaultHandler<'static, SimMmu, Current> =
        SchedulerFaultHandler::new(Current);
    let handler: &'static dyn FaultHandler = Box::leak(Box::new(handler));
    assert!(install_fault_handler(handler));
    assert!(!install_fault_handler(handler));

    // No thread is running yet.
    assert_eq!(
        on_x86_page_fault(Cr2::from_bits(0x40_0000), user_read),
        FaultOutcome::Unmapped
    );

    let mm: &'static MemoryManager<SimMmu> = Box::leak(Box::new(manager(64)));
    let pm = ProcessMemory::new(mm).unwrap();
    let file = Arc::new(MemFile::new(vec![0x5A; 4096]));
    let at = vmm::map(&pm, None, 2 * PAGE_SIZE, RO, Backing::file(file.clone(), 0)).unwrap();
    *CURRENT.lock().unwrap() = Some(Arc::clone(&pm));

    assert_eq!(
        on_x86_page_fault(Cr2::from_bits(at.as_u64() + 0x123), user_read),
        FaultOutcome::Resolved
    );
    assert_eq!(file.reads(), 1);
    assert!(pm.page_entry(at).present());
    let mut buf = [0_u8; 2];
    pm.read_user(at, &mut buf).unwrap();
    assert_eq!(buf, [0x5A; 2]);

    // Spurious: the page is already there.
    assert_eq!(
        on_page_fault(at, AccessType::Read, Privilege::User),
        FaultOutcome::Resolved
    );
    assert_eq!(file.reads(), 1);

    assert_eq!(
        on_x86_page_fault(
            Cr2::from_bits(at.as_u64()),
            user_read.with_present(true).with_write(true)
        ),
        FaultOutcome::AccessViolation
    );
    assert_eq!(
        on_x86_page_fault(
            Cr2::from_bits(at.as_u64() + PAGE_SIZE),
            user_read.with_instruction_fetch(true)
        ),
        FaultOutcome::AccessViolation
    );
    assert_eq!(
        on_page_fault(va(0xFFFF_8000_0000_0000), AccessType::Read, Privilege::Kernel),
        FaultOutcome::Unmapped
    );
    assert_eq!(
        on_page_fault(va(0x40_0000), AccessType::Write, Privilege::User),
        FaultOutcome::Unmapped
    );

    CURRENT.lock().unwrap().take();
    assert_eq!(Arc::strong_count(&pm), 1);
}
