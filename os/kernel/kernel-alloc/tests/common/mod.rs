#![allow(dead_code)]

use kernel_alloc::sim::SimMmu;
use kernel_alloc::vmm::{BackingError, BackingFile};
use kernel_alloc::{MemoryConfig, MemoryManager};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_vmem::Protection;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const RW: Protection = Protection::READ.union(Protection::WRITE);
pub const RO: Protection = Protection::READ;

pub fn manager(frames: usize) -> MemoryManager<SimMmu> {
    let mmu = SimMmu::new(FrameNumber::new(0x400), frames);
    let region = mmu.region();
    MemoryManager::new(mmu, &[region], MemoryConfig::default())
}

pub const fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

/// In-memory file; counts reads and can be told to fail.
pub struct MemFile {
    pub data: Vec<u8>,
    pub writable: bool,
    pub fail: bool,
    reads: AtomicUsize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: false,
            fail: false,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl BackingFile for MemFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BackingError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err(BackingError::Io("medium error"));
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn writable(&self) -> bool {
        self.writable
    }
}
