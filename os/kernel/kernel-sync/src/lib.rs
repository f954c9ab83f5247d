//! # Kernel synchronization primitives
//!
//! Spin-based locks for a kernel without a scheduler to park on:
//!
//! * [`SpinLock`]: the common case, a [`RawSpin`] word next to its data.
//! * [`Mutex<T, R>`](Mutex): a lock generic over its raw strategy,
//!   [`RawSpin`] or [`RawTicket`] (FIFO fair). [`Mutex::lock_irq`] also
//!   disables interrupts while held.
//! * [`SyncOnceCell`]: one-shot initialization for globals such as the
//!   page-fault handler.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

/// Acquire side of a raw lock word.
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    /// Racy snapshot, for assertions and diagnostics only.
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
