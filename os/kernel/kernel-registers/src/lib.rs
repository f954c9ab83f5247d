//! # Typed `X86_64` Registers
//!
//! The registers the memory manager touches: [`Cr2`](cr2::Cr2) (faulting
//! address), [`Cr3`](cr3::Cr3) (page-table root) and the page-fault
//! [error code](page_fault::PageFaultErrorCode) pushed by the CPU.
//!
//! Reading and writing the control registers requires the `asm` feature and
//! ring 0; the bitfield layouts themselves are usable anywhere.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr2;
pub mod cr3;
pub mod page_fault;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// # Safety
    /// It is generally safe to load this register even from user mode.
    fn load() -> Self;
}

pub trait StoreRegister {
    /// # Safety
    /// It is generally safe to store this register even from user mode.
    fn store(self);
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}

impl<T> StoreRegisterUnsafe for T
where
    T: StoreRegister,
{
    #[inline]
    unsafe fn store_unsafe(self) {
        <Self as StoreRegister>::store(self);
    }
}
