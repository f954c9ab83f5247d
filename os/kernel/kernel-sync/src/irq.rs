//! Interrupt masking.
//!
//! On bare metal (`target_os = "none"`) the guard toggles the CPU's `IF`
//! flag with `cli`/`sti`. Hosted builds (unit tests, simulation) emulate the
//! flag with a process-wide depth counter so that code paths which disable
//! interrupts can be exercised without privilege.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::ops::{Deref, DerefMut};

/// A mutex guard that also disables interrupts while held.
///
/// When created via [`Mutex::lock_irq`], it:
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying mutex,
///
/// releasing them in reverse order on drop. Interrupt handlers (the page
/// fault path in particular) can then never spin on a lock that the code
/// they interrupted already holds.
///
/// # Examples
///
/// ```
/// use kernel_sync::TicketMutex;
///
/// let free_frames = TicketMutex::new(16_u64);
/// {
///     let mut g = free_frames.lock_irq();
///     *g -= 1;
///     assert!(!kernel_sync::irq::interrupts_enabled());
/// }
/// assert_eq!(*free_frames.lock(), 15);
/// ```
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    // Field order is drop order: unlock first, then restore interrupts.
    g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    ///
    /// Dropping the guard releases the mutex and restores interrupts if they
    /// were previously enabled.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        let g = self.lock();
        IrqMutex { g, _irq: irq }
    }
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.g
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.g
    }
}

#[cfg(target_os = "none")]
mod arch {
    /// Disables hardware interrupts (`cli`).
    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    /// Returns `RFLAGS.IF` (via `pushfq/pop`).
    #[inline]
    pub fn enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        (r & (1 << 9)) != 0
    }
}

#[cfg(not(target_os = "none"))]
mod arch {
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Number of live guards that disabled the emulated flag.
    static DISABLED: AtomicUsize = AtomicUsize::new(0);

    #[inline]
    pub fn disable() {
        DISABLED.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn enable() {
        DISABLED.fetch_sub(1, Ordering::AcqRel);
    }

    /// Always reports "enabled" to a fresh guard so that every guard pairs
    /// its `disable` with an `enable`.
    #[inline]
    pub fn enabled() -> bool {
        true
    }

    #[inline]
    pub fn any_disabled() -> bool {
        DISABLED.load(Ordering::Acquire) != 0
    }
}

/// Whether interrupts are currently enabled.
///
/// Hosted builds report `false` while any [`IrqGuard`] is alive.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(target_os = "none")]
    {
        arch::enabled()
    }
    #[cfg(not(target_os = "none"))]
    {
        !arch::any_disabled()
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were
/// previously enabled, so guards nest.
///
/// # Privilege
///
/// On bare metal this requires ring 0.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = arch::enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}
