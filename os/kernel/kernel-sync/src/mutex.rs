use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// Data guarded by a raw lock word `R`.
pub struct Mutex<T, R> {
    raw: R,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes every access to `data`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
// SAFETY: moving the mutex moves `T`.
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw.raw_try_lock().then(|| MutexGuard { mutex: self })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_is_locked()
    }
}

impl<T: fmt::Debug, R: RawLock + RawUnlock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &*guard).finish(),
            None => f.write_str("Mutex { <locked> }"),
        }
    }
}

pub struct MutexGuard<'a, T, R: RawUnlock> {
    mutex: &'a Mutex<T, R>,
}

impl<T, R: RawUnlock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, R: RawUnlock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, R: RawUnlock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: a guard exists only while its lock is held.
        unsafe { self.mutex.raw.raw_unlock() }
    }
}

#[cfg(test)]
mod tests {
    use crate::{SpinMutex, TicketMutex};

    #[test]
    fn guards_release_on_drop() {
        let m = TicketMutex::new(vec![1_u32]);
        {
            let mut g = m.lock();
            g.push(2);
            assert!(m.is_locked());
            assert!(m.try_lock().is_none());
        }
        assert!(!m.is_locked());
        assert_eq!(m.into_inner(), [1, 2]);
    }

    #[test]
    fn debug_does_not_block() {
        let m = SpinMutex::new(7_u8);
        assert_eq!(format!("{m:?}"), "Mutex { data: 7 }");
        let _g = m.lock();
        assert_eq!(format!("{m:?}"), "Mutex { <locked> }");
    }
}
