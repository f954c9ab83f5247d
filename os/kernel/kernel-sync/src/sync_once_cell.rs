use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;

/// Write-once cell for kernel globals.
///
/// Readers never block once the value is published. A second writer either
/// gets its value back ([`set`](Self::set)) or waits for the first to finish
/// ([`get_or_init`](Self::get_or_init)).
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    slot: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the slot is written once before FULL is published and only read after.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
// SAFETY: owning the cell owns the value.
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        (self.state.load(Ordering::Acquire) == FULL).then(|| {
            // SAFETY: FULL is stored only after the slot is written.
            unsafe { (*self.slot.get()).assume_init_ref() }
        })
    }

    /// Publish `value` unless the cell is already taken.
    ///
    /// # Errors
    /// Returns `value` back if another writer got there first.
    pub fn set(&self, value: T) -> Result<(), T> {
        if !self.claim() {
            return Err(value);
        }
        self.publish(value);
        Ok(())
    }

    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }
        if self.claim() {
            self.publish(init());
        }
        self.wait()
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn publish(&self, value: T) {
        // SAFETY: only the claimant reaches here, and readers wait for FULL.
        unsafe { (*self.slot.get()).write(value) };
        self.state.store(FULL, Ordering::Release);
    }

    fn wait(&self) -> &T {
        loop {
            if let Some(v) = self.get() {
                return v;
            }
            spin_loop();
        }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == FULL {
            // SAFETY: FULL means the slot holds a value nobody else can see now.
            unsafe { self.slot.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SyncOnceCell;
    use std::sync::Arc;

    #[test]
    fn second_set_is_refused() {
        let cell = SyncOnceCell::new();
        assert_eq!(cell.set(1_u32), Ok(()));
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get_or_init(|| 3), &1);
    }

    #[test]
    fn drop_releases_the_value() {
        let value = Arc::new(());
        {
            let cell = SyncOnceCell::new();
            assert!(cell.set(Arc::clone(&value)).is_ok());
            assert_eq!(Arc::strong_count(&value), 2);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
