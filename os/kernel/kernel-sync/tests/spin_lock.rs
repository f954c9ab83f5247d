use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let frames = SpinLock::new(Vec::<u64>::new());

    {
        let mut g = frames.lock();
        g.push(0x100);
    }

    // the previous guard must have unlocked
    let mut g = frames.lock();
    g.push(0x101);
    assert_eq!(g.as_slice(), &[0x100, 0x101]);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(3u8);

    let held = l.try_lock().expect("uncontended try_lock");
    assert!(l.try_lock().is_none());

    drop(held);
    assert_eq!(l.try_lock().map(|g| *g), Some(3));
}

#[test]
fn with_lock_returns_closure_value() {
    let segments = SpinLock::new(vec![(0x20_0000_u64, 4_u64)]);
    let pages = segments.with_lock(|s| {
        s.push((0x40_0000, 2));
        s.iter().map(|(_, n)| n).sum::<u64>()
    });
    assert_eq!(pages, 6);
    assert_eq!(segments.with_lock(|s| s.len()), 2);
}

#[test]
fn get_mut_bypasses_locking() {
    let mut l = SpinLock::new(0_u32);
    *l.get_mut() = 9;
    assert_eq!(*l.lock(), 9);
}

#[test]
fn contended_refcount_is_exact() {
    let threads = 8;
    let iters = 2_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn panic_inside_critical_section_unlocks() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 5;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 5);
}

#[test]
fn default_and_into_inner() {
    let l: SpinLock<Vec<u64>> = SpinLock::default();
    assert!(!l.is_locked());
    {
        let mut g = l.lock();
        assert!(l.is_locked());
        g.push(0x200);
    }
    assert_eq!(l.into_inner(), [0x200]);
}
