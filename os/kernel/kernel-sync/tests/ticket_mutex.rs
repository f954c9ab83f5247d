use kernel_sync::{SpinMutex, SyncOnceCell, TicketMutex};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn ticket_mutex_try_lock() {
    let m = TicketMutex::new(1_u32);
    let g = m.lock();
    assert!(m.try_lock().is_none());
    drop(g);
    assert!(m.try_lock().is_some());
}

#[test]
fn lock_irq_is_exclusive_across_threads() {
    let threads = 4;
    let iters = 1_000;
    let m = Arc::new(TicketMutex::new(Vec::with_capacity(threads * iters)));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let m = Arc::clone(&m);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..iters {
                    m.lock_irq().push((t, i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let log = m.lock();
    assert_eq!(log.len(), threads * iters);
    // each thread's entries appear in program order
    for t in 0..threads {
        let mine: Vec<_> = log.iter().filter(|(o, _)| *o == t).map(|(_, i)| *i).collect();
        assert!(mine.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn spin_mutex_get_mut() {
    let mut m = SpinMutex::new(0_u8);
    *m.get_mut() = 4;
    assert_eq!(*m.lock(), 4);
}

#[test]
fn once_cell_initializes_once() {
    static CELL: SyncOnceCell<u64> = SyncOnceCell::new();
    assert!(CELL.get().is_none());

    let handles: Vec<_> = (0..4_u64)
        .map(|i| thread::spawn(move || *CELL.get_or_init(|| 100 + i)))
        .collect();
    let seen: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let first = seen[0];
    assert!(seen.iter().all(|&v| v == first));
    assert_eq!(CELL.get(), Some(&first));
}
