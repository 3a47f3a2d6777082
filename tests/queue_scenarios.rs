//! Cross-thread producer/consumer coverage for the hazard-pointer queue
//! (spec.md §4.3, §8 scenario 2: "producer/consumer, 40,000 dequeues,
//! zero duplicates").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use substrate::queue::{MsQueue, QueueWorker};

#[test]
fn forty_thousand_items_no_duplicates_no_loss() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let workers = PRODUCERS + CONSUMERS;
    let queue = Arc::new(MsQueue::<usize>::new(TOTAL, workers));
    let consumed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(parking_lot::Mutex::new(vec![false; TOTAL]));

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let queue = queue.clone();
        handles.push(thread::spawn(move || {
            let mut w = QueueWorker::new(p);
            for i in 0..PER_PRODUCER {
                queue.enqueue(&mut w, p * PER_PRODUCER + i);
            }
        }));
    }
    for c in 0..CONSUMERS {
        let queue = queue.clone();
        let consumed = consumed.clone();
        let seen = seen.clone();
        handles.push(thread::spawn(move || {
            let mut w = QueueWorker::new(PRODUCERS + c);
            let mut idle_spins = 0;
            while consumed.load(Ordering::Relaxed) < TOTAL && idle_spins < 2_000_000 {
                match queue.dequeue(&mut w) {
                    Some(v) => {
                        let mut guard = seen.lock();
                        assert!(!guard[v], "value {v} dequeued twice");
                        guard[v] = true;
                        drop(guard);
                        consumed.fetch_add(1, Ordering::AcqRel);
                        idle_spins = 0;
                    }
                    None => idle_spins += 1,
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let guard = seen.lock();
    assert!(guard.iter().all(|&b| b), "every produced value must be consumed exactly once");
    assert_eq!(consumed.load(Ordering::Relaxed), TOTAL);
}
