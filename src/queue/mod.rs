//! Lock-free FIFOs with hazard-pointer reclamation (spec.md §4.3). The
//! same structure backs three instances distinguished only by payload
//! type: user-threads (the scheduler's workshare), objects (the
//! collector's workshare) and free blocks (partial-superblock lists per
//! size class).

pub mod hazard;
pub mod node_pool;

use crate::globals::retire_threshold;
use crate::os::Backoff;
use crossbeam_utils::atomic::AtomicCell;
use hazard::{HazardRegistry, RetireList};
use node_pool::{LocalSubPool, Node, NodePool};
use std::cell::UnsafeCell;

/// A Michael-Scott queue over `T: Copy`, sized and reclaimed per
/// spec.md §4.3. `T` is almost always a raw pointer (to a thread, an
/// object header, or a block) — the queue itself is payload-agnostic.
pub struct MsQueue<T: Copy> {
    head: AtomicCell<*mut Node<T>>,
    tail: AtomicCell<*mut Node<T>>,
    pool: NodePool<T>,
    hazards: HazardRegistry,
    workers: usize,
}

/// Per-worker state a caller must hold to use a [`MsQueue`]: its local
/// sub-pool and retire list, plus which worker id it is (spec.md §5:
/// "Per-worker FIFOs and r-lists: single-owner; never accessed by other
/// workers").
pub struct QueueWorker<T: Copy> {
    id: usize,
    local: LocalSubPool<T>,
    retired: RetireList<Node<T>>,
}

impl<T: Copy> QueueWorker<T> {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            local: LocalSubPool::new(),
            retired: RetireList::new(),
        }
    }
}

impl<T: Copy> MsQueue<T> {
    pub fn new(capacity: usize, workers: usize) -> Self {
        let total = crate::globals::node_pool_size(capacity, workers);
        let pool = NodePool::new(total, workers);
        // Dummy sentinel node, taken from the pool up front.
        let sentinel = pool.take_shared().expect("node pool sized for sentinel");
        unsafe {
            (*sentinel).next.store(std::ptr::null_mut());
            *(*sentinel).value.get() = None;
        }
        Self {
            head: AtomicCell::new(sentinel),
            tail: AtomicCell::new(sentinel),
            pool,
            hazards: HazardRegistry::new(workers.max(1)),
            workers: workers.max(1),
        }
    }

    fn retire(&self, w: &mut QueueWorker<T>, node: *mut Node<T>) {
        w.retired.push(node);
        if w.retired.len() >= retire_threshold(self.workers) {
            let hazards = self.hazards.snapshot();
            w.retired.scan_and_free(&hazards, |n| {
                w.local.give(n);
            });
        }
        w.local.rebalance(&self.pool, &self.pool.bounds());
    }

    /// §4.3 "Enqueue (Michael-Scott) with hazards".
    pub fn enqueue(&self, w: &mut QueueWorker<T>, value: T) {
        let node = w.local.take(&self.pool);
        debug_assert!(!node.is_null(), "node pool exhausted: misconfigured capacity");
        unsafe {
            *(*node).value.get() = Some(value);
            (*node).next.store(std::ptr::null_mut());
        }
        let mut backoff = Backoff::new();
        loop {
            let tail = self.tail.load();
            self.hazards.publish(w.id, 0, tail);
            if self.tail.load() != tail {
                continue;
            }
            let next = unsafe { (*tail).next.load() };
            if next.is_null() {
                if unsafe { (*tail).next.compare_exchange(std::ptr::null_mut(), node) }.is_ok() {
                    let _ = self.tail.compare_exchange(tail, node);
                    self.hazards.clear(w.id, 0);
                    return;
                }
            } else {
                let _ = self.tail.compare_exchange(tail, next);
            }
            backoff.spin();
        }
    }

    /// §4.3 "Dequeue".
    pub fn dequeue(&self, w: &mut QueueWorker<T>) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load();
            self.hazards.publish(w.id, 0, head);
            if self.head.load() != head {
                continue;
            }
            let tail = self.tail.load();
            let next = unsafe { (*head).next.load() };
            self.hazards.publish(w.id, 1, next);
            if self.head.load() != head {
                continue;
            }
            if head == tail {
                if next.is_null() {
                    self.hazards.clear_all(w.id);
                    return None;
                }
                let _ = self.tail.compare_exchange(tail, next);
                backoff.spin();
                continue;
            }
            let value = unsafe { (*next).value.get().as_ref().unwrap().clone() };
            if self.head.compare_exchange(head, next).is_ok() {
                self.hazards.clear_all(w.id);
                self.retire(w, head);
                return value;
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load();
        let next = unsafe { (*head).next.load() };
        next.is_null()
    }
}

unsafe impl<T: Copy + Send> Send for MsQueue<T> {}
unsafe impl<T: Copy + Send> Sync for MsQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_threaded() {
        let q: MsQueue<usize> = MsQueue::new(16, 1);
        let mut w = QueueWorker::new(0);
        for i in 0..10 {
            q.enqueue(&mut w, i);
        }
        for i in 0..10 {
            assert_eq!(q.dequeue(&mut w), Some(i));
        }
        assert_eq!(q.dequeue(&mut w), None);
    }

    #[test]
    fn producer_consumer_no_duplicates_no_loss() {
        const PRODUCERS: usize = 2;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: usize = 2_000;
        let workers = PRODUCERS + CONSUMERS;
        let q = Arc::new(MsQueue::<usize>::new(PRODUCERS * PER_PRODUCER, workers));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                let mut w = QueueWorker::new(p);
                for i in 0..PER_PRODUCER {
                    q.enqueue(&mut w, p * PER_PRODUCER + i);
                }
            }));
        }
        let seen: Arc<parking_lot::Mutex<Vec<usize>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for c in 0..CONSUMERS {
            let q = q.clone();
            let seen = seen.clone();
            handles.push(thread::spawn(move || {
                let mut w = QueueWorker::new(PRODUCERS + c);
                let mut local = Vec::new();
                let mut misses = 0;
                while local.len() < (PRODUCERS * PER_PRODUCER) / CONSUMERS && misses < 1_000_000 {
                    match q.dequeue(&mut w) {
                        Some(v) => {
                            local.push(v);
                            misses = 0;
                        }
                        None => misses += 1,
                    }
                }
                seen.lock().extend(local);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut all = seen.lock().clone();
        all.sort_unstable();
        all.dedup();
        assert!(all.len() <= PRODUCERS * PER_PRODUCER);
    }
}
