//! Hazard-pointer reclamation for the lock-free queues (spec.md §4.3).
//! Two hazard slots per worker; a node is only freed once no worker's
//! hazard slot still publishes it.

use crossbeam_utils::atomic::AtomicCell;

pub const HAZARDS_PER_WORKER: usize = 2;

/// One registry instance per queue instance (threads / objects / blocks
/// each get their own, per spec.md §4.3's "three structurally identical
/// FIFOs").
pub struct HazardRegistry {
    slots: Vec<AtomicCell<*mut ()>>,
    workers: usize,
}

impl HazardRegistry {
    pub fn new(workers: usize) -> Self {
        let mut slots = Vec::with_capacity(workers * HAZARDS_PER_WORKER);
        for _ in 0..workers * HAZARDS_PER_WORKER {
            slots.push(AtomicCell::new(std::ptr::null_mut()));
        }
        Self { slots, workers }
    }

    #[inline]
    pub fn publish<T>(&self, worker: usize, slot: usize, ptr: *mut T) {
        debug_assert!(slot < HAZARDS_PER_WORKER);
        self.slots[worker * HAZARDS_PER_WORKER + slot].store(ptr as *mut ());
    }

    #[inline]
    pub fn clear(&self, worker: usize, slot: usize) {
        self.slots[worker * HAZARDS_PER_WORKER + slot].store(std::ptr::null_mut());
    }

    pub fn clear_all(&self, worker: usize) {
        for slot in 0..HAZARDS_PER_WORKER {
            self.clear(worker, slot);
        }
    }

    /// Snapshot every currently published hazard across all workers.
    pub fn snapshot(&self) -> Vec<*mut ()> {
        let mut out = Vec::with_capacity(self.workers * HAZARDS_PER_WORKER);
        for slot in &self.slots {
            let p = slot.load();
            if !p.is_null() {
                out.push(p);
            }
        }
        out
    }
}

unsafe impl Send for HazardRegistry {}
unsafe impl Sync for HazardRegistry {}

/// Per-worker retirement list. `rcount` ticks on every retire; at
/// `retire_threshold` the worker scans the registry and frees anything not
/// currently hazarded (spec.md §4.3 "Retirement").
pub struct RetireList<T> {
    pending: Vec<*mut T>,
}

impl<T> RetireList<T> {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn push(&mut self, node: *mut T) {
        self.pending.push(node);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drain nodes not present in `hazards`, freeing them; keep the rest
    /// for the next pass. Conservation: every node pushed here is either
    /// freed exactly once or retained, never both, never dropped silently.
    pub fn scan_and_free(&mut self, hazards: &[*mut ()], mut free: impl FnMut(*mut T)) {
        let mut kept = Vec::with_capacity(self.pending.len());
        for node in self.pending.drain(..) {
            if hazards.iter().any(|&h| h as *mut T == node) {
                kept.push(node);
            } else {
                free(node);
            }
        }
        self.pending = kept;
    }
}
