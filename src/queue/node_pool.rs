//! Static node pool backing a [`MsQueue`](super::MsQueue), sized to
//! `capacity + 2E^2 + 2E + 1` (spec.md §3, §4.3) and split into per-worker
//! private sub-pools plus a shared CAS stack that each worker rebalances
//! against to stay within `¾`..`1¼` of the even share.

use crossbeam_utils::atomic::AtomicCell;
use std::cell::UnsafeCell;

pub struct Node<T> {
    pub next: AtomicCell<*mut Node<T>>,
    pub value: UnsafeCell<Option<T>>,
    /// Free-list chain link, distinct from `next` (which is the queue's
    /// own link): a retired node is no longer reachable through the queue,
    /// so reusing a separate field keeps the two disciplines from
    /// colliding.
    pool_next: AtomicCell<isize>,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Self {
            next: AtomicCell::new(std::ptr::null_mut()),
            value: UnsafeCell::new(None),
            pool_next: AtomicCell::new(-1),
        }
    }
}

pub struct NodePool<T> {
    storage: Box<[Node<T>]>,
    shared_free: AtomicCell<isize>,
    even_share: usize,
}

/// Bounds a worker should try to keep its private sub-pool within,
/// per spec.md §3 ("≈ ¾ and 1¼ of the even share").
pub struct Bounds {
    pub low: usize,
    pub high: usize,
}

impl<T> NodePool<T> {
    pub fn new(capacity: usize, workers: usize) -> Self {
        let mut storage = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            storage.push(Node::empty());
        }
        let storage = storage.into_boxed_slice();
        // Chain every cell onto the shared free stack initially; workers
        // draw their private sub-pools from here on first use.
        for i in 0..capacity {
            let next = if i + 1 == capacity { -1 } else { (i + 1) as isize };
            storage[i].pool_next.store(next);
        }
        let shared_free = AtomicCell::new(if capacity == 0 { -1 } else { 0 });
        Self {
            storage,
            shared_free,
            even_share: if workers == 0 { capacity } else { capacity / workers },
        }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            low: self.even_share * 3 / 4,
            high: self.even_share * 5 / 4,
        }
    }

    pub fn node_ptr(&self, idx: usize) -> *mut Node<T> {
        &self.storage[idx] as *const Node<T> as *mut Node<T>
    }

    fn index_of(&self, ptr: *mut Node<T>) -> usize {
        let base = self.storage.as_ptr() as usize;
        (ptr as usize - base) / std::mem::size_of::<Node<T>>()
    }

    /// Pop one cell from the shared stack, or `None` if it's empty.
    pub fn take_shared(&self) -> Option<*mut Node<T>> {
        loop {
            let head = self.shared_free.load();
            if head < 0 {
                return None;
            }
            let next = self.storage[head as usize].pool_next.load();
            if self.shared_free.compare_exchange(head, next).is_ok() {
                return Some(self.node_ptr(head as usize));
            }
        }
    }

    /// Push one cell back onto the shared stack.
    pub fn give_shared(&self, node: *mut Node<T>) {
        let idx = self.index_of(node) as isize;
        loop {
            let head = self.shared_free.load();
            self.storage[idx as usize].pool_next.store(head);
            if self.shared_free.compare_exchange(head, idx).is_ok() {
                return;
            }
        }
    }
}

unsafe impl<T: Send> Send for NodePool<T> {}
unsafe impl<T: Send> Sync for NodePool<T> {}

/// Per-worker private sub-pool: a plain Vec of spare cells, rebalanced
/// against the pool's shared stack by [`super::MsQueue`] after every
/// enqueue/dequeue.
pub struct LocalSubPool<T> {
    free: Vec<*mut Node<T>>,
}

impl<T> LocalSubPool<T> {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn take(&mut self, pool: &NodePool<T>) -> *mut Node<T> {
        if let Some(n) = self.free.pop() {
            return n;
        }
        match pool.take_shared() {
            Some(n) => n,
            None => {
                // Fall back to whatever is left, caller treats null as
                // "pool exhausted" (should not happen if sized per spec).
                std::ptr::null_mut()
            }
        }
    }

    pub fn give(&mut self, node: *mut Node<T>) {
        self.free.push(node);
    }

    /// Push/pull against the shared stack to stay within `bounds`.
    pub fn rebalance(&mut self, pool: &NodePool<T>, bounds: &Bounds) {
        while self.free.len() > bounds.high {
            if let Some(n) = self.free.pop() {
                pool.give_shared(n);
            } else {
                break;
            }
        }
        while self.free.len() < bounds.low {
            match pool.take_shared() {
                Some(n) => self.free.push(n),
                None => break,
            }
        }
    }
}
