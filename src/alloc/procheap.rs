//! Per-{worker, size-class} heap front end (spec.md §3 "Procheap", §4.2).
//!
//! Each procheap owns one "active" superblock slot — a descriptor pointer
//! packed with the credits it was handed at installation time, CASed as a
//! single word so a racing freer can't hand the owning worker a stale
//! credit count — plus one "partial" descriptor slot and a queue of other
//! partially-full superblocks shared with every other worker using this
//! size class.

use crate::alloc::superblock::Descriptor;
use crate::queue::{MsQueue, QueueWorker};
use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// The active-superblock word: a descriptor pointer in the high bits and
/// residual credits in the low bits, packed so installation and
/// consumption race safely without a separate lock.
#[derive(Clone, Copy)]
struct ActiveWord(u64);

const CREDIT_BITS: u32 = 10;
const CREDIT_MASK: u64 = (1 << CREDIT_BITS) - 1;

impl ActiveWord {
    const NULL: ActiveWord = ActiveWord(0);

    fn pack(descriptor: *mut Descriptor, credits: u16) -> Self {
        debug_assert_eq!(descriptor as u64 & CREDIT_MASK, 0, "descriptor must be credit-aligned");
        ActiveWord((descriptor as u64) | (credits as u64 & CREDIT_MASK))
    }

    fn descriptor(self) -> *mut Descriptor {
        (self.0 & !CREDIT_MASK) as *mut Descriptor
    }

    fn credits(self) -> u16 {
        (self.0 & CREDIT_MASK) as u16
    }

    fn is_null(self) -> bool {
        self.0 == 0
    }
}

pub struct Procheap {
    active: AtomicU64,
    partial: AtomicCell<*mut Descriptor>,
    pub shared_partials: MsQueue<*mut Descriptor>,
    pub size_class: usize,
}

unsafe impl Send for Procheap {}
unsafe impl Sync for Procheap {}

impl Procheap {
    pub fn new(size_class: usize, shared_partials: MsQueue<*mut Descriptor>) -> Self {
        Self {
            active: AtomicU64::new(ActiveWord::NULL.0),
            partial: AtomicCell::new(std::ptr::null_mut()),
            shared_partials,
            size_class,
        }
    }

    fn load_active(&self) -> ActiveWord {
        ActiveWord(self.active.load(Ordering::Acquire))
    }

    /// §4.2 step 1: take one credit out of the active word without
    /// touching the descriptor's own anchor, so a fast-path allocation
    /// never needs a CAS against the anchor at all.
    pub fn try_take_active_credit(&self) -> Option<*mut Descriptor> {
        loop {
            let cur = self.load_active();
            if cur.is_null() || cur.credits() == 0 {
                return None;
            }
            let next = ActiveWord::pack(cur.descriptor(), cur.credits() - 1);
            if self
                .active
                .compare_exchange_weak(cur.0, next.0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(cur.descriptor());
            }
        }
    }

    /// Installs a freshly obtained descriptor as the new active
    /// superblock, returning the previously active one (if any) so the
    /// caller can demote it to partial/shared.
    pub fn install_active(&self, descriptor: *mut Descriptor, credits: u16) -> Option<*mut Descriptor> {
        let next = ActiveWord::pack(descriptor, credits);
        let prev = ActiveWord(self.active.swap(next.0, Ordering::AcqRel));
        if prev.is_null() {
            None
        } else {
            Some(prev.descriptor())
        }
    }

    /// §4.2 `heap_get_partial`: first this procheap's own partial slot,
    /// then the queue shared with the rest of the size class's workers.
    pub fn take_partial(&self, worker: &mut QueueWorker<*mut Descriptor>) -> Option<*mut Descriptor> {
        let own = self.partial.swap(std::ptr::null_mut());
        if !own.is_null() {
            return Some(own);
        }
        self.shared_partials.dequeue(worker)
    }

    /// Demotes a descriptor to partial status: try to keep it local first
    /// (cheapest for the common single-producer case), otherwise publish
    /// it to the shared queue for other workers to steal.
    pub fn give_partial(&self, descriptor: *mut Descriptor, worker: &mut QueueWorker<*mut Descriptor>) {
        let prev = self.partial.swap(descriptor);
        if !prev.is_null() {
            self.shared_partials.enqueue(worker, prev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_word_credit_decrements_until_exhausted() {
        let descriptor = 0x1000 as *mut Descriptor;
        let word = ActiveWord::pack(descriptor, 3);
        assert_eq!(word.descriptor(), descriptor);
        assert_eq!(word.credits(), 3);
    }

    #[test]
    fn take_active_credit_fails_on_null() {
        let queue = MsQueue::<*mut Descriptor>::new(8, 1);
        let heap = Procheap::new(0, queue);
        assert!(heap.try_take_active_credit().is_none());
    }

    #[test]
    fn install_then_take_credit_succeeds() {
        let queue = MsQueue::<*mut Descriptor>::new(8, 1);
        let heap = Procheap::new(0, queue);
        let descriptor = 0x2000 as *mut Descriptor;
        assert!(heap.install_active(descriptor, 4).is_none());
        let got = heap.try_take_active_credit();
        assert_eq!(got, Some(descriptor));
    }
}
