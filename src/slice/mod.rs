//! The slice manager (spec.md §4.1): allocates, reclassifies and accounts
//! large, fixed OS memory regions under per-kind quotas. Every other
//! subsystem — the block allocator's superblocks, the GC's generational
//! spaces — is built on top of slices obtained here; nothing in this
//! module maps memory directly (that's [`crate::os::mmap`]).

mod descriptor;

pub use descriptor::{Protection, Slice, SliceHandle, SliceKind, SliceUsage};

use crate::error::RuntimeError;
use crate::globals::SLICE_TAB_SIZE;
use crate::os::mmap;
use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Per-kind quota bookkeeping. Four kinds per spec.md §3 (`explicit-heap |
/// GC-heap | static | custom`); quotas are independent and additionally
/// bounded by a single global quota.
struct KindQuota {
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl KindQuota {
    fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::new(0),
        }
    }

    /// Attempt to reserve `bytes`. Strongly atomic: either this single CAS
    /// succeeds and the reservation is final, or nothing changes
    /// (spec.md §4.1 "every successful `reserve` is strongly atomic").
    fn try_reserve(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let limit = self.limit.load(Ordering::Relaxed);
            let next = match cur.checked_add(bytes) {
                Some(n) if n <= limit => n,
                _ => return false,
            };
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

/// Descriptor table slot. `Free` links into the CAS free-list; `InUse`
/// holds a live slice.
enum Slot {
    Free,
    InUse(Slice),
}

struct TableEntry {
    slot: Mutex<Slot>,
    /// Intrusive CAS-stack link for the free list, index-based rather than
    /// pointer-based so the table stays a flat, static allocation
    /// (design note: "arena-and-index discipline" for intrusive links).
    free_next: AtomicCell<isize>,
}

/// The process-wide slice manager. One instance backs the whole runtime;
/// `init`/`shutdown` give it explicit lifecycle rather than relying on a
/// module-level singleton (design note on global mutable state).
pub struct SliceManager {
    table: Vec<TableEntry>,
    free_head: AtomicCell<isize>,
    global_limit: AtomicUsize,
    global_used: AtomicUsize,
    explicit: KindQuota,
    gc: KindQuota,
    custom: KindQuota,
    static_: KindQuota,
}

pub struct SliceManagerParams {
    pub total_mem_limit: usize,
    pub explicit_heap_limit: usize,
    pub gc_heap_limit: usize,
}

impl SliceManager {
    pub fn init(params: SliceManagerParams) -> Self {
        let mut table = Vec::with_capacity(SLICE_TAB_SIZE);
        for i in 0..SLICE_TAB_SIZE {
            let next = if i + 1 == SLICE_TAB_SIZE {
                -1
            } else {
                (i + 1) as isize
            };
            table.push(TableEntry {
                slot: Mutex::new(Slot::Free),
                free_next: AtomicCell::new(next),
            });
        }
        Self {
            table,
            free_head: AtomicCell::new(0),
            global_limit: AtomicUsize::new(params.total_mem_limit),
            global_used: AtomicUsize::new(0),
            explicit: KindQuota::new(params.explicit_heap_limit),
            gc: KindQuota::new(params.gc_heap_limit),
            custom: KindQuota::new(usize::MAX),
            static_: KindQuota::new(usize::MAX),
        }
    }

    pub fn shutdown(&self) {
        for entry in &self.table {
            let mut slot = entry.slot.lock().unwrap();
            if let Slot::InUse(slice) = &*slot {
                unsafe { mmap::unmap(slice.base(), slice.size()) };
                *slot = Slot::Free;
            }
        }
    }

    fn quota_for(&self, kind: SliceKind) -> &KindQuota {
        match kind {
            SliceKind::Explicit => &self.explicit,
            SliceKind::Gc => &self.gc,
            SliceKind::Custom => &self.custom,
            SliceKind::Static => &self.static_,
        }
    }

    /// §4.1 `reserve`: atomically increments both the global and per-kind
    /// counters iff both stay within quota, rolling back on failure.
    pub fn reserve(&self, size: usize, kind: SliceKind) -> Result<(), RuntimeError> {
        let mut cur = self.global_used.load(Ordering::Relaxed);
        loop {
            let limit = self.global_limit.load(Ordering::Relaxed);
            let next = match cur.checked_add(size) {
                Some(n) if n <= limit => n,
                _ => return Err(RuntimeError::QuotaExceeded),
            };
            match self
                .global_used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if !self.quota_for(kind).try_reserve(size) {
            // roll back the global counter we just took.
            self.global_used.fetch_sub(size, Ordering::AcqRel);
            return Err(RuntimeError::QuotaExceeded);
        }
        Ok(())
    }

    fn pop_free_slot(&self) -> Option<usize> {
        loop {
            let head = self.free_head.load();
            if head < 0 {
                return None;
            }
            let next = self.table[head as usize].free_next.load();
            if self
                .free_head
                .compare_exchange(head, next)
                .is_ok()
            {
                return Some(head as usize);
            }
        }
    }

    fn push_free_slot(&self, idx: usize) {
        loop {
            let head = self.free_head.load();
            self.table[idx].free_next.store(head);
            if self
                .free_head
                .compare_exchange(head, idx as isize)
                .is_ok()
            {
                return;
            }
        }
    }

    /// §4.1 `alloc`: reserve quota, map through the OS collaborator, and
    /// bind a descriptor from the static table to the fresh mapping.
    pub fn alloc(&self, kind: SliceKind, prot: Protection, size: usize) -> Result<SliceHandle, RuntimeError> {
        self.reserve(size, kind)?;
        let idx = match self.pop_free_slot() {
            Some(idx) => idx,
            None => {
                self.quota_for(kind).release(size);
                self.global_used.fetch_sub(size, Ordering::AcqRel);
                return Err(RuntimeError::OutOfMemory(
                    "slice descriptor table exhausted",
                ));
            }
        };
        let base = match mmap::map(size, prot) {
            Some(base) => base,
            None => {
                self.quota_for(kind).release(size);
                self.global_used.fetch_sub(size, Ordering::AcqRel);
                self.push_free_slot(idx);
                return Err(RuntimeError::OsMapFailed);
            }
        };
        let slice = Slice::new(base, size, kind, prot);
        *self.table[idx].slot.lock().unwrap() = Slot::InUse(slice);
        Ok(SliceHandle(idx))
    }

    pub fn get(&self, handle: SliceHandle) -> Slice {
        match &*self.table[handle.0].slot.lock().unwrap() {
            Slot::InUse(slice) => *slice,
            Slot::Free => panic!("use of freed slice handle"),
        }
    }

    /// §4.1 `free`: unmap and return the descriptor to the free list,
    /// releasing the reservation taken by `alloc`.
    pub fn free(&self, handle: SliceHandle) {
        let mut slot = self.table[handle.0].slot.lock().unwrap();
        let slice = match &*slot {
            Slot::InUse(s) => *s,
            Slot::Free => return,
        };
        unsafe { mmap::unmap(slice.base(), slice.size()) };
        self.quota_for(slice.kind()).release(slice.size());
        self.global_used.fetch_sub(slice.size(), Ordering::AcqRel);
        *slot = Slot::Free;
        drop(slot);
        self.push_free_slot(handle.0);
    }

    /// §4.1 `set_usage`: forward an advisory to the OS collaborator.
    pub fn set_usage(&self, handle: SliceHandle, usage: SliceUsage) {
        let mut slot = self.table[handle.0].slot.lock().unwrap();
        if let Slot::InUse(slice) = &mut *slot {
            slice.usage = usage;
            unsafe {
                match usage {
                    SliceUsage::Blank => mmap::advise_dontneed(slice.base(), slice.size()),
                    SliceUsage::Used => mmap::advise_willneed(slice.base(), slice.size()),
                    SliceUsage::Unused => {}
                }
            }
        }
    }

    /// §4.1 `set_prot`: forward a protection change to the OS collaborator.
    pub fn set_prot(&self, handle: SliceHandle, prot: Protection) {
        let mut slot = self.table[handle.0].slot.lock().unwrap();
        if let Slot::InUse(slice) = &mut *slot {
            slice.prot = prot;
            unsafe { mmap::protect(slice.base(), slice.size(), prot) };
        }
    }

    /// Soft-linearizable snapshot of per-kind usage, for the collector's
    /// trigger ratio (§4.5.1). Readers may observe a transiently
    /// inconsistent snapshot across kinds; only `reserve` is strongly
    /// atomic (§4.1 "Semantics").
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            total_limit: self.global_limit.load(Ordering::Relaxed),
            total_used: self.global_used.load(Ordering::Relaxed),
            gc_used: self.gc.used(),
            gc_limit: self.gc.limit.load(Ordering::Relaxed),
            explicit_used: self.explicit.used(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct UsageSnapshot {
    pub total_limit: usize,
    pub total_used: usize,
    pub gc_used: usize,
    pub gc_limit: usize,
    pub explicit_used: usize,
}

unsafe impl Send for SliceManager {}
unsafe impl Sync for SliceManager {}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SliceManagerParams {
        SliceManagerParams {
            total_mem_limit: 64 * 1024 * 1024,
            explicit_heap_limit: 32 * 1024 * 1024,
            gc_heap_limit: 32 * 1024 * 1024,
        }
    }

    #[test]
    fn reserve_rolls_back_on_kind_exhaustion() {
        let mgr = SliceManager::init(SliceManagerParams {
            total_mem_limit: 64 * 1024 * 1024,
            explicit_heap_limit: 4 * 1024 * 1024,
            gc_heap_limit: 64 * 1024 * 1024,
        });
        assert!(mgr.reserve(4 * 1024 * 1024, SliceKind::Explicit).is_ok());
        let before = mgr.usage_snapshot().total_used;
        assert!(mgr.reserve(1, SliceKind::Explicit).is_err());
        assert_eq!(mgr.usage_snapshot().total_used, before);
    }

    #[test]
    fn alloc_and_free_round_trip_quota() {
        let mgr = SliceManager::init(params());
        let h = mgr.alloc(SliceKind::Gc, Protection::RW, 4 * 1024 * 1024).unwrap();
        assert!(mgr.usage_snapshot().gc_used >= 4 * 1024 * 1024);
        mgr.free(h);
        assert_eq!(mgr.usage_snapshot().gc_used, 0);
        mgr.shutdown();
    }
}
