//! Superblock descriptors and the active-superblock word a procheap CASes
//! against (spec.md §3 "Superblock", §4.2).

use crate::alloc::anchor::{Anchor, AtomicAnchor, SuperblockState};
use crate::slice::SliceHandle;
use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Every allocated block is prefixed by a cache line holding a pointer
/// back to its descriptor (or, for oversize allocations, a tag), so
/// `free` never needs a separate lookup table (spec.md §4.2).
#[repr(C, align(16))]
pub struct BlockPrefix {
    pub descriptor: AtomicUsize,
}

pub const OVERSIZE_TAG: usize = 1;

impl BlockPrefix {
    #[inline]
    pub fn is_oversize(&self) -> bool {
        self.descriptor.load(Ordering::Relaxed) & OVERSIZE_TAG != 0
    }
}

/// A superblock's descriptor: the anchor plus the bookkeeping needed to
/// free blocks back to it and to retire it once empty.
pub struct Descriptor {
    pub anchor: AtomicAnchor,
    pub base: *mut u8,
    pub block_size: usize,
    pub superblock_size: usize,
    pub max_count: u32,
    pub size_class: usize,
    /// Owning procheap, used when a FULL->PARTIAL transition needs to
    /// enqueue this descriptor onto the procheap's own partial slot
    /// before falling back to the shared queue (spec.md §4.2 "Free").
    pub owner_procheap: AtomicUsize,
    /// Slice this superblock's storage is carved from, so retiring an
    /// EMPTY descriptor knows what to hand back to the slice manager.
    pub slice: SliceHandle,
    /// Free-list link for the global descriptor free-list / partial
    /// queues — pointer-based since descriptors, unlike queue nodes, are
    /// never concurrently reclaimed out from under a hazard (they only
    /// move between PARTIAL/EMPTY/ACTIVE states, never freed to the OS
    /// individually).
    pub next: AtomicCell<*mut Descriptor>,
}

unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

impl Descriptor {
    pub fn block_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.base.add(index as usize * self.block_size) }
    }

    fn prefix_of(&self, block: *mut u8) -> &BlockPrefix {
        unsafe { &*(block as *const BlockPrefix) }
    }

    pub fn payload_of(&self, block: *mut u8) -> *mut u8 {
        unsafe { block.add(std::mem::size_of::<BlockPrefix>()) }
    }

    /// Install this descriptor's address into every block's prefix word
    /// up front, at superblock construction time.
    pub fn stamp_prefixes(&self) {
        for i in 0..self.max_count {
            let prefix = self.prefix_of(self.block_ptr(i));
            prefix.descriptor.store(self as *const _ as usize, Ordering::Relaxed);
        }
    }

    /// §4.2 allocation step 1: reserve one credit from the anchor and pop
    /// the block-list head. Returns the payload pointer on success.
    pub fn reserve_block(&self) -> Option<*mut u8> {
        let cur = self.anchor.load();
        if cur.state() != SuperblockState::Active || cur.credits() == 0 {
            return None;
        }
        let block_idx = cur.avail();
        let block = self.block_ptr(block_idx as u32);
        let next_avail = self.read_next_free(block);
        let updated = self.anchor.try_update(cur, |a| {
            let credits_left = a.credits().checked_sub(1)?;
            let new_state = if credits_left == 0 {
                SuperblockState::Full
            } else {
                SuperblockState::Active
            };
            Some(
                a.with_avail(next_avail)
                    .with_credits(credits_left)
                    .with_state(new_state),
            )
        })?;
        let _ = updated;
        Some(self.payload_of(block))
    }

    /// §4.2 `heap_get_partial`/refill: flip a PARTIAL descriptor's anchor
    /// state back toward ACTIVE.
    pub fn reactivate_from_partial(&self) -> bool {
        let cur = self.anchor.load();
        self.anchor
            .try_update(cur, |a| {
                if a.state() == SuperblockState::Partial {
                    Some(a.with_state(SuperblockState::Active))
                } else {
                    None
                }
            })
            .is_some()
    }

    /// Reads the free-list `next` index stored in the first word of a
    /// free block's payload (the free-list chain lives inside blocks that
    /// are, by definition, not holding live data).
    fn read_next_free(&self, block: *mut u8) -> u16 {
        unsafe {
            let payload = self.payload_of(block) as *const u16;
            if self.anchor.load().avail() == 0 {
                0
            } else {
                *payload
            }
        }
    }

    fn write_next_free(&self, block: *mut u8, next: u16) {
        unsafe {
            let payload = self.payload_of(block) as *mut u16;
            *payload = next;
        }
    }

    /// §4.2 `free`: CAS the block back onto the anchor's avail list,
    /// incrementing credits. Returns the resulting state so the caller
    /// can react to FULL->PARTIAL / PARTIAL->EMPTY transitions.
    pub fn free_block(&self, block: *mut u8) -> (SuperblockState, SuperblockState) {
        let block_index = self.index_of(block);
        let before = self.anchor.load();
        let new = self
            .anchor
            .try_update(before, |a| {
                self.write_next_free(self.block_ptr(block_index), a.avail());
                let new_state = match a.state() {
                    SuperblockState::Full => SuperblockState::Partial,
                    SuperblockState::Active if a.credits() as u32 + 1 == self.max_count => {
                        SuperblockState::Empty
                    }
                    SuperblockState::Partial if a.credits() as u32 + 1 == self.max_count => {
                        SuperblockState::Empty
                    }
                    other => other,
                };
                Some(
                    a.with_avail(block_index)
                        .with_credits(a.credits() + 1)
                        .with_state(new_state),
                )
            })
            .expect("free CAS never rejected by the predicate");
        (before.state(), new.state())
    }

    fn index_of(&self, block: *mut u8) -> u16 {
        ((block as usize - self.base as usize) / self.block_size) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::anchor::SuperblockState;

    fn make_descriptor(max_count: u32, block_size: usize) -> (Vec<u8>, Descriptor) {
        let superblock_size = max_count as usize * block_size;
        let mut backing = vec![0u8; superblock_size];
        let base = backing.as_mut_ptr();
        let anchor = AtomicAnchor::new(
            Anchor::new()
                .with_avail(0)
                .with_credits(max_count as u16)
                .with_state(SuperblockState::Active)
                .with_tag(0),
        );
        let desc = Descriptor {
            anchor,
            base,
            block_size,
            superblock_size,
            max_count,
            size_class: 0,
            owner_procheap: AtomicUsize::new(0),
            slice: SliceHandle(0),
            next: AtomicCell::new(std::ptr::null_mut()),
        };
        for i in 0..max_count {
            desc.write_next_free(desc.block_ptr(i), (i + 1) as u16);
        }
        (backing, desc)
    }

    #[test]
    fn reserve_then_free_round_trips_state() {
        let (_backing, desc) = make_descriptor(4, 64);
        let a = desc.reserve_block().unwrap();
        let b = desc.reserve_block().unwrap();
        assert_ne!(a, b);
        assert_eq!(desc.anchor.load().credits(), 2);
        let (before, after) = desc.free_block(a);
        assert_eq!(before, SuperblockState::Active);
        assert_eq!(after, SuperblockState::Active);
        assert_eq!(desc.anchor.load().credits(), 3);
    }

    #[test]
    fn exhausting_credits_transitions_to_full() {
        let (_backing, desc) = make_descriptor(1, 64);
        desc.reserve_block().unwrap();
        assert_eq!(desc.anchor.load().state(), SuperblockState::Full);
        assert!(desc.reserve_block().is_none());
    }

    #[test]
    fn freeing_every_block_of_a_partial_superblock_reaches_empty() {
        let (_backing, desc) = make_descriptor(4, 64);
        let blocks: Vec<_> = (0..4).map(|_| desc.reserve_block().unwrap()).collect();
        assert_eq!(desc.anchor.load().state(), SuperblockState::Full);

        let (before, after) = desc.free_block(blocks[0]);
        assert_eq!((before, after), (SuperblockState::Full, SuperblockState::Partial));

        let (before, after) = desc.free_block(blocks[1]);
        assert_eq!((before, after), (SuperblockState::Partial, SuperblockState::Partial));

        let (before, after) = desc.free_block(blocks[2]);
        assert_eq!((before, after), (SuperblockState::Partial, SuperblockState::Partial));

        let (before, after) = desc.free_block(blocks[3]);
        assert_eq!((before, after), (SuperblockState::Partial, SuperblockState::Empty));
    }
}
