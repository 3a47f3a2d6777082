//! The lock-free block allocator (spec.md §4.2): a per-worker,
//! per-size-class front end over superblocks carved from slices obtained
//! through [`crate::slice::SliceManager`].

pub mod anchor;
pub mod procheap;
pub mod size_class;
pub mod superblock;

use crate::error::{abort_on_invariant_violation, RuntimeError};
use crate::globals::{DESCRIPTOR_ARENA_SIZE, MAX_SIZE_CLASS_BYTES};
use crate::queue::{MsQueue, QueueWorker};
use crate::slice::{Protection, SliceHandle, SliceKind, SliceManager};
use anchor::{Anchor, AtomicAnchor, SuperblockState};
use crossbeam_utils::atomic::AtomicCell;
use procheap::Procheap;
use size_class::SizeClassTable;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use superblock::{BlockPrefix, Descriptor, OVERSIZE_TAG};

/// Oversize allocations (>= the top size class) bypass superblocks
/// entirely: one slice per allocation, tagged in its own prefix word so
/// `free` can tell the two paths apart (spec.md §4.2 "Requests larger
/// than the top class").
struct OversizeHeader {
    prefix: BlockPrefix,
    slice: SliceHandle,
}

/// Global free-list of descriptor cells (§4.2 "a global free-list of
/// descriptors"): a CAS stack threaded through `Descriptor::next`, backed
/// by slices carved into fixed-size, credit-aligned cells and replenished
/// on demand. A descriptor never moves between cells; once carved, a cell
/// is reused in place for the lifetime of the allocator.
struct DescriptorArena {
    free_head: AtomicCell<*mut Descriptor>,
    /// Slices backing carved cells. Never freed individually — only
    /// whole superblocks are retired; the arena itself just grows.
    backing: parking_lot::Mutex<Vec<SliceHandle>>,
}

/// Credit-aligned stride for one descriptor cell: `ActiveWord` packs a
/// descriptor pointer into its high bits alongside a 10-bit credit count,
/// so every cell must start on a `CREDIT_ALIGN`-byte boundary.
const CREDIT_ALIGN: usize = 1024;

fn cell_stride() -> usize {
    (std::mem::size_of::<Descriptor>() + CREDIT_ALIGN - 1) & !(CREDIT_ALIGN - 1)
}

impl DescriptorArena {
    fn new() -> Self {
        Self {
            free_head: AtomicCell::new(std::ptr::null_mut()),
            backing: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn push(&self, cell: *mut Descriptor) {
        loop {
            let head = self.free_head.load();
            unsafe { (*cell).next.store(head) };
            if self.free_head.compare_exchange(head, cell).is_ok() {
                return;
            }
        }
    }

    /// Pop a free cell, carving a fresh slice into `DESCRIPTOR_ARENA_SIZE`
    /// cells if the list is empty.
    fn pop(&self, slices: &SliceManager) -> Result<*mut Descriptor, RuntimeError> {
        loop {
            let head = self.free_head.load();
            if !head.is_null() {
                let next = unsafe { (*head).next.load() };
                if self.free_head.compare_exchange(head, next).is_ok() {
                    return Ok(head);
                }
                continue;
            }
            self.replenish(slices)?;
        }
    }

    fn replenish(&self, slices: &SliceManager) -> Result<(), RuntimeError> {
        let stride = cell_stride();
        let handle = slices.alloc(SliceKind::Gc, Protection::RW, stride * DESCRIPTOR_ARENA_SIZE)?;
        let base = slices.get(handle).base();
        for i in 0..DESCRIPTOR_ARENA_SIZE {
            let cell = unsafe { base.add(i * stride) as *mut Descriptor };
            let empty = Descriptor {
                anchor: AtomicAnchor::new(Anchor::new().with_state(SuperblockState::Empty)),
                base: std::ptr::null_mut(),
                block_size: 0,
                superblock_size: 0,
                max_count: 0,
                size_class: 0,
                owner_procheap: AtomicUsize::new(0),
                slice: SliceHandle(0),
                next: AtomicCell::new(std::ptr::null_mut()),
            };
            unsafe { std::ptr::write(cell, empty) };
            self.push(cell);
        }
        self.backing.lock().push(handle);
        Ok(())
    }
}

unsafe impl Send for DescriptorArena {}
unsafe impl Sync for DescriptorArena {}

pub struct BlockAllocator {
    classes: SizeClassTable,
    slices: Arc<SliceManager>,
    procheaps: Vec<Vec<Procheap>>,
    arena: DescriptorArena,
    workers: usize,
}

pub struct BlockAllocatorWorker {
    id: usize,
    partial_workers: Vec<QueueWorker<*mut Descriptor>>,
}

impl BlockAllocatorWorker {
    pub fn new(id: usize, num_classes: usize) -> Self {
        Self {
            id,
            partial_workers: (0..num_classes).map(|_| QueueWorker::new(id)).collect(),
        }
    }
}

impl BlockAllocator {
    pub fn new(slices: Arc<SliceManager>, workers: usize) -> Self {
        let classes = SizeClassTable::build();
        let mut procheaps = Vec::with_capacity(workers);
        for _ in 0..workers {
            let mut per_class = Vec::with_capacity(classes.len());
            for class_idx in 0..classes.len() {
                let shared = MsQueue::new(64, workers);
                per_class.push(Procheap::new(class_idx, shared));
            }
            procheaps.push(per_class);
        }
        Self {
            classes,
            slices,
            procheaps,
            arena: DescriptorArena::new(),
            workers,
        }
    }

    /// Map a fresh slice and carve it into one superblock, reusing a
    /// retired descriptor cell from the arena (§4.2 "the only thing that
    /// changes between a descriptor's lives is what superblock it
    /// describes").
    fn fresh_superblock(&self, class_idx: usize) -> Result<*mut Descriptor, RuntimeError> {
        let class = self.classes.get(class_idx);
        let handle = self
            .slices
            .alloc(SliceKind::Gc, Protection::RW, class.superblock_size)?;
        let slice = self.slices.get(handle);
        let block_stride = class.block_size + std::mem::size_of::<BlockPrefix>();
        let max_count = (class.superblock_size / block_stride).max(1) as u32;
        let anchor = AtomicAnchor::new(
            Anchor::new()
                .with_avail(0)
                .with_credits(max_count as u16)
                .with_state(SuperblockState::Active)
                .with_tag(0),
        );
        let descriptor = match self.arena.pop(&self.slices) {
            Ok(cell) => cell,
            Err(e) => {
                self.slices.free(handle);
                return Err(e);
            }
        };
        unsafe {
            std::ptr::write(
                descriptor,
                Descriptor {
                    anchor,
                    base: slice.base(),
                    block_size: block_stride,
                    superblock_size: class.superblock_size,
                    max_count,
                    size_class: class_idx,
                    owner_procheap: AtomicUsize::new(0),
                    slice: handle,
                    next: AtomicCell::new(std::ptr::null_mut()),
                },
            );
            for i in 0..max_count {
                let block = (*descriptor).block_ptr(i);
                let next = if i + 1 == max_count { 0 } else { i + 1 };
                *((*descriptor).payload_of(block) as *mut u16) = next as u16;
            }
            (*descriptor).stamp_prefixes();
        }
        Ok(descriptor)
    }

    /// §4.2 full allocation protocol: active credit, else a partial
    /// superblock (own then shared), else a freshly mapped one.
    pub fn alloc(&self, w: &mut BlockAllocatorWorker, size: usize) -> Result<*mut u8, RuntimeError> {
        if size >= MAX_SIZE_CLASS_BYTES {
            return self.alloc_oversize(size);
        }
        let class_idx = self.classes.class_for(size).unwrap_or_else(|| {
            abort_on_invariant_violation("size class lookup failed below oversize threshold")
        });
        let heap = &self.procheaps[w.id][class_idx];

        if let Some(descriptor) = heap.try_take_active_credit() {
            let payload = unsafe { (*descriptor).reserve_block() };
            if let Some(p) = payload {
                return Ok(p);
            }
        }

        if let Some(descriptor) = heap.take_partial(&mut w.partial_workers[class_idx]) {
            unsafe {
                if (*descriptor).reactivate_from_partial() {
                    if let Some(prev) = heap.install_active(descriptor, (*descriptor).anchor.load().credits()) {
                        if (*prev).anchor.load().state() == SuperblockState::Partial {
                            heap.give_partial(prev, &mut w.partial_workers[class_idx]);
                        }
                    }
                    if let Some(p) = (*descriptor).reserve_block() {
                        return Ok(p);
                    }
                } else {
                    // The only way `take_partial` hands back a descriptor
                    // that's no longer PARTIAL is a concurrent free having
                    // driven its last block to EMPTY after it was parked
                    // here. Having just popped it, we're its only owner —
                    // nobody else can be holding the same pointer out of
                    // the same partial slot/queue — so it's safe to retire
                    // right here instead of leaking it forever.
                    self.slices.free((*descriptor).slice);
                    self.arena.push(descriptor);
                }
            }
        }

        let descriptor = self.fresh_superblock(class_idx)?;
        let credits = unsafe { (*descriptor).anchor.load().credits() };
        if let Some(prev) = heap.install_active(descriptor, credits) {
            unsafe {
                if (*prev).anchor.load().state() == SuperblockState::Partial {
                    heap.give_partial(prev, &mut w.partial_workers[class_idx]);
                }
            }
        }
        Ok(unsafe { (*descriptor).reserve_block() }
            .unwrap_or_else(|| abort_on_invariant_violation("fresh superblock yielded no block")))
    }

    fn alloc_oversize(&self, size: usize) -> Result<*mut u8, RuntimeError> {
        let total = size + std::mem::size_of::<OversizeHeader>();
        let handle = self.slices.alloc(SliceKind::Gc, Protection::RW, total)?;
        let slice = self.slices.get(handle);
        unsafe {
            let header = slice.base() as *mut OversizeHeader;
            (*header).prefix.descriptor = AtomicUsize::new(OVERSIZE_TAG);
            (*header).slice = handle;
            Ok(slice.base().add(std::mem::size_of::<OversizeHeader>()))
        }
    }

    /// §4.2 `free`: read the prefix word to find the owning descriptor
    /// (or detect the oversize tag), then push the block back.
    pub fn free(&self, w: &mut BlockAllocatorWorker, ptr: *mut u8) {
        unsafe {
            let prefix_ptr = ptr.sub(std::mem::size_of::<BlockPrefix>()) as *const BlockPrefix;
            if (*prefix_ptr).is_oversize() {
                let header = ptr.sub(std::mem::size_of::<OversizeHeader>()) as *const OversizeHeader;
                self.slices.free((*header).slice);
                return;
            }
            let descriptor_addr = (*prefix_ptr).descriptor.load(Ordering::Relaxed);
            let descriptor = descriptor_addr as *mut Descriptor;
            let block = ptr.sub(std::mem::size_of::<BlockPrefix>());
            let (before, after) = (*descriptor).free_block(block);
            if before == SuperblockState::Full && after == SuperblockState::Partial {
                // This is the only transition that needs to publish the
                // descriptor anywhere: it's already parked (here or in
                // the shared queue) by the time a later free drives it to
                // EMPTY, so that transition needs no action of its own —
                // retirement happens lazily in `alloc`'s `take_partial`
                // branch, the one place guaranteed to hold the only live
                // reference to a popped descriptor.
                let class_idx = (*descriptor).size_class;
                self.procheaps[w.id][class_idx].give_partial(descriptor, &mut w.partial_workers[class_idx]);
            }
        }
    }
}

unsafe impl Send for BlockAllocator {}
unsafe impl Sync for BlockAllocator {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SliceManagerParams;

    fn allocator(workers: usize) -> BlockAllocator {
        let slices = Arc::new(SliceManager::init(SliceManagerParams {
            total_mem_limit: 64 * 1024 * 1024,
            explicit_heap_limit: 32 * 1024 * 1024,
            gc_heap_limit: 32 * 1024 * 1024,
        }));
        BlockAllocator::new(slices, workers)
    }

    #[test]
    fn alloc_then_free_small_block() {
        let alloc = allocator(1);
        let mut w = BlockAllocatorWorker::new(0, alloc.classes.len());
        let ptr = alloc.alloc(&mut w, 32).unwrap();
        assert!(!ptr.is_null());
        alloc.free(&mut w, ptr);
    }

    #[test]
    fn oversize_alloc_round_trips() {
        let alloc = allocator(1);
        let mut w = BlockAllocatorWorker::new(0, alloc.classes.len());
        let ptr = alloc.alloc(&mut w, MAX_SIZE_CLASS_BYTES + 16).unwrap();
        assert!(!ptr.is_null());
        alloc.free(&mut w, ptr);
    }

    #[test]
    fn many_small_allocations_get_distinct_addresses() {
        let alloc = allocator(1);
        let mut w = BlockAllocatorWorker::new(0, alloc.classes.len());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let ptr = alloc.alloc(&mut w, 24).unwrap();
            assert!(seen.insert(ptr as usize));
        }
    }

    fn drain_one_superblock(alloc: &BlockAllocator, w: &mut BlockAllocatorWorker, class_idx: usize) {
        let class = alloc.classes.get(class_idx);
        let stride = class.block_size + std::mem::size_of::<BlockPrefix>();
        let max_count = (class.superblock_size / stride).max(1);
        let mut ptrs = Vec::with_capacity(max_count);
        for _ in 0..max_count {
            ptrs.push(alloc.alloc(w, 16).unwrap());
        }
        for ptr in ptrs {
            alloc.free(w, ptr);
        }
    }

    /// Freeing every block out of a superblock drives its descriptor
    /// PARTIAL -> EMPTY, but retirement (unmapping the slice, returning
    /// the cell to the arena) is deferred to whichever `alloc` call later
    /// pops it back out of the partial slot and finds it no longer
    /// PARTIAL — not to `free` itself, which would risk retiring a
    /// descriptor another worker still holds a pointer to via the
    /// partial/shared-queue slot it was parked in.
    #[test]
    fn freeing_every_block_does_not_retire_until_the_next_alloc() {
        let alloc = allocator(1);
        let mut w = BlockAllocatorWorker::new(0, alloc.classes.len());
        let class_idx = alloc.classes.class_for(16).unwrap();

        let baseline = alloc.slices.usage_snapshot().gc_used;
        drain_one_superblock(&alloc, &mut w, class_idx);
        assert!(alloc.slices.usage_snapshot().gc_used > baseline);
    }

    /// Repeatedly draining a class's superblock must not leak a fresh
    /// slice per cycle: the next cycle's first `alloc` call retires the
    /// previous cycle's now-EMPTY descriptor before minting a new one, so
    /// usage never climbs past what a single live superblock costs.
    #[test]
    fn repeated_full_drain_recycles_the_descriptor_instead_of_leaking_slices() {
        let alloc = allocator(1);
        let mut w = BlockAllocatorWorker::new(0, alloc.classes.len());
        let class_idx = alloc.classes.class_for(16).unwrap();
        let class = alloc.classes.get(class_idx);

        let baseline = alloc.slices.usage_snapshot().gc_used;
        let mut high_water = baseline;
        for _ in 0..4 {
            drain_one_superblock(&alloc, &mut w, class_idx);
            high_water = high_water.max(alloc.slices.usage_snapshot().gc_used);
        }
        assert_eq!(high_water, baseline + class.superblock_size);
    }
}
