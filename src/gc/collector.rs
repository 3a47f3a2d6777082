//! The concurrent generational copying collector (spec.md §4.5). Three
//! barriered phases — INITIAL, NORMAL, WEAK — sit between INACTIVE
//! bookends; every collector worker runs the same state machine, and the
//! last one through each barrier performs the phase's single-writer
//! commit step.

use crate::error::{oom_abort, RuntimeError};
use crate::gc::header::{ArrayHeader, GenWord, ObjectHeader};
use crate::gc::roots::GlobalPointerTable;
use crate::gc::type_descriptor::ObjectClass;
use crate::gc::write_log::{DedupHash, WriteLog, NON_POINTER};
use crate::globals::{
    DEFAULT_SLICE_SIZE, GC_CLUSTER_SIZE, GC_HARD_RATIO, GC_SOFT_RATIO, LARGE_ARRAY_PIN_THRESHOLD,
    PROMOTE_THRESHOLD,
};
use crate::os::Barrier;
use crate::queue::{MsQueue, QueueWorker};
use crate::slice::{Protection, SliceHandle, SliceKind, SliceManager, UsageSnapshot};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// §4.5: INACTIVE → INITIAL → NORMAL → WEAK → INACTIVE.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Inactive = 0,
    Initial = 1,
    Normal = 2,
    Weak = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Inactive,
            1 => Phase::Initial,
            2 => Phase::Normal,
            _ => Phase::Weak,
        }
    }
}

/// Why a collection was triggered; informational only (used for logging).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcReason {
    SoftRatio,
    Requested,
}

/// A per-mutator promotion object: generation advances, promotion to the
/// next generation, or reset on reaching the configured peak
/// (§4.5.2 "sawtooth").
pub struct GenerationPlan {
    generations: u8,
    peak: AtomicU8,
}

impl GenerationPlan {
    pub fn new(generations: u8) -> Self {
        Self {
            generations,
            peak: AtomicU8::new(1),
        }
    }

    /// §4.5.2 sawtooth: advance up to the peak; on reaching it, bump the
    /// peak (capped at `generations`) and restart at 1.
    pub fn next_collection_gen(&self) -> u8 {
        let mut cur = self.peak.load(Ordering::Relaxed);
        loop {
            let next_peak = if cur >= self.generations { self.generations } else { cur + 1 };
            match self
                .peak
                .compare_exchange(cur, next_peak, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next_peak,
                Err(actual) => cur = actual,
            }
        }
    }

    /// An explicit requested generation overrides monotonically upward.
    pub fn request_at_least(&self, g: u8) {
        let mut cur = self.peak.load(Ordering::Relaxed);
        while cur < g {
            match self
                .peak
                .compare_exchange(cur, g.min(self.generations), Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// §4.5.3 `new_gen_count`: advance `survived`, promote, or reset on
    /// reaching peak.
    pub fn new_gen_count(&self, cur_gen: u8, next_gen: u8, survived: u8) -> GenWord {
        if survived + 1 >= PROMOTE_THRESHOLD && next_gen < self.generations {
            GenWord::new(next_gen, next_gen + 1, 0)
        } else {
            GenWord::new(cur_gen, next_gen, survived + 1)
        }
    }
}

/// The shared GC state word plus everything workers need to run a cycle.
/// One instance per runtime, handed to every collector worker
/// (design note: explicit `init`/`shutdown` lifecycle, no module
/// singleton).
pub struct GcState {
    phase: AtomicU8,
    collection_count: AtomicUsize,
    pub generations: GenerationPlan,
    pub object_workshare: MsQueue<usize>,
    pub roots: GlobalPointerTable,
    initial_barrier: Barrier,
    middle_barrier: Barrier,
    final_barrier: Barrier,
    slices: Arc<SliceManager>,
    array_gen: u8,
    /// One bump-allocated copy space per generation (§4.5.7); indexed by
    /// `cur_gen`.
    gen_spaces: Vec<parking_lot::Mutex<GenerationSpace>>,
}

pub struct GcStateParams {
    pub workers: usize,
    pub generations: u8,
    pub array_gen: u8,
    pub object_workshare_capacity: usize,
    pub roots: &'static [crate::gc::header::DoublePointer],
}

impl GcState {
    pub fn init(params: GcStateParams, slices: Arc<SliceManager>) -> Self {
        let gen_spaces = (0..params.generations)
            .map(|_| parking_lot::Mutex::new(GenerationSpace::empty()))
            .collect();
        Self {
            phase: AtomicU8::new(Phase::Inactive as u8),
            collection_count: AtomicUsize::new(0),
            generations: GenerationPlan::new(params.generations),
            object_workshare: MsQueue::new(params.object_workshare_capacity, params.workers),
            roots: GlobalPointerTable::new(params.roots),
            initial_barrier: Barrier::new(params.workers),
            middle_barrier: Barrier::new(params.workers),
            final_barrier: Barrier::new(params.workers),
            slices,
            array_gen: params.array_gen,
            gen_spaces,
        }
    }

    pub fn slices(&self) -> &Arc<SliceManager> {
        &self.slices
    }

    /// The bump-allocation copy space backing generation `gen` for the
    /// collection cycle currently in progress.
    pub fn gen_space(&self, gen: u8) -> &parking_lot::Mutex<GenerationSpace> {
        &self.gen_spaces[gen as usize]
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !matches!(self.phase(), Phase::Inactive)
    }

    #[inline]
    pub fn collection_count(&self) -> usize {
        self.collection_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn parity(&self) -> usize {
        self.collection_count() & 1
    }

    /// §4.5.1: the explicit allocator observes `total/used`; below
    /// [`GC_SOFT_RATIO`] while INACTIVE, CAS-install INITIAL.
    pub fn maybe_trigger(&self, usage: UsageSnapshot) -> bool {
        if usage.gc_limit == 0 {
            return false;
        }
        let free_ratio = 1.0 - (usage.gc_used as f64 / usage.gc_limit as f64);
        if free_ratio >= GC_SOFT_RATIO {
            return false;
        }
        self.phase
            .compare_exchange(
                Phase::Inactive as u8,
                Phase::Initial as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn force_trigger(&self) -> bool {
        self.phase
            .compare_exchange(
                Phase::Inactive as u8,
                Phase::Initial as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// §4.5.1: allocation past the hard ratio fails unless a new slice can
    /// be mapped; the collector's own internal allocation is exempt
    /// (§4.5.8).
    pub fn over_hard_ratio(&self, usage: UsageSnapshot) -> bool {
        if usage.gc_limit == 0 {
            return false;
        }
        let free_ratio = 1.0 - (usage.gc_used as f64 / usage.gc_limit as f64);
        free_ratio < GC_HARD_RATIO
    }

    /// Whether an array of `length` elements should be pinned to
    /// `array_gen` instead of migrating generation over generation
    /// (§4.5.2).
    pub fn should_pin_array(&self, length: usize) -> bool {
        length >= LARGE_ARRAY_PIN_THRESHOLD
    }

    pub fn array_gen(&self) -> u8 {
        self.array_gen
    }
}

/// Per-collector-worker scratch state: its local work queue, write-log
/// dedup hash, and object-workshare handle (spec.md §4.5.5 NORMAL: "(b)
/// processes its local queue").
pub struct CollectorWorker {
    pub id: usize,
    pub local_queue: Vec<*mut ObjectHeader>,
    pub dedup: DedupHash,
    pub workshare: QueueWorker<usize>,
    /// Signed push/pull counter balancing work against the object
    /// workshare (§4.5.5 (d)); push intent on exhaustion, pull intent on
    /// overflow, moderator = capacity / E.
    pub balance: i64,
    /// Every object this worker ran through `copy_normal`/`copy_array_cluster`
    /// during NORMAL, kept around so WEAK can resolve their weak fields
    /// without re-walking the root set.
    pub scanned: Vec<*mut ObjectHeader>,
}

impl CollectorWorker {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            local_queue: Vec::new(),
            dedup: DedupHash::new(1024),
            workshare: QueueWorker::new(id),
            balance: 0,
            scanned: Vec::new(),
        }
    }
}

/// The copy-destination allocator the collector uses internally, exempt
/// from the hard ratio (§4.5.8): free slices first, then used slices below
/// the hard ratio, then new slices.
pub trait CopySpaceAllocator {
    fn allocate_header(&mut self, size: usize, gen: u8) -> *mut ObjectHeader;
}

/// One full pass of the claim protocol for a single normal pointer field
/// (spec.md §4.5.3). `allocator` supplies fresh space for objects that
/// need copying; `moderator` decides generation advancement.
///
/// Returns the (possibly new) forwarding address of `target`.
pub fn claim<A: CopySpaceAllocator>(
    state: &GcState,
    target: *mut ObjectHeader,
    collection_gen: u8,
    allocator: &mut A,
    enqueue: &mut impl FnMut(*mut ObjectHeader),
) -> usize {
    let parity = state.parity();
    unsafe {
        let header = &*target;
        if !header.is_unclaimed(parity) {
            return header.forwarding_address();
        }
        let gw = header.gen_word();
        if gw.cur_gen() > collection_gen {
            // Outside the collection set: claim in place, still enqueue
            // so its *own* fields get scanned for inbound promotions.
            if header.claim_in_place(parity, target as usize) {
                enqueue(target);
            }
            return target as usize;
        }
        let new_gen = state.generations.new_gen_count(gw.cur_gen(), gw.next_gen(), gw.survived_count());
        let desc = header.type_descriptor();
        let (size, array_extra) = match desc.class {
            ObjectClass::Normal => (
                std::mem::size_of::<ObjectHeader>() + desc.normal_payload_size(std::mem::size_of::<crate::gc::header::DoublePointer>()),
                None,
            ),
            ObjectClass::Array => {
                let src_array = &*(target as *const ArrayHeader);
                let length = src_array.length.load(Ordering::Relaxed);
                let elems_size = length * src_array.element_double_ptr_stride;
                (
                    std::mem::size_of::<ArrayHeader>() + elems_size,
                    Some((length, src_array.element_double_ptr_stride, src_array.has_pointers)),
                )
            }
        };
        let new_header = allocator.allocate_header(size, new_gen.cur_gen());
        match header.try_claim(parity, new_header as usize) {
            Ok(()) => {
                (*new_header).type_desc = header.type_desc;
                (*new_header).set_gen_word(new_gen);
                if let Some((length, stride, has_pointers)) = array_extra {
                    let new_array = new_header as *mut ArrayHeader;
                    (*new_array).length = AtomicUsize::new(length);
                    (*new_array).element_double_ptr_stride = stride;
                    (*new_array).has_pointers = has_pointers;
                }
                enqueue(target);
                new_header as usize
            }
            Err(winner) => winner & !1,
        }
    }
}

/// §4.5.4 "Copying" for a normal object: bulk-copy non-pointer bytes once,
/// then claim+write each normal pointer field. Mutable (non-CONST)
/// objects get a second convergent pass that re-reads until destination
/// equals source, matching the spec's explicit non-linearizable design.
pub fn copy_normal<A: CopySpaceAllocator>(
    state: &GcState,
    src: *mut ObjectHeader,
    dst: *mut ObjectHeader,
    collection_gen: u8,
    allocator: &mut A,
    enqueue: &mut impl FnMut(*mut ObjectHeader),
) {
    unsafe {
        let desc = (*src).type_descriptor();
        let src_payload = (src as *const u8).add(std::mem::size_of::<ObjectHeader>());
        let dst_payload = (dst as *mut u8).add(std::mem::size_of::<ObjectHeader>());
        std::ptr::copy_nonoverlapping(src_payload, dst_payload, desc.non_ptr_size as usize);

        let fields_base_src = src_payload.add(desc.non_ptr_size as usize) as *const crate::gc::header::DoublePointer;
        let fields_base_dst = dst_payload.add(desc.non_ptr_size as usize) as *mut crate::gc::header::DoublePointer;

        let do_pass = |converge: bool| -> bool {
            let mut all_converged = true;
            for i in 0..desc.num_normal_ptrs as usize {
                let field = &*fields_base_src.add(i);
                let parity = state.parity();
                let raw = field.read(parity);
                if raw == 0 {
                    continue;
                }
                let new_addr = claim(state, raw as *mut ObjectHeader, collection_gen, allocator, enqueue);
                let dst_field = &*fields_base_dst.add(i);
                dst_field.write_staging(parity, new_addr);
                if converge && dst_field.read_staging(parity) != new_addr {
                    all_converged = false;
                }
            }
            all_converged
        };

        if desc.is_const() {
            do_pass(false);
        } else {
            // §4.5.4: re-read each field until destination equals source;
            // this is the non-linearizable convergent pass by design.
            loop {
                if do_pass(true) {
                    break;
                }
            }
        }

        (*src).mark_copy_complete();
    }
}

/// §4.5.5 WEAK-phase resolution for one already-copied object's weak
/// fields. A weak field is preserved only if its referent was itself
/// fully copied by the time WEAK runs; otherwise the destination field is
/// left at whatever `allocate_header` zeroed it to. Never claims or
/// enqueues — a weak reference must not keep its target alive.
pub fn resolve_weak_fields(state: &GcState, src: *mut ObjectHeader) {
    unsafe {
        let desc = (*src).type_descriptor();
        if desc.num_weak_ptrs == 0 {
            return;
        }
        let dst = (*src).forwarding_address() as *mut ObjectHeader;
        let src_payload = (src as *const u8).add(std::mem::size_of::<ObjectHeader>());
        let dst_payload = (dst as *mut u8).add(std::mem::size_of::<ObjectHeader>());
        let fields_base_src = src_payload.add(desc.non_ptr_size as usize) as *const crate::gc::header::DoublePointer;
        let fields_base_dst = dst_payload.add(desc.non_ptr_size as usize) as *mut crate::gc::header::DoublePointer;
        let parity = state.parity();

        for i in 0..desc.num_weak_ptrs as usize {
            let idx = desc.num_normal_ptrs as usize + i;
            let raw = (*fields_base_src.add(idx)).read(parity);
            if raw == 0 {
                continue;
            }
            let target = &*(raw as *const ObjectHeader);
            if !target.is_unclaimed(parity) && target.copy_complete() {
                let dst_field = &*fields_base_dst.add(idx);
                dst_field.write_staging(parity, target.forwarding_address());
            }
        }
    }
}

/// §4.5.6 write-log drain for one logged write. Objects not yet copied
/// this cycle are left alone — `copy_normal`'s own (still upcoming) pass
/// reads the field's current value directly. Objects already copied get
/// their pointer field re-propagated in case the mutator wrote it after
/// `copy_normal` ran; `NON_POINTER` entries need no action since
/// `copy_normal`'s bulk byte copy already picked up the field they refer
/// to (recorded so the write-log doesn't overflow on plain-data churn).
pub fn rescan_fields<A: CopySpaceAllocator>(
    state: &GcState,
    object_header: usize,
    field_offset: isize,
    collection_gen: u8,
    allocator: &mut A,
    enqueue: &mut impl FnMut(*mut ObjectHeader),
) {
    if field_offset == NON_POINTER {
        return;
    }
    unsafe {
        let src = object_header as *mut ObjectHeader;
        if !(*src).copy_complete() {
            return;
        }
        let dst = (*src).forwarding_address() as *mut ObjectHeader;
        let field_src = &*((src as *const u8).offset(field_offset) as *const crate::gc::header::DoublePointer);
        let field_dst = &*((dst as *mut u8).offset(field_offset) as *const crate::gc::header::DoublePointer);
        let parity = state.parity();
        let raw = field_src.read(parity);
        let new_addr = if raw == 0 {
            0
        } else {
            claim(state, raw as *mut ObjectHeader, collection_gen, allocator, enqueue)
        };
        field_dst.write_staging(parity, new_addr);
    }
}

/// §4.5.5 (b): drain this worker's local queue through `copy_normal`/
/// `copy_array_cluster`, feeding anything newly claimed while copying
/// back onto the same queue until nothing is left. Large arrays copy a
/// cluster at a time; a single dequeue here still walks every remaining
/// cluster of that array before moving on, since there is no shared
/// cluster bitmap for other workers to race over in this queue shape.
pub fn drain_local_queue<A: CopySpaceAllocator>(
    state: &GcState,
    worker: &mut CollectorWorker,
    collection_gen: u8,
    allocator: &mut A,
) {
    while let Some(header) = worker.local_queue.pop() {
        unsafe {
            let class = (*header).type_descriptor().class;
            let dst = (*header).forwarding_address() as *mut ObjectHeader;
            match class {
                ObjectClass::Normal => {
                    let queue = &mut worker.local_queue;
                    let mut enqueue = |h: *mut ObjectHeader| queue.push(h);
                    copy_normal(state, header, dst, collection_gen, allocator, &mut enqueue);
                }
                ObjectClass::Array => {
                    let src_array = header as *mut ArrayHeader;
                    let dst_array = dst as *mut ArrayHeader;
                    let length = (*src_array).length.load(Ordering::Relaxed);
                    let clusters = ArrayHeader::cluster_count(length).max(1);
                    for cluster in 0..clusters {
                        let queue = &mut worker.local_queue;
                        let mut enqueue = |h: *mut ObjectHeader| queue.push(h);
                        copy_array_cluster(state, src_array, dst_array, cluster, collection_gen, allocator, &mut enqueue);
                    }
                    (*header).mark_copy_complete();
                }
            }
        }
        worker.scanned.push(header);
    }
}

/// §4.5.5 (a): claim this worker's share of the global root table one
/// entry at a time until every root has been claimed for this pass,
/// relocating whatever each root points at and restaging the pointer.
pub fn scan_roots<A: CopySpaceAllocator>(
    state: &GcState,
    worker: &mut CollectorWorker,
    collection_gen: u8,
    allocator: &mut A,
) {
    let parity = state.parity();
    while let Some(idx) = state.roots.claim_next() {
        let root = state.roots.get(idx);
        let raw = root.read(parity);
        if raw == 0 {
            continue;
        }
        let queue = &mut worker.local_queue;
        let mut enqueue = |h: *mut ObjectHeader| queue.push(h);
        let new_addr = claim(state, raw as *mut ObjectHeader, collection_gen, allocator, &mut enqueue);
        root.write_staging(parity, new_addr);
    }
}

/// §4.5.7/§4.5.8: bump-allocates collector copy space out of each
/// generation's `GenerationSpace`, replenishing from the slice manager
/// (and, failing that, mapping a fresh slice) as each region fills.
/// Exempt from the hard ratio by construction — it never goes through
/// `SliceManager::reserve`'s explicit-heap accounting path.
pub struct GenerationalAllocator<'a> {
    gc: &'a GcState,
}

impl<'a> GenerationalAllocator<'a> {
    pub fn new(gc: &'a GcState) -> Self {
        Self { gc }
    }
}

impl<'a> CopySpaceAllocator for GenerationalAllocator<'a> {
    fn allocate_header(&mut self, size: usize, gen: u8) -> *mut ObjectHeader {
        let aligned = (size + 63) & !63;
        let mut space = self.gc.gen_space(gen).lock();
        loop {
            if let Some((handle, offset, cap)) = space.active {
                if offset + aligned <= cap {
                    space.active = Some((handle, offset + aligned, cap));
                    space.new_bytes += aligned;
                    let base = self.gc.slices().get(handle).base();
                    return unsafe { base.add(offset) as *mut ObjectHeader };
                }
            }
            let handle = match space.free.pop() {
                Some(h) => h,
                None => match self.gc.slices().alloc(SliceKind::Gc, Protection::RW, DEFAULT_SLICE_SIZE) {
                    Ok(h) => h,
                    Err(e) => oom_abort(&format!("generational copy space exhausted mid-cycle: {e}")),
                },
            };
            let cap = self.gc.slices().get(handle).size();
            space.new.push(handle);
            space.active = Some((handle, 0, cap));
        }
    }
}

/// §4.5.4 array copy: scalar arrays copy per-cluster with a bulk memcpy;
/// arrays with pointers copy element-wise, claiming each element.
/// Arrays at or above the cluster threshold go on the shared
/// `object_workshare`/cluster bitmap instead of a worker's local queue.
pub fn copy_array_cluster<A: CopySpaceAllocator>(
    state: &GcState,
    src: *mut ArrayHeader,
    dst: *mut ArrayHeader,
    cluster_index: usize,
    collection_gen: u8,
    allocator: &mut A,
    enqueue: &mut impl FnMut(*mut ObjectHeader),
) {
    unsafe {
        let length = (*src).length.load(Ordering::Relaxed);
        let start = cluster_index * GC_CLUSTER_SIZE;
        let end = (start + GC_CLUSTER_SIZE).min(length);
        let stride = (*src).element_double_ptr_stride;
        let elems_base_src = (src as *const u8).add(std::mem::size_of::<ArrayHeader>());
        let elems_base_dst = (dst as *mut u8).add(std::mem::size_of::<ArrayHeader>());

        if !(*src).has_pointers {
            let bytes = (end - start) * stride;
            std::ptr::copy_nonoverlapping(
                elems_base_src.add(start * stride),
                elems_base_dst.add(start * stride) as *mut u8,
                bytes,
            );
            return;
        }

        for i in start..end {
            let field = &*(elems_base_src.add(i * stride) as *const crate::gc::header::DoublePointer);
            let parity = state.parity();
            let raw = field.read(parity);
            let new_addr = if raw == 0 {
                0
            } else {
                claim(state, raw as *mut ObjectHeader, collection_gen, allocator, enqueue)
            };
            let dst_field = &*(elems_base_dst.add(i * stride) as *const crate::gc::header::DoublePointer);
            dst_field.write_staging(parity, new_addr);
        }
    }
}

/// §4.5.6: the mutator write barrier. Appends to the worker's log and
/// bumps its index if GC is neither INACTIVE nor INITIAL (mutators haven't
/// crossed the initial barrier yet during INITIAL, §4.5.5).
#[inline]
pub fn write_barrier(state: &GcState, log: &mut WriteLog, object_header: usize, field_offset: isize) -> bool {
    match state.phase() {
        Phase::Inactive | Phase::Initial => false,
        Phase::Normal | Phase::Weak => {
            log.record(object_header, field_offset);
            log.is_full()
        }
    }
}

/// §4.5.6 helper for multi-word non-pointer writes: one `NON_POINTER`
/// entry per word written.
pub fn write_barrier_non_pointer(state: &GcState, log: &mut WriteLog, object_header: usize, words: usize) {
    if matches!(state.phase(), Phase::Inactive | Phase::Initial) {
        return;
    }
    for _ in 0..words {
        log.record(object_header, NON_POINTER);
    }
}

/// §4.5.5 phase driver for one collector worker through one full cycle.
/// `drain_log`/`process_local`/`claim_clusters` are the three NORMAL-phase
/// duties (a)-(c); `do_weak` toggles WEAK-phase weak-pointer handling.
pub struct PhaseOutcome {
    pub became_inactive: bool,
}

impl GcState {
    /// Run this worker's share of one collection cycle to completion.
    /// Returns once the final barrier has released and (for the worker
    /// that ran the epoch flip) the phase is back to INACTIVE.
    pub fn run_cycle<A: CopySpaceAllocator>(
        &self,
        worker: &mut CollectorWorker,
        collection_gen: u8,
        mut allocator: A,
        mut drain_log: impl FnMut(&mut CollectorWorker, &GcState, u8, &mut A),
        mut process_local: impl FnMut(&mut CollectorWorker, &GcState, u8, &mut A),
    ) -> PhaseOutcome {
        // INITIAL: wait for every worker to arrive, then the last flips
        // to NORMAL and releases everyone (§4.5.5).
        let role = self.initial_barrier.arrive();
        if role.is_last {
            self.roots.reset_claims();
            self.phase.store(Phase::Normal as u8, Ordering::Release);
        }

        // NORMAL
        drain_log(worker, self, collection_gen, &mut allocator);
        process_local(worker, self, collection_gen, &mut allocator);
        let role = self.middle_barrier.arrive();
        if role.is_last {
            self.phase.store(Phase::Weak as u8, Ordering::Release);
        }

        // WEAK: repeat with do_weak = true; weak pointers are resolved by
        // the caller's `process_local`/`drain_log` closures checking
        // `self.phase() == Phase::Weak`.
        drain_log(worker, self, collection_gen, &mut allocator);
        process_local(worker, self, collection_gen, &mut allocator);
        let role = self.final_barrier.arrive();
        if role.is_last {
            // The only commit point (§4.5.7): every generation's copy
            // space flips before the phase goes back to INACTIVE and a
            // new allocation can trigger the next cycle. Untouched
            // generations flip over empty lists, which is a no-op.
            for space in &self.gen_spaces {
                space.lock().flip_epoch();
            }
            self.collection_count.fetch_add(1, Ordering::AcqRel);
            self.phase.store(Phase::Inactive as u8, Ordering::Release);
            return PhaseOutcome { became_inactive: true };
        }
        PhaseOutcome { became_inactive: false }
    }
}

/// §4.5.7: the slice epoch flip, run non-concurrently by the single
/// worker that passed the final barrier last. For every size power and
/// every collected generation: used -> free, new -> used, counters
/// folded accordingly. This is the only commit point.
pub struct GenerationSpace {
    pub used: Vec<SliceHandle>,
    pub free: Vec<SliceHandle>,
    pub new: Vec<SliceHandle>,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub new_bytes: usize,
    /// Bump cursor into the slice currently being filled by
    /// [`GenerationalAllocator`]: `(handle, next free offset, capacity)`.
    pub active: Option<(SliceHandle, usize, usize)>,
}

impl GenerationSpace {
    pub fn empty() -> Self {
        Self {
            used: Vec::new(),
            free: Vec::new(),
            new: Vec::new(),
            used_bytes: 0,
            free_bytes: 0,
            new_bytes: 0,
            active: None,
        }
    }

    pub fn flip_epoch(&mut self) {
        self.free.append(&mut self.used);
        self.free_bytes += self.used_bytes;
        self.used = std::mem::take(&mut self.new);
        self.used_bytes = self.new_bytes;
        self.new_bytes = 0;
        self.active = None;
        // Store-fence terminates the flip: subsequent readers must not
        // observe a used list without also observing its byte counter.
        std::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sawtooth_advances_then_wraps() {
        let plan = GenerationPlan::new(3);
        assert_eq!(plan.next_collection_gen(), 2);
        assert_eq!(plan.next_collection_gen(), 3);
        assert_eq!(plan.next_collection_gen(), 3);
    }

    #[test]
    fn epoch_flip_moves_used_to_free_and_new_to_used() {
        let mut space = GenerationSpace {
            used: vec![],
            free: vec![],
            new: vec![],
            used_bytes: 100,
            free_bytes: 0,
            new_bytes: 50,
            active: None,
        };
        space.flip_epoch();
        assert_eq!(space.free_bytes, 100);
        assert_eq!(space.used_bytes, 50);
        assert_eq!(space.new_bytes, 0);
    }

    #[test]
    fn soft_ratio_trigger_fires_when_gc_heap_nearly_full() {
        use crate::slice::UsageSnapshot;
        let slices = Arc::new(SliceManager::init(crate::slice::SliceManagerParams {
            total_mem_limit: 1 << 30,
            explicit_heap_limit: 1 << 30,
            gc_heap_limit: 1 << 30,
        }));
        let state = GcState::init(
            GcStateParams {
                workers: 2,
                generations: 3,
                array_gen: 2,
                object_workshare_capacity: 64,
                roots: &[],
            },
            slices,
        );
        let usage = UsageSnapshot {
            total_limit: 100,
            total_used: 80,
            gc_used: 80,
            gc_limit: 100,
            explicit_used: 0,
        };
        assert!(state.maybe_trigger(usage));
        assert_eq!(state.phase(), Phase::Initial);
    }
}
