//! Per-worker execution loop (spec.md §4.4.2 "Scheduling cycle", §4.4.3
//! "Safepoints", §4.4.4 "Shutdown").

use crate::alloc::{BlockAllocator, BlockAllocatorWorker};
use crate::gc::header::ObjectHeader;
use crate::gc::write_log::WriteLog;
use crate::gc::{CollectorWorker, GcState};
use crate::queue::QueueWorker;
use crate::sched::Scheduler;
use crate::thread::{SchedState, UserThread};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Signal bits packed into `Mailbox::signal_word` (spec.md §4.4.3): a
/// worker consults `signal_word | forced_signals` at every safepoint and
/// reacts to whichever bits are set before resuming the mutator.
pub const SIGNAL_SCHEDULE: usize = 1 << 0;
pub const SIGNAL_GC: usize = 1 << 1;

/// What guest code embedded in a user-thread reported back at its last
/// safepoint. The executor itself never interprets guest bytecode — that
/// is out of scope here (spec.md §1) — so this is the seam an embedder
/// implements.
pub trait Mutator {
    /// Run `thread` until it either yields at a safepoint, blocks, or
    /// finishes. Must check `forced_signals` cooperatively and return
    /// promptly when [`SIGNAL_GC`] is set.
    fn run_until_yield(&mut self, thread: &UserThread, forced_signals: usize) -> MutatorOutcome;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutatorOutcome {
    Yielded,
    Suspended,
    Finished,
}

/// One OS thread's worker state (spec.md §3 "Worker"): its write-log ring,
/// generational block allocator handle, collector scratch state and
/// workshare handle, all private to this worker.
pub struct Worker {
    pub id: usize,
    pub write_log: WriteLog,
    pub alloc: BlockAllocatorWorker,
    pub gc_worker: CollectorWorker,
    pub sched_queue: QueueWorker<*mut UserThread>,
}

impl Worker {
    pub fn new(id: usize, num_size_classes: usize) -> Self {
        Self {
            id,
            write_log: WriteLog::new(),
            alloc: BlockAllocatorWorker::new(id, num_size_classes),
            gc_worker: CollectorWorker::new(id),
            sched_queue: QueueWorker::new(id),
        }
    }
}

/// Drives one worker's main loop: pull a runnable thread, run it until it
/// yields, act on whatever signal brought it back, repeat until the
/// scheduler's live flag is cleared.
pub struct Executor<M: Mutator> {
    pub scheduler: Arc<Scheduler>,
    pub gc: Arc<GcState>,
    pub allocator: Arc<BlockAllocator>,
    pub mutator: M,
}

impl<M: Mutator> Executor<M> {
    pub fn new(scheduler: Arc<Scheduler>, gc: Arc<GcState>, allocator: Arc<BlockAllocator>, mutator: M) -> Self {
        Self {
            scheduler,
            gc,
            allocator,
            mutator,
        }
    }

    /// §4.4.2 four-step cycle: dequeue, run, handle whatever brought the
    /// mutator back (GC participation or a schedule request), then either
    /// requeue the thread (still runnable) or drop it (suspended/dead).
    pub fn run(&mut self, worker: &mut Worker) {
        while self.scheduler.live.is_live() {
            let thread_ptr = match self.scheduler.workshare.dequeue(&mut worker.sched_queue) {
                Some(t) => t,
                None => {
                    self.scheduler.wake.park_while(|| {
                        self.scheduler.live.is_live() && self.scheduler.workshare.is_empty()
                    });
                    continue;
                }
            };
            let thread = unsafe { &*thread_ptr };
            thread.mailbox.current_worker.store(worker.id, Ordering::Release);
            let _ = thread.sched.try_transition(thread.sched.load(), SchedState::Running, true);

            let outcome = self.run_one(worker, thread);

            thread.mailbox.current_worker.store(crate::thread::NO_EXECUTOR, Ordering::Release);
            match outcome {
                MutatorOutcome::Yielded => {
                    let cur = thread.sched.load();
                    if thread.sched.try_transition(cur, SchedState::Runnable, true) {
                        self.scheduler
                            .workshare
                            .enqueue(&mut worker.sched_queue, thread_ptr);
                    }
                }
                MutatorOutcome::Suspended => {
                    thread.sched.set_state_clear_ref(SchedState::Suspended);
                }
                MutatorOutcome::Finished => {
                    thread.sched.set_state_clear_ref(SchedState::Dead);
                    self.scheduler.unregister_thread();
                }
            }
        }
    }

    /// §4.4.3 safepoint: consult `signal_word | forced_signals` (forced by
    /// an in-progress GC cycle) and react before letting the mutator
    /// proceed.
    fn run_one(&mut self, worker: &mut Worker, thread: &UserThread) -> MutatorOutcome {
        let forced = if self.gc.is_active() { SIGNAL_GC } else { 0 };
        let outcome = self.mutator.run_until_yield(thread, forced);
        if forced & SIGNAL_GC != 0 {
            self.participate_in_gc(worker);
        }
        outcome
    }

    /// Drains this worker's write-log and local object queue through one
    /// full collection cycle (spec.md §4.5.5). The actual claim/copy/root
    /// calls live in [`crate::gc::collector`]; this wires the worker's
    /// private state (write log, local queue, scanned list) into
    /// `run_cycle`'s two per-phase closures.
    fn participate_in_gc(&mut self, worker: &mut Worker) {
        use crate::gc::collector::{drain_local_queue, rescan_fields, resolve_weak_fields, scan_roots, GenerationalAllocator};
        use crate::gc::Phase;

        let collection_gen = self.gc.generations.next_collection_gen();
        let allocator = GenerationalAllocator::new(&self.gc);
        let write_log = &mut worker.write_log;
        let gc_worker = &mut worker.gc_worker;

        self.gc.run_cycle(
            gc_worker,
            collection_gen,
            allocator,
            |cw, s, g, a| {
                for entry in write_log.entries() {
                    let key = entry.object_header ^ (entry.field_offset as usize).rotate_left(17);
                    if cw.dedup.insert_if_new(key) {
                        let queue = &mut cw.local_queue;
                        let mut enqueue = |h: *mut ObjectHeader| queue.push(h);
                        rescan_fields(s, entry.object_header, entry.field_offset, g, a, &mut enqueue);
                    }
                }
                write_log.clear();
                cw.dedup.clear();
            },
            |cw, s, g, a| {
                if s.phase() == Phase::Normal {
                    scan_roots(s, cw, g, a);
                    drain_local_queue(s, cw, g, a);
                } else {
                    for &header in &cw.scanned {
                        resolve_weak_fields(s, header);
                    }
                    cw.scanned.clear();
                }
            },
        );
    }
}

/// §4.4.4 shutdown sequence: stop accepting new work, wake every parked
/// worker, and let each `Executor::run` loop notice and return.
pub fn stop(scheduler: &Scheduler) {
    scheduler.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcStateParams;
    use crate::sched::SchedulerParams;
    use crate::slice::{SliceManager, SliceManagerParams};

    struct ImmediateFinish;
    impl Mutator for ImmediateFinish {
        fn run_until_yield(&mut self, _thread: &UserThread, _forced: usize) -> MutatorOutcome {
            MutatorOutcome::Finished
        }
    }

    #[test]
    fn worker_runs_thread_to_completion_and_unregisters() {
        let slices = Arc::new(SliceManager::init(SliceManagerParams {
            total_mem_limit: 1 << 20,
            explicit_heap_limit: 1 << 20,
            gc_heap_limit: 1 << 20,
        }));
        let gc = Arc::new(GcState::init(
            GcStateParams {
                workers: 1,
                generations: 2,
                array_gen: 1,
                object_workshare_capacity: 16,
                roots: &[],
            },
            slices.clone(),
        ));
        let scheduler = Arc::new(Scheduler::init(
            SchedulerParams {
                workers: 1,
                workshare_capacity: 16,
            },
            gc.clone(),
        ));
        let allocator = Arc::new(BlockAllocator::new(slices, 1));
        scheduler.register_thread();
        let thread = UserThread::new(1, Box::new(|| {}));
        let mut qw = QueueWorker::new(0);
        scheduler.activate_thread(&thread, &mut qw);

        let mut executor = Executor::new(scheduler.clone(), gc, allocator.clone(), ImmediateFinish);
        let mut worker = Worker::new(0, 1);
        // Run exactly one iteration worth of work, then stop the
        // scheduler so the loop exits instead of parking forever.
        let thread_ptr = scheduler.workshare.dequeue(&mut worker.sched_queue).unwrap();
        let outcome = executor.run_one(&mut worker, unsafe { &*thread_ptr });
        assert_eq!(outcome, MutatorOutcome::Finished);
    }
}
