//! A lock-free M:N runtime core: a work-stealing scheduler, a slice-backed
//! block allocator, and a concurrent generational copying collector, laid
//! out as independent collaborators so an embedder can wire its own guest
//! execution engine on top (spec.md §1).

pub mod alloc;
pub mod error;
pub mod gc;
pub mod globals;
pub mod os;
pub mod queue;
pub mod sched;
pub mod slice;
pub mod thread;
pub mod util;

pub use error::RuntimeError;

use gc::header::DoublePointer;
use gc::{GcState, GcStateParams};
use globals::{DEFAULT_GENERATIONS, DEFAULT_SLICE_SIZE};
use sched::{Scheduler, SchedulerParams};
use slice::{SliceManager, SliceManagerParams};
use std::sync::Arc;

/// Init-time configuration (spec.md §6). Everything has the documented
/// default except `workers`, which has none — an embedder that doesn't
/// pass one gets `std::thread::available_parallelism()`.
pub struct RuntimeConfig {
    pub workers: Option<usize>,
    pub worker_stack_size: usize,
    pub total_mem_limit: usize,
    pub explicit_heap_limit: usize,
    pub gc_heap_limit: usize,
    pub slice_size: usize,
    pub generations: u8,
    pub array_gen: u8,
    /// The guest's global pointer table, scanned as part of every
    /// collection's root set (spec.md §6 "Global pointer table").
    pub roots: &'static [DoublePointer],
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            worker_stack_size: 2 * 1024 * 1024,
            total_mem_limit: 1024 * 1024 * 1024,
            explicit_heap_limit: 512 * 1024 * 1024,
            gc_heap_limit: 512 * 1024 * 1024,
            slice_size: DEFAULT_SLICE_SIZE,
            generations: DEFAULT_GENERATIONS,
            array_gen: DEFAULT_GENERATIONS - 1,
            roots: &[],
        }
    }
}

/// The live runtime: every collaborator an embedder needs a handle to in
/// order to spin up workers, activate threads and request collections.
/// Dropping or calling [`RuntimeHandle::stop`] tears it down (spec.md
/// §4.4.4).
pub struct RuntimeHandle {
    pub slices: Arc<SliceManager>,
    pub allocator: Arc<alloc::BlockAllocator>,
    pub gc: Arc<GcState>,
    pub scheduler: Arc<Scheduler>,
    pub workers: usize,
}

/// Bring up the slice manager, block allocator, collector state and
/// scheduler in dependency order (spec.md §6 "Startup"). Does not spawn
/// any OS threads itself — an embedder drives [`sched::executor::Executor`]
/// on whatever native threads it creates, per worker id `0..workers`.
pub fn runtime_start(config: RuntimeConfig) -> Result<RuntimeHandle, RuntimeError> {
    let workers = config
        .workers
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
        .max(1);

    if config.generations == 0 || config.array_gen >= config.generations {
        return Err(RuntimeError::InvalidConfig(
            "array_gen must be less than generations",
        ));
    }

    let slices = Arc::new(SliceManager::init(SliceManagerParams {
        total_mem_limit: config.total_mem_limit,
        explicit_heap_limit: config.explicit_heap_limit,
        gc_heap_limit: config.gc_heap_limit,
    }));

    let allocator = Arc::new(alloc::BlockAllocator::new(slices.clone(), workers));

    let gc = Arc::new(GcState::init(
        GcStateParams {
            workers,
            generations: config.generations,
            array_gen: config.array_gen,
            object_workshare_capacity: 4096,
            roots: config.roots,
        },
        slices.clone(),
    ));

    let scheduler = Arc::new(Scheduler::init(
        SchedulerParams {
            workers,
            workshare_capacity: 4096,
        },
        gc.clone(),
    ));

    tracing::info!(target: "substrate::startup", workers, "runtime initialized");

    Ok(RuntimeHandle {
        slices,
        allocator,
        gc,
        scheduler,
        workers,
    })
}

impl RuntimeHandle {
    /// §4.4.4 shutdown: stop the scheduler (wakes every parked worker so
    /// their `Executor::run` loops return), then unmap every outstanding
    /// slice. Workers must have already joined before calling this.
    pub fn stop(&self) {
        self.scheduler.stop();
        self.slices.shutdown();
    }
}

/// The guest entry point contract (spec.md §6 "Guest entry point"): called
/// once per worker as it starts its very first user-thread, with the
/// worker's id and the process's own `argc`/`argv`/`envp`. An embedder's
/// `main` supplies this; the runtime only threads the arguments through.
pub type ProgMain = fn(
    current_thread: &thread::UserThread,
    worker_id: usize,
    argc: i32,
    argv: *const *const u8,
    envp: *const *const u8,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_start_picks_workers_and_inits_collaborators() {
        let handle = runtime_start(RuntimeConfig {
            workers: Some(2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(handle.workers, 2);
        assert_eq!(handle.gc.phase(), gc::Phase::Inactive);
        handle.stop();
    }

    #[test]
    fn runtime_start_rejects_bad_array_gen() {
        let err = runtime_start(RuntimeConfig {
            generations: 2,
            array_gen: 2,
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
