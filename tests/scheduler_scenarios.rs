//! Scheduler-level scenarios (spec.md §8 scenario 1: "100 guest threads
//! allocate then suspend", plus external-transition legality coverage).

use std::sync::Arc;
use substrate::alloc::{BlockAllocator, BlockAllocatorWorker};
use substrate::gc::{GcState, GcStateParams};
use substrate::queue::QueueWorker;
use substrate::sched::{Scheduler, SchedulerParams};
use substrate::slice::{SliceManager, SliceManagerParams};
use substrate::thread::{SchedState, UserThread};

fn fresh_runtime(workers: usize) -> (Arc<Scheduler>, Arc<GcState>, Arc<BlockAllocator>) {
    let slices = Arc::new(SliceManager::init(SliceManagerParams {
        total_mem_limit: 64 * 1024 * 1024,
        explicit_heap_limit: 32 * 1024 * 1024,
        gc_heap_limit: 32 * 1024 * 1024,
    }));
    let gc = Arc::new(GcState::init(
        GcStateParams {
            workers,
            generations: 3,
            array_gen: 2,
            object_workshare_capacity: 1024,
            roots: &[],
        },
        slices.clone(),
    ));
    let scheduler = Arc::new(Scheduler::init(
        SchedulerParams {
            workers,
            workshare_capacity: 1024,
        },
        gc.clone(),
    ));
    let allocator = Arc::new(BlockAllocator::new(slices, workers));
    (scheduler, gc, allocator)
}

#[test]
fn one_hundred_threads_allocate_then_suspend() {
    let (scheduler, _gc, allocator) = fresh_runtime(4);
    let mut qw = QueueWorker::new(0);
    let mut alloc_worker = BlockAllocatorWorker::new(0, substrate::globals::NUM_SIZE_CLASSES);

    let threads: Vec<Box<UserThread>> = (0..100)
        .map(|i| Box::new(UserThread::new(i, Box::new(|| {}))))
        .collect();

    for t in &threads {
        scheduler.register_thread();
        assert!(scheduler.activate_thread(t, &mut qw));
    }

    let mut dequeued = 0;
    while let Some(ptr) = scheduler.workshare.dequeue(&mut qw) {
        let thread = unsafe { &*ptr };
        let block = allocator.alloc(&mut alloc_worker, 64).expect("allocation must succeed");
        assert!(!block.is_null());
        allocator.free(&mut alloc_worker, block);
        assert!(scheduler.external_set(thread, SchedState::Suspend));
        assert_eq!(thread.sched.load().state, SchedState::Suspend);
        dequeued += 1;
    }
    assert_eq!(dequeued, 100);
}

#[test]
fn destroy_is_irrevocable_even_after_requeue_attempt() {
    let (scheduler, _gc, _allocator) = fresh_runtime(1);
    let mut qw = QueueWorker::new(0);
    let thread = UserThread::new(1, Box::new(|| {}));
    assert!(scheduler.external_set(&thread, SchedState::Destroy));
    assert!(!scheduler.activate_thread(&thread, &mut qw));
    assert!(!scheduler.external_set(&thread, SchedState::Runnable));
}

#[test]
fn safepoint_is_a_noop_when_gc_is_inactive() {
    let (_scheduler, gc, _allocator) = fresh_runtime(1);
    assert!(!gc.is_active());
    assert_eq!(gc.phase(), substrate::gc::Phase::Inactive);
}
