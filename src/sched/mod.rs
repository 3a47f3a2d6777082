//! The work-stealing M:N scheduler (spec.md §4.4): one shared workshare
//! queue of runnable user-threads, externally-driven state transitions,
//! and per-worker executors that pull from it.

pub mod executor;

use crate::gc::GcState;
use crate::os::{LiveFlag, WakeChannel};
use crate::queue::{MsQueue, QueueWorker};
use crate::thread::{external_set_allowed, Packed, SchedState, UserThread};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The process-wide scheduler state: the shared runnable queue plus the
/// bookkeeping every worker consults at a safepoint (spec.md §3
/// "Scheduler"). One instance per runtime.
pub struct Scheduler {
    pub workshare: MsQueue<*mut UserThread>,
    pub live_threads: AtomicUsize,
    pub live: LiveFlag,
    pub wake: WakeChannel,
    pub gc: Arc<GcState>,
}

pub struct SchedulerParams {
    pub workers: usize,
    pub workshare_capacity: usize,
}

impl Scheduler {
    pub fn init(params: SchedulerParams, gc: Arc<GcState>) -> Self {
        Self {
            workshare: MsQueue::new(params.workshare_capacity, params.workers),
            live_threads: AtomicUsize::new(0),
            live: LiveFlag::new(),
            wake: WakeChannel::new(),
            gc,
        }
    }

    /// §4.4.1 "Activating a thread not yet referenced": CAS
    /// `{state, ref=false} -> {RUNNABLE, ref=true}`, enqueue on success, wake
    /// a parked worker.
    ///
    /// §4.4.1 "Activating a referenced thread": the thread is already on (or
    /// about to be on) the workshare from an earlier activation. CAS the
    /// state to RUNNABLE while preserving `ref=true` and report success
    /// without enqueueing again — some worker will discover the state change
    /// on its next workshare dequeue.
    pub fn activate_thread(&self, thread: &UserThread, w: &mut QueueWorker<*mut UserThread>) -> bool {
        loop {
            let cur = thread.sched.load();
            if !external_set_allowed(cur.state, SchedState::Runnable) && cur.state != SchedState::Runnable {
                return false;
            }
            if thread.sched.try_transition(cur, SchedState::Runnable, true) {
                if !cur.referenced {
                    self.workshare.enqueue(w, thread as *const UserThread as *mut UserThread);
                    self.wake.wake_one();
                }
                return true;
            }
        }
    }

    /// §4.4.1 "Deactivating": externally requested transitions that do not
    /// go through the workshare at all (SUSPEND, TERM, DESTROY, GC_WAIT).
    /// Returns whether the request was legal and applied.
    pub fn external_set(&self, thread: &UserThread, to: SchedState) -> bool {
        loop {
            let cur = thread.sched.load();
            if !external_set_allowed(cur.state, to) {
                return false;
            }
            if thread.sched.try_transition(cur, to, cur.referenced) {
                return true;
            }
        }
    }

    pub fn register_thread(&self) {
        self.live_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unregister_thread(&self) {
        self.live_threads.fetch_sub(1, Ordering::AcqRel);
    }

    /// §4.4.4 "Shutdown": flip the live flag and wake every parked worker so
    /// each notices on its next safepoint check and exits its loop.
    pub fn stop(&self) {
        self.live.clear();
        self.wake.wake_all();
    }

    pub fn current_state(thread: &UserThread) -> Packed {
        thread.sched.load()
    }
}

unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{GcStateParams, GcState};
    use crate::slice::{SliceManager, SliceManagerParams};
    use crate::thread::ThreadId;

    fn scheduler(workers: usize) -> Scheduler {
        let slices = Arc::new(SliceManager::init(SliceManagerParams {
            total_mem_limit: 1 << 20,
            explicit_heap_limit: 1 << 20,
            gc_heap_limit: 1 << 20,
        }));
        let gc = Arc::new(GcState::init(
            GcStateParams {
                workers,
                generations: 2,
                array_gen: 1,
                object_workshare_capacity: 32,
                roots: &[],
            },
            slices,
        ));
        Scheduler::init(
            SchedulerParams {
                workers,
                workshare_capacity: 32,
            },
            gc,
        )
    }

    #[test]
    fn activate_enqueues_once_then_reactivates_without_requeueing() {
        let sched = scheduler(1);
        let mut w = QueueWorker::new(0);
        let id: ThreadId = 1;
        let thread = UserThread::new(id, Box::new(|| {}));
        assert!(sched.activate_thread(&thread, &mut w));
        assert!(thread.sched.load().referenced);

        // Reactivating a thread that's already referenced (§4.4.1's second
        // branch) succeeds without a second enqueue — the worker that
        // eventually dequeues it sees the refreshed RUNNABLE state.
        assert!(sched.activate_thread(&thread, &mut w));
        assert_eq!(thread.sched.load().state, SchedState::Runnable);

        assert_eq!(sched.workshare.dequeue(&mut w), Some(&thread as *const UserThread as *mut UserThread));
        assert_eq!(sched.workshare.dequeue(&mut w), None);
    }

    #[test]
    fn external_set_rejects_illegal_transition() {
        let sched = scheduler(1);
        let thread = UserThread::new(2, Box::new(|| {}));
        assert!(sched.external_set(&thread, SchedState::Destroy));
        assert!(!sched.external_set(&thread, SchedState::Runnable));
    }

    #[test]
    fn stop_clears_live_flag() {
        let sched = scheduler(1);
        assert!(sched.live.is_live());
        sched.stop();
        assert!(!sched.live.is_live());
    }
}
