//! The OS abstraction collaborator (spec.md §1, §6): memory mapping,
//! native threads, a barrier primitive and a pause/back-off primitive. This
//! is intentionally thin — spec.md places it out of scope as "not
//! architecturally interesting" and the rest of the crate only depends on
//! the narrow surface re-exported here.

pub mod mmap;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The capped exponential backoff used by every CAS retry loop in the
/// allocator, the queues and the collector (spec.md §4.2 "Contention
/// discipline"): a leading CPU pause escalating to a parked yield.
/// `crossbeam_utils::Backoff` already implements exactly this schedule.
pub type Backoff = crossbeam_utils::Backoff;

/// A reusable barrier: `arrive()` blocks every caller until `count` callers
/// have arrived, then releases them all. The collector's phase barriers
/// (§4.5.5) are built directly on this, and the last arrival is the one
/// permitted to run the phase transition.
pub struct Barrier {
    mutex: Mutex<BarrierState>,
    cv: Condvar,
    count: usize,
}

struct BarrierState {
    arrived: usize,
    generation: usize,
}

pub struct BarrierRole {
    pub is_last: bool,
}

impl Barrier {
    pub fn new(count: usize) -> Self {
        Self {
            mutex: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
            count,
        }
    }

    /// Block until every participant has called `arrive`. Returns whether
    /// the calling thread was the last to arrive, so it can run the
    /// single-writer phase transition (§4.5.5, §4.5.7).
    pub fn arrive(&self) -> BarrierRole {
        let mut state = self.mutex.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.count {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cv.notify_all();
            return BarrierRole { is_last: true };
        }
        while state.generation == generation {
            self.cv.wait(&mut state);
        }
        BarrierRole { is_last: false }
    }
}

/// A process-wide "keep running" flag flipped exactly once by `stop()`
/// (spec.md §4.4.4).
pub struct LiveFlag(AtomicUsize);

impl LiveFlag {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(1))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Wakes a worker that may be parked waiting for new work. Modeled on
/// `os_thread_signal_send` in the original source: a native condvar
/// notification stands in for the POSIX `SIGUSR1` mailbox-check signal
/// since user-level signal delivery is out of scope here (spec.md §1).
pub struct WakeChannel {
    mutex: Mutex<()>,
    cv: Condvar,
}

impl WakeChannel {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn wake_one(&self) {
        let _g = self.mutex.lock();
        self.cv.notify_one();
    }

    pub fn wake_all(&self) {
        let _g = self.mutex.lock();
        self.cv.notify_all();
    }

    pub fn park_while(&self, mut pred: impl FnMut() -> bool) {
        let mut g = self.mutex.lock();
        while pred() {
            self.cv.wait(&mut g);
        }
    }
}
