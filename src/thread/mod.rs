//! The user-thread type, its mailbox, and the scheduler-state/reference
//! atomic that survives concurrent external mutation (spec.md §3
//! "User-thread", "Sched-state/ref").

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Sentinel worker id meaning "no executor is currently running this
/// thread" (spec.md §3 mailbox invariant).
pub const NO_EXECUTOR: usize = usize::MAX;

/// The four-bit scheduling state. Values chosen to match
/// `original_source/include/cc/thread.h`'s `thread_sched_stat_t` exactly,
/// including the `NONE` sentinel at `0xf`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SchedState {
    Runnable = 0x0,
    Running = 0x1,
    Suspend = 0x2,
    Suspended = 0x3,
    Term = 0x4,
    Dead = 0x5,
    Destroy = 0x6,
    GcWait = 0x7,
    FinalizerLive = 0x8,
    FinalizerWait = 0x9,
    None = 0xf,
}

impl SchedState {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0x0 => Self::Runnable,
            0x1 => Self::Running,
            0x2 => Self::Suspend,
            0x3 => Self::Suspended,
            0x4 => Self::Term,
            0x5 => Self::Dead,
            0x6 => Self::Destroy,
            0x7 => Self::GcWait,
            0x8 => Self::FinalizerLive,
            0x9 => Self::FinalizerWait,
            _ => Self::None,
        }
    }
}

const STATE_MASK: u32 = 0xf;
const REF_BIT: u32 = 0x10;

/// The packed `{state: 4 bits, scheduler-reference flag: 1 bit}` word
/// (spec.md §3). The reference flag exists purely to stop a thread being
/// enqueued onto the workshare twice while its status is mutated from
/// outside the scheduler (see `original_source/include/cc/thread.h`'s
/// `T_REF` comment).
pub struct SchedStateRef(AtomicU32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Packed {
    pub state: SchedState,
    pub referenced: bool,
}

impl SchedStateRef {
    pub fn new(state: SchedState, referenced: bool) -> Self {
        let mut bits = state as u32;
        if referenced {
            bits |= REF_BIT;
        }
        Self(AtomicU32::new(bits))
    }

    #[inline]
    pub fn load(&self) -> Packed {
        let bits = self.0.load(Ordering::Acquire);
        Packed {
            state: SchedState::from_bits(bits & STATE_MASK),
            referenced: bits & REF_BIT != 0,
        }
    }

    fn pack(state: SchedState, referenced: bool) -> u32 {
        let mut bits = state as u32;
        if referenced {
            bits |= REF_BIT;
        }
        bits
    }

    /// CAS `(old_state, old_ref) -> (new_state, new_ref)`, retrying on
    /// spurious failure but giving up (returning `false`) if the observed
    /// state no longer matches `expect` — a legitimate race, not a bug
    /// (§7 BARRIER_RACE is for CAS loops that always eventually succeed;
    /// this one is allowed to lose to a concurrent transition).
    pub fn try_transition(&self, expect: Packed, to_state: SchedState, to_ref: bool) -> bool {
        let old = Self::pack(expect.state, expect.referenced);
        let new = Self::pack(to_state, to_ref);
        self.0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Unconditionally set state while preserving whatever the reference
    /// flag currently is, retrying until it wins (used by `set_state`'s
    /// CAS loop, spec.md §4.4.1 "Deactivating").
    pub fn set_state_preserve_ref(&self, to_state: SchedState) -> Packed {
        loop {
            let cur = self.load();
            if self.try_transition(cur, to_state, cur.referenced) {
                return cur;
            }
        }
    }

    /// Unconditionally set state and clear the reference flag, retrying
    /// until it wins. Used when a thread leaves the workshare for good
    /// (yielded-to-suspended, suspended, finished) so a later
    /// `activate_thread` sees `referenced == false` and enqueues it fresh
    /// instead of taking the preserve-ref branch for a thread nobody holds
    /// a queue entry for anymore.
    pub fn set_state_clear_ref(&self, to_state: SchedState) -> Packed {
        loop {
            let cur = self.load();
            if self.try_transition(cur, to_state, false) {
                return cur;
            }
        }
    }
}

/// Per-thread mailbox (spec.md §3, §6 "ABI-critical" layout). Offsets are
/// not literally fixed here (this is Rust, not the C ABI the original
/// targets) but every field the spec names is present and updated on every
/// migration exactly as described.
pub struct Mailbox {
    pub return_address: AtomicUsize,
    pub stack_pointer: AtomicUsize,
    pub current_worker: AtomicUsize,
    pub signal_word: AtomicUsize,
    pub write_log_index: AtomicUsize,
    pub write_log_base: AtomicUsize,
    pub allocator_base: AtomicUsize,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            return_address: AtomicUsize::new(0),
            stack_pointer: AtomicUsize::new(0),
            current_worker: AtomicUsize::new(NO_EXECUTOR),
            signal_word: AtomicUsize::new(0),
            write_log_index: AtomicUsize::new(0),
            write_log_base: AtomicUsize::new(0),
            allocator_base: AtomicUsize::new(0),
        }
    }
}

pub type ThreadId = u64;

/// A lightweight user-level thread multiplexed onto workers (spec.md §3).
/// `queue_next`/`retire_next` are owned exclusively by whichever worker
/// currently holds the thread in one of its private lists (design note:
/// "the worker owning the queue owns the link field").
pub struct UserThread {
    pub id: ThreadId,
    pub sched: SchedStateRef,
    pub mailbox: Mailbox,
    pub destroy: Box<dyn FnOnce() + Send>,
    pub queue_next: std::sync::atomic::AtomicPtr<UserThread>,
}

impl UserThread {
    pub fn new(id: ThreadId, destroy: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            id,
            sched: SchedStateRef::new(SchedState::Runnable, false),
            mailbox: Mailbox::new(),
            destroy,
            queue_next: std::sync::atomic::AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// Whether `from -> to` is a legal externally-requested transition
/// (spec.md §4.4.1: externally settable states are `{RUNNABLE, SUSPEND,
/// TERM, DESTROY, GC_WAIT}`; `TERM`/`DEAD` are sinks reachable only from
/// `TERM`/running sources; `DESTROY` is irrevocable).
pub fn external_set_allowed(from: SchedState, to: SchedState) -> bool {
    use SchedState::*;
    match from {
        Destroy => false,
        Dead => false,
        Term => matches!(to, Term | Destroy),
        _ => matches!(to, Runnable | Suspend | Term | Destroy | GcWait),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_cannot_become_runnable() {
        assert!(!external_set_allowed(SchedState::Dead, SchedState::Runnable));
    }

    #[test]
    fn destroy_is_a_sink() {
        assert!(!external_set_allowed(SchedState::Destroy, SchedState::Runnable));
        assert!(!external_set_allowed(SchedState::Destroy, SchedState::Term));
    }

    #[test]
    fn runnable_to_suspend_allowed() {
        assert!(external_set_allowed(SchedState::Runnable, SchedState::Suspend));
    }

    #[test]
    fn ref_flag_round_trips() {
        let s = SchedStateRef::new(SchedState::Runnable, false);
        let before = s.load();
        assert!(s.try_transition(before, SchedState::Running, true));
        let after = s.load();
        assert_eq!(after.state, SchedState::Running);
        assert!(after.referenced);
    }
}
