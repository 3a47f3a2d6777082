//! Error kinds named in spec.md §7. Only the caller-visible ones are
//! `Result`s; CAS/hazard-pointer races retry locally and never surface
//! (§7 "Propagation"). INVARIANT_VIOLATION is never one of these —
//! per §7 it "aborts the process with a diagnostic", so a call site that
//! detects one calls [`abort_on_invariant_violation`] directly instead of
//! returning an `Err`.

/// Caller-visible failure modes (§7 OUT_OF_MEMORY and bad-config inputs).
/// Both are recoverable to whatever called `runtime_start`/`alloc`/etc.,
/// unlike an internal invariant violation.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("slice quota exceeded")]
    QuotaExceeded,
    #[error("OS refused the memory mapping")]
    OsMapFailed,
    #[error("heap exhausted: {0}")]
    OutOfMemory(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// §7 INVARIANT_VIOLATION: "internal CAS consistency failure ... aborts
/// the process with a diagnostic." Mirrors the teacher's `oom_abort`
/// (`mutator.rs`) but logs through `tracing` first.
#[cold]
#[inline(never)]
pub fn abort_on_invariant_violation(what: &str) -> ! {
    tracing::error!(target: "substrate::invariant", "{}", what);
    std::process::abort();
}

#[cold]
#[inline(never)]
pub fn oom_abort(what: &str) -> ! {
    tracing::error!(target: "substrate::oom", "{}", what);
    std::process::abort();
}
