//! Tunable constants shared across the slice manager, block allocator and
//! collector. Mirrors the constant names spec.md uses directly so the rest
//! of the crate can refer to them without re-deriving magic numbers.

/// Smallest slice the OS collaborator will ever hand back.
pub const SLICE_MIN: usize = 4 * 1024 * 1024;
/// Largest slice the OS collaborator will ever hand back.
pub const SLICE_MAX: usize = 256 * 1024 * 1024;
/// Default slice granule (see the `slice_size` init parameter, spec.md §6).
pub const DEFAULT_SLICE_SIZE: usize = 4 * 1024 * 1024;

/// Size of the static slice descriptor table (§4.1).
pub const SLICE_TAB_SIZE: usize = 4096;

/// Number of fixed size classes served by the block allocator (§4.2).
pub const NUM_SIZE_CLASSES: usize = 32;
/// Requests at or above this size bypass size-class machinery entirely and
/// get a dedicated slice.
pub const MAX_SIZE_CLASS_BYTES: usize = 16 * 1024;

/// Length of a per-worker GC write log ring (§3, §4.5.6).
pub const GC_WRITE_LOG_LENGTH: usize = 4096;

/// Number of elements per array clusterization unit (§4.5.4, GLOSSARY).
pub const GC_CLUSTER_SIZE: usize = 256;

/// Default / maximum generation counts (§4.5.2, §6).
pub const DEFAULT_GENERATIONS: u8 = 3;
pub const MAX_GENERATIONS: u8 = 254;

/// survived_count at which an object is promoted to the next generation.
pub const PROMOTE_THRESHOLD: u8 = 4;

/// Arrays at or above this element count are pinned to `array_gen` instead
/// of being repeatedly copied generation over generation (§4.5.2).
pub const LARGE_ARRAY_PIN_THRESHOLD: usize = 4096;

/// Soft and hard total/used ratios that drive the GC trigger (§4.5.1).
pub const GC_SOFT_RATIO: f64 = 0.30;
pub const GC_HARD_RATIO: f64 = 0.05;

/// Descriptor cells carved out of one freshly mapped slice when the block
/// allocator's descriptor free-list (§4.2) runs dry.
pub const DESCRIPTOR_ARENA_SIZE: usize = 512;

/// Retire threshold for hazard-pointer-guarded queues: 2 * worker count.
#[inline]
pub const fn retire_threshold(workers: usize) -> usize {
    2 * workers
}

/// Static node-pool size for a workshare of the given logical capacity,
/// per spec.md §3: `capacity + 2E^2 + 2E + 1`.
#[inline]
pub const fn node_pool_size(capacity: usize, workers: usize) -> usize {
    capacity + 2 * workers * workers + 2 * workers + 1
}
