//! The slice data type itself (spec.md §3 "Slice").

/// Which subsystem owns a slice's contents. Order matches
/// `original_source/include/mm/slice.h`'s `slice_type_t` exactly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SliceKind {
    Gc,
    Explicit,
    Custom,
    Static,
}

/// Usage advisory forwarded to the OS collaborator via `madvise`/
/// `VirtualFree(MEM_DECOMMIT)` (spec.md §4.1 `set_usage`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SliceUsage {
    Used,
    Unused,
    Blank,
}

/// A subset of {R, W, X}, enumerated rather than bitflags so it matches
/// the eight named combinations in spec.md §3 one-to-one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protection {
    None,
    R,
    W,
    RW,
    X,
    RX,
    WX,
    RWX,
}

/// A contiguous OS-mapped region, the unit of memory accounting
/// (spec.md §3). Copy because it's a thin handle into OS-owned memory; the
/// authoritative copy lives in the [`SliceManager`](super::SliceManager)'s
/// descriptor table.
#[derive(Clone, Copy, Debug)]
pub struct Slice {
    base: *mut u8,
    size: usize,
    kind: SliceKind,
    pub(crate) usage: SliceUsage,
    pub(crate) prot: Protection,
}

impl Slice {
    pub(crate) fn new(base: *mut u8, size: usize, kind: SliceKind, prot: Protection) -> Self {
        Self {
            base,
            size,
            kind,
            usage: SliceUsage::Used,
            prot,
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    #[inline]
    pub fn usage(&self) -> SliceUsage {
        self.usage
    }

    #[inline]
    pub fn prot(&self) -> Protection {
        self.prot
    }
}

unsafe impl Send for Slice {}

/// An index into the slice manager's static descriptor table. Cheap,
/// `Copy`, and the only thing callers outside `slice::` hold onto.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SliceHandle(pub(crate) usize);
