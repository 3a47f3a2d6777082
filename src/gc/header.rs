//! GC object header and the double-pointer discipline (spec.md §3, §4.5.3,
//! design note "Double-pointer mutable fields for on-the-fly collection").

use crate::gc::type_descriptor::TypeDescriptor;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One pointer field as seen by a mutator: two slots, one live per
/// collection parity. Modeled as a "collection-parity-indexed pair" per
/// the design notes rather than a raw two-word struct with manual parity
/// math scattered at every call site.
#[derive(Default)]
#[repr(C)]
pub struct DoublePointer {
    pub(crate) slots: [AtomicUsize; 2],
}

impl DoublePointer {
    pub fn new(initial: usize, parity: usize) -> Self {
        let dp = Self::default();
        dp.slots[parity & 1].store(initial, Ordering::Relaxed);
        dp
    }

    /// Read the slot live for `parity` (a single parity read per access,
    /// per the design note).
    #[inline]
    pub fn read(&self, parity: usize) -> usize {
        self.slots[parity & 1].load(Ordering::Acquire)
    }

    /// Write the slot the collector uses for the *next* parity — this is
    /// where the collector stages the relocated pointer while the current
    /// parity's slot stays live for mutators (§4.5.3).
    #[inline]
    pub fn write_staging(&self, parity: usize, value: usize) {
        self.slots[(parity ^ 1) & 1].store(value, Ordering::Release);
    }

    #[inline]
    pub fn read_staging(&self, parity: usize) -> usize {
        self.slots[(parity ^ 1) & 1].load(Ordering::Acquire)
    }
}

/// Forwarding pointer sentinels. The low bit doubles as the "copy
/// complete" flag once the slot holds a real address (§4.5.4); while the
/// object is still unclaimed it holds one of these two reserved values.
const UNCLAIMED_EVEN: usize = 0x1;
const UNCLAIMED_ODD: usize = !UNCLAIMED_EVEN;

#[inline]
fn unclaimed_sentinel(parity: usize) -> usize {
    if parity & 1 == 0 {
        UNCLAIMED_EVEN
    } else {
        UNCLAIMED_ODD
    }
}

/// Packed `{cur_gen, next_gen, survived_count, flags}` word (spec.md §3).
#[derive(Clone, Copy, Default)]
pub struct GenWord(u32);

const FLAG_ARRAY_PINNED: u32 = 1 << 24;

impl GenWord {
    pub fn new(cur_gen: u8, next_gen: u8, survived_count: u8) -> Self {
        Self(cur_gen as u32 | (next_gen as u32) << 8 | (survived_count as u32) << 16)
    }

    pub fn cur_gen(self) -> u8 {
        (self.0 & 0xff) as u8
    }
    pub fn next_gen(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }
    pub fn survived_count(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }
    pub fn pinned(self) -> bool {
        self.0 & FLAG_ARRAY_PINNED != 0
    }
    pub fn with_pinned(mut self, pinned: bool) -> Self {
        if pinned {
            self.0 |= FLAG_ARRAY_PINNED;
        } else {
            self.0 &= !FLAG_ARRAY_PINNED;
        }
        self
    }
}

/// The header every GC object carries (spec.md §3 "Header fields"). A
/// single cache line, cache-line aligned — objects only ever hold a
/// pointer to this, never into payload.
#[repr(C, align(64))]
pub struct ObjectHeader {
    /// Atomic; low bit doubles as the "copy complete" flag once this holds
    /// a real address (§4.5.4).
    pub forwarding: AtomicUsize,
    /// Collector-local singly-linked chain through pending work; owned
    /// exclusively by whichever collector worker currently has the object
    /// queued (design note: arena/owner discipline for intrusive links).
    pub list_next: AtomicUsize,
    pub type_desc: *const TypeDescriptor,
    pub gen: std::sync::atomic::AtomicU32,
}

unsafe impl Send for ObjectHeader {}
unsafe impl Sync for ObjectHeader {}

impl ObjectHeader {
    pub fn new(type_desc: *const TypeDescriptor, parity: usize, gen: GenWord) -> Self {
        Self {
            forwarding: AtomicUsize::new(unclaimed_sentinel(parity)),
            list_next: AtomicUsize::new(0),
            type_desc,
            gen: std::sync::atomic::AtomicU32::new(gen.0),
        }
    }

    #[inline]
    pub fn type_descriptor(&self) -> &TypeDescriptor {
        unsafe { &*self.type_desc }
    }

    #[inline]
    pub fn gen_word(&self) -> GenWord {
        GenWord(self.gen.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_gen_word(&self, w: GenWord) {
        self.gen.store(w.0, Ordering::Release);
    }

    /// Is this object still unclaimed for the collection at the given
    /// parity (§4.5.3)?
    #[inline]
    pub fn is_unclaimed(&self, parity: usize) -> bool {
        self.forwarding.load(Ordering::Acquire) == unclaimed_sentinel(parity)
    }

    /// Try to install `new_location` as the forwarding address, moving the
    /// object from "unclaimed" to "claimed" for this collection
    /// (§4.5.3). The freshly allocated destination header is initialized
    /// with `ObjectHeader::new` at the *next* parity, which already
    /// leaves it reading as unclaimed for the collection after this one.
    #[inline]
    pub fn try_claim(&self, parity: usize, new_location: usize) -> Result<(), usize> {
        let expect = unclaimed_sentinel(parity);
        self.forwarding
            .compare_exchange(expect, new_location, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// §4.5.3: objects outside the collection set are marked claimed
    /// without copying — CAS straight to "self", i.e. their own address,
    /// which both reads back as "not unclaimed" and is a valid forwarding
    /// target (it never moves).
    #[inline]
    pub fn claim_in_place(&self, parity: usize, self_addr: usize) -> bool {
        let expect = unclaimed_sentinel(parity);
        self.forwarding
            .compare_exchange(expect, self_addr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// §4.5.4: "XOR the low bit of the forwarding pointer to indicate
    /// copy complete"; no CAS needed because nothing else mutates this
    /// slot concurrently once it holds a real address.
    #[inline]
    pub fn mark_copy_complete(&self) {
        let cur = self.forwarding.load(Ordering::Relaxed);
        self.forwarding.store(cur ^ 1, Ordering::Release);
    }

    #[inline]
    pub fn copy_complete(&self) -> bool {
        self.forwarding.load(Ordering::Acquire) & 1 != 0
    }

    #[inline]
    pub fn forwarding_address(&self) -> usize {
        self.forwarding.load(Ordering::Acquire) & !1
    }
}

/// Array header: bitmap (negative-length, one bit per
/// [`crate::globals::GC_CLUSTER_SIZE`] elements) | length | header |
/// elements (spec.md §3 "GC object").
#[repr(C, align(64))]
pub struct ArrayHeader {
    pub base: ObjectHeader,
    pub length: AtomicUsize,
    pub element_double_ptr_stride: usize,
    pub has_pointers: bool,
}

impl ArrayHeader {
    /// Number of clusters the bitmap needs to cover `length` elements.
    pub fn cluster_count(length: usize) -> usize {
        (length + crate::globals::GC_CLUSTER_SIZE - 1) / crate::globals::GC_CLUSTER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_cache_line_sized_and_aligned() {
        assert!(std::mem::size_of::<ObjectHeader>() >= 64);
        assert_eq!(std::mem::align_of::<ObjectHeader>(), 64);
    }

    #[test]
    fn claim_transitions_from_unclaimed_to_real_address() {
        let desc = TypeDescriptor {
            class: crate::gc::type_descriptor::ObjectClass::Normal,
            flags: 0,
            non_ptr_size: 0,
            num_normal_ptrs: 0,
            num_weak_ptrs: 0,
        };
        let h = ObjectHeader::new(&desc, 0, GenWord::new(0, 0, 0));
        assert!(h.is_unclaimed(0));
        h.try_claim(0, 0x1000).unwrap();
        assert!(!h.is_unclaimed(0));
        assert_eq!(h.forwarding_address(), 0x1000);
        assert!(!h.copy_complete());
        h.mark_copy_complete();
        assert!(h.copy_complete());
        assert_eq!(h.forwarding_address(), 0x1000);
    }

    #[test]
    fn gen_word_round_trips() {
        let w = GenWord::new(1, 2, 3).with_pinned(true);
        assert_eq!(w.cur_gen(), 1);
        assert_eq!(w.next_gen(), 2);
        assert_eq!(w.survived_count(), 3);
        assert!(w.pinned());
    }
}
