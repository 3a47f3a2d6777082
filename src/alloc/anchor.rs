//! The superblock anchor: a packed 64-bit atomic word
//! `{avail (10b), credits (10b), state (2b), tag (42b)}` (spec.md §3
//! "Superblock"). Modeled as an explicit tagged-integer abstraction per
//! the design notes rather than bit-twiddling at every call site.

use modular_bitfield::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, Debug, BitfieldSpecifier)]
#[bits = 2]
pub enum SuperblockState {
    Active = 0,
    Full = 1,
    Partial = 2,
    Empty = 3,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct Anchor {
    pub avail: B10,
    pub credits: B10,
    pub state: SuperblockState,
    pub tag: B42,
}

/// Atomic wrapper doing the CAS loop; `Anchor` itself is a plain packed
/// value so call sites read/modify/CAS without re-deriving bit offsets.
pub struct AtomicAnchor(AtomicU64);

impl AtomicAnchor {
    pub fn new(initial: Anchor) -> Self {
        Self(AtomicU64::new(u64::from_le_bytes(initial.into_bytes())))
    }

    #[inline]
    pub fn load(&self) -> Anchor {
        Anchor::from_bytes(self.0.load(Ordering::Acquire).to_le_bytes())
    }

    /// CAS from `expect` to whatever `f` computes from it, retrying with
    /// backoff until it wins or `f` signals "give up" by returning `None`.
    /// `tag` is bumped on every successful CAS so the ABA problem between
    /// pop/push pairs on the free-block list can't recur invisibly
    /// (spec.md §3 "tag advances strictly monotonically per CAS").
    pub fn try_update(&self, expect: Anchor, mut f: impl FnMut(Anchor) -> Option<Anchor>) -> Option<Anchor> {
        let mut cur = expect;
        let mut backoff = crate::os::Backoff::new();
        loop {
            let mut next = f(cur)?;
            next.set_tag((cur.tag().wrapping_add(1)) & ((1u64 << 42) - 1));
            let cur_bits = u64::from_le_bytes(cur.into_bytes());
            let next_bits = u64::from_le_bytes(next.into_bytes());
            match self
                .0
                .compare_exchange_weak(cur_bits, next_bits, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(next),
                Err(actual) => {
                    cur = Anchor::from_bytes(actual.to_le_bytes());
                    backoff.spin();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_advances_strictly_monotonically() {
        let a = AtomicAnchor::new(
            Anchor::new()
                .with_avail(5)
                .with_credits(5)
                .with_state(SuperblockState::Active)
                .with_tag(0),
        );
        let before = a.load().tag();
        a.try_update(a.load(), |cur| Some(cur.with_avail(cur.avail() - 1)));
        assert_eq!(a.load().tag(), before + 1);
    }
}
