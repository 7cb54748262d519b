//! Zero-sized hash builder for the runtime's internal hash collections.
//!
//! Provides `FixedHashBuilder`, a zero-sized `BuildHasher` backed by foldhash
//! with a fixed seed. The dep subscriber maps and target key maps are internal
//! data structures keyed by ids and small keys, so HashDoS resistance is not
//! needed and the per-collection memory overhead of a seeded state is wasted.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` using foldhash with a fixed seed.
///
/// All instances produce identical hash values, so maps built with it are
/// deterministic across runs and cost nothing to embed in a struct.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedHashBuilder;

impl BuildHasher for FixedHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x6b9f_2d41_85c3_7e19).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FixedHashBuilder>(), 0);
    }

    #[test]
    fn builder_is_deterministic() {
        let a = FixedHashBuilder.hash_one(17u64);
        let b = FixedHashBuilder.hash_one(17u64);
        assert_eq!(a, b);
    }
}
