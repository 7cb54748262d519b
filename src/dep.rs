//! Dep: the subscription set for a single tracked location.
//!
//! A `Dep` is an ordered mapping from subscriber effects to the track-id each
//! one carried when it last touched the dep. The stored track-id equals the
//! owning effect's current track-id exactly when the edge is live for that
//! effect's latest run; edges left over from older runs are reclaimed lazily,
//! so a stale effect's subscriptions self-expire on the next touch.
//!
//! Deps are created lazily by `track` on first subscription and carry a
//! cleanup hook that fires once when the subscriber set empties; the target
//! map uses the hook to drop the dep from its key map so the surrounding
//! storage can be reclaimed.

use crate::effect::EffectId;
use crate::hash::FixedHashBuilder;
use indexmap::IndexMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::{Arc, Weak};

/// A computed value that can be re-evaluated on demand.
///
/// The dirty probe (`Effect::dirty`) uses this seam: when an effect is
/// `MaybeDirty`, each dep owned by a computed is refreshed, which re-triggers
/// the computed's subscribers with `Dirty` if its value actually changed.
/// Computed collaborators register themselves with [`Dep::set_computed`].
pub trait ComputedSource: Send + Sync {
    /// Bring the computed's cached value up to date, triggering its dep with
    /// `Dirty` if the value changed.
    fn refresh(&self);
}

/// The subscription set for a single `(target, key)` location.
pub struct Dep {
    /// Subscribers in insertion order, each with the track-id it last
    /// touched this dep under.
    subs: RwLock<IndexMap<EffectId, u32, FixedHashBuilder>>,
    /// Invoked when the subscriber set transitions to empty.
    cleanup: Box<dyn Fn() + Send + Sync>,
    /// Back-pointer to the computed that owns this dep, if any.
    computed: RwLock<Option<Weak<dyn ComputedSource>>>,
}

impl Dep {
    /// Create a dep with a cleanup hook.
    pub fn new(cleanup: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Dep {
            subs: RwLock::new(IndexMap::default()),
            cleanup: Box::new(cleanup),
            computed: RwLock::new(None),
        })
    }

    /// Create a dep with no cleanup hook (refs and computed outputs, which
    /// own their dep directly instead of parking it in a target map).
    pub fn standalone() -> Arc<Self> {
        Self::new(|| {})
    }

    /// Register the computed that owns this dep.
    pub fn set_computed(&self, computed: Weak<dyn ComputedSource>) {
        *self.computed.write() = Some(computed);
    }

    /// The owning computed, if one is registered and still alive.
    pub fn computed(&self) -> Option<Arc<dyn ComputedSource>> {
        self.computed.read().as_ref().and_then(Weak::upgrade)
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    /// Whether the dep currently has no subscribers.
    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }

    /// The stored track-id for an effect, if subscribed.
    pub(crate) fn get(&self, effect: EffectId) -> Option<u32> {
        self.subs.read().get(&effect).copied()
    }

    pub(crate) fn insert(&self, effect: EffectId, track_id: u32) {
        self.subs.write().insert(effect, track_id);
    }

    /// Remove an effect. Returns true when the removal emptied the dep.
    pub(crate) fn remove(&self, effect: EffectId) -> bool {
        let mut subs = self.subs.write();
        subs.swap_remove(&effect).is_some() && subs.is_empty()
    }

    /// Snapshot of the subscriber ids in iteration order.
    ///
    /// Trigger iterates the snapshot without holding the lock so that
    /// invalidation hooks can re-enter the dep.
    pub(crate) fn snapshot(&self) -> SmallVec<[EffectId; 8]> {
        self.subs.read().keys().copied().collect()
    }

    pub(crate) fn run_cleanup(&self) {
        (self.cleanup)();
    }
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dep").field("subs", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn remove_reports_empty_transition() {
        let dep = Dep::standalone();
        let a = EffectId::from_raw(1000);
        let b = EffectId::from_raw(1001);
        dep.insert(a, 1);
        dep.insert(b, 1);
        assert!(!dep.remove(a));
        assert!(dep.remove(b));
        assert!(dep.is_empty());
    }

    #[test]
    fn cleanup_hook_is_callable() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let dep = Dep::new(move || {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });
        dep.run_cleanup();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn computed_back_pointer_drops_with_owner() {
        struct Nop;
        impl ComputedSource for Nop {
            fn refresh(&self) {}
        }

        let dep = Dep::standalone();
        let owner: Arc<dyn ComputedSource> = Arc::new(Nop);
        dep.set_computed(Arc::downgrade(&owner));
        assert!(dep.computed().is_some());

        drop(owner);
        assert!(dep.computed().is_none());
    }
}
