//! Effect scopes: disposal grouping for batches of effects.
//!
//! A scope collects the effects created while it is running (plus nested
//! scopes and dispose callbacks) so a whole subtree of reactive work can be
//! torn down with one `stop()`. Scopes created inside another scope's `run`
//! are stopped with their parent; a detached scope opts out of that.

use crate::effect::{Effect, EffectId};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

thread_local! {
    static ACTIVE_SCOPE: RefCell<Vec<EffectScope>> = const { RefCell::new(Vec::new()) };
}

struct ScopeInner {
    active: AtomicBool,
    /// Recorded effects with the uid they had when registered; arena slots
    /// are reused, so stop() only acts on ids still carrying that uid.
    effects: Mutex<Vec<(EffectId, u32)>>,
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    children: Mutex<Vec<EffectScope>>,
}

/// A disposal grouping for effects.
#[derive(Clone)]
pub struct EffectScope {
    inner: Arc<ScopeInner>,
}

impl EffectScope {
    /// A scope registered as a child of the currently active scope, if any.
    pub fn new() -> Self {
        let scope = Self::detached();
        if let Some(parent) = current_scope() {
            parent.inner.children.lock().push(scope.clone());
        }
        scope
    }

    /// A scope that is not tied to the currently active scope.
    pub fn detached() -> Self {
        EffectScope {
            inner: Arc::new(ScopeInner {
                active: AtomicBool::new(true),
                effects: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether the scope has not been stopped.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Run `f` with this scope active, so effects it creates register here.
    ///
    /// Returns `None` if the scope has already been stopped.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.is_active() {
            if cfg!(debug_assertions) {
                log::warn!("cannot run a stopped effect scope");
            }
            return None;
        }

        struct PopGuard;
        impl Drop for PopGuard {
            fn drop(&mut self) {
                ACTIVE_SCOPE.with(|s| {
                    s.borrow_mut().pop();
                });
            }
        }

        ACTIVE_SCOPE.with(|s| s.borrow_mut().push(self.clone()));
        let _guard = PopGuard;
        Some(f())
    }

    /// Stop every recorded effect, run dispose callbacks, and stop nested
    /// scopes. Idempotent.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::Relaxed) {
            return;
        }
        for (effect, uid) in self.inner.effects.lock().drain(..) {
            if effect.uid() == Some(uid) {
                effect.stop();
            }
        }
        for cleanup in self.inner.cleanups.lock().drain(..) {
            cleanup();
        }
        for child in self.inner.children.lock().drain(..) {
            child.stop();
        }
    }
}

impl Default for EffectScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Associate a runner with a scope (or the currently active one).
pub fn record_effect_scope(runner: &Effect, scope: Option<&EffectScope>) {
    record_scope_id(runner.id(), scope);
}

pub(crate) fn record_scope_id(effect: EffectId, scope: Option<&EffectScope>) {
    let Some(uid) = effect.uid() else { return };
    let target = match scope {
        Some(s) => Some(s.clone()),
        None => current_scope(),
    };
    if let Some(scope) = target {
        if scope.is_active() {
            scope.inner.effects.lock().push((effect, uid));
        }
    }
}

/// Register a callback to run when the current scope is stopped.
pub fn on_scope_dispose(f: impl FnOnce() + Send + 'static) {
    if let Some(scope) = current_scope() {
        if scope.is_active() {
            scope.inner.cleanups.lock().push(Box::new(f));
            return;
        }
    }
    if cfg!(debug_assertions) {
        log::warn!("on_scope_dispose called outside an active effect scope");
    }
}

pub(crate) fn current_scope() -> Option<EffectScope> {
    ACTIVE_SCOPE.with(|s| s.borrow().last().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::effect;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stopping_a_scope_stops_its_effects() {
        let scope = EffectScope::new();
        let runner = scope.run(|| effect(|| {})).unwrap();
        assert!(runner.is_active());

        scope.stop();
        assert!(!runner.is_active());
        assert!(!scope.is_active());
    }

    #[test]
    fn dispose_callbacks_run_once() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let scope = EffectScope::new();
        let disposed_clone = disposed.clone();
        scope.run(|| {
            on_scope_dispose(move || {
                disposed_clone.fetch_add(1, Ordering::Relaxed);
            });
        });

        scope.stop();
        scope.stop();
        assert_eq!(disposed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn nested_scopes_stop_with_their_parent() {
        let parent = EffectScope::new();
        let child = parent.run(EffectScope::new).unwrap();
        assert!(child.is_active());

        parent.stop();
        assert!(!child.is_active());
    }

    #[test]
    fn detached_scope_survives_parent_stop() {
        let parent = EffectScope::new();
        let child = parent.run(EffectScope::detached).unwrap();

        parent.stop();
        assert!(child.is_active());
        child.stop();
    }

    #[test]
    fn stopped_scope_refuses_to_run() {
        let scope = EffectScope::new();
        scope.stop();
        assert!(scope.run(|| 1).is_none());
    }
}
