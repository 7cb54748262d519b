//! Per-thread tracking and scheduling-pause state.
//!
//! The runtime is cooperative and single-threaded per thread of execution:
//! the currently running effect, the should-track stack, and the
//! pause-schedule depth all live in thread-locals. Only passive storage (the
//! effect arena) is shared between threads.
//!
//! Pausing exists for two reasons. List-mutating instrumentation must not add
//! dependencies while it reads its own bookkeeping, and the dirty probe must
//! neither add dependencies nor schedule downstream effects while it
//! re-evaluates computed sources. Scheduler callbacks produced while the
//! pause depth is above zero accumulate in a FIFO buffer and drain when the
//! depth returns to zero.

use crate::effect::EffectId;
use std::cell::{Cell, RefCell};

thread_local! {
    static ACTIVE_EFFECT: Cell<Option<EffectId>> = const { Cell::new(None) };
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
    static TRACK_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    static PAUSE_SCHEDULE_DEPTH: Cell<u32> = const { Cell::new(0) };
    static DEFERRED_SCHEDULERS: RefCell<Vec<EffectId>> = const { RefCell::new(Vec::new()) };
}

/// The effect currently running on this thread, if any.
pub fn active_effect() -> Option<EffectId> {
    ACTIVE_EFFECT.with(Cell::get)
}

pub(crate) fn set_active_effect(effect: Option<EffectId>) -> Option<EffectId> {
    ACTIVE_EFFECT.with(|c| c.replace(effect))
}

/// Whether reads are currently being recorded as dependencies.
pub fn should_track() -> bool {
    SHOULD_TRACK.with(Cell::get)
}

/// Push the current should-track flag and disable tracking.
pub fn pause_tracking() {
    TRACK_STACK.with(|s| s.borrow_mut().push(should_track()));
    SHOULD_TRACK.with(|c| c.set(false));
}

/// Push the current should-track flag and enable tracking.
pub fn enable_tracking() {
    TRACK_STACK.with(|s| s.borrow_mut().push(should_track()));
    SHOULD_TRACK.with(|c| c.set(true));
}

/// Pop the should-track stack. An empty stack restores the default (`true`).
pub fn reset_tracking() {
    let restored = TRACK_STACK.with(|s| s.borrow_mut().pop()).unwrap_or(true);
    SHOULD_TRACK.with(|c| c.set(restored));
}

/// Run a closure without recording any dependencies.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct ResetGuard;
    impl Drop for ResetGuard {
        fn drop(&mut self) {
            reset_tracking();
        }
    }

    pause_tracking();
    let _guard = ResetGuard;
    f()
}

/// Defer scheduler enqueues until the matching [`reset_scheduling`].
pub fn pause_scheduling() {
    PAUSE_SCHEDULE_DEPTH.with(|d| d.set(d.get() + 1));
}

/// Decrement the pause depth; at zero, drain the deferred scheduler buffer
/// in FIFO order.
pub fn reset_scheduling() {
    let depth = PAUSE_SCHEDULE_DEPTH.with(|d| {
        let v = d.get().saturating_sub(1);
        d.set(v);
        v
    });
    if depth == 0 {
        drain_deferred();
    }
}

/// Queue an effect's scheduler for invocation at the next depth-zero drain.
pub(crate) fn defer_scheduler(effect: EffectId) {
    DEFERRED_SCHEDULERS.with(|q| q.borrow_mut().push(effect));
}

fn drain_deferred() {
    loop {
        // A drained scheduler may itself pause scheduling; its entries drain
        // when its own reset reaches zero.
        if pause_schedule_depth() > 0 {
            break;
        }
        let next = DEFERRED_SCHEDULERS.with(|q| {
            let mut q = q.borrow_mut();
            if q.is_empty() {
                None
            } else {
                Some(q.remove(0))
            }
        });
        match next {
            Some(effect) => effect.call_scheduler(),
            None => break,
        }
    }
}

pub(crate) fn pause_schedule_depth() -> u32 {
    PAUSE_SCHEDULE_DEPTH.with(Cell::get)
}

/// RAII guard around an effect run: installs the effect as active with
/// tracking enabled and restores the previous state on drop, panics included.
pub(crate) struct EffectRunGuard {
    prev_effect: Option<EffectId>,
    prev_should_track: bool,
}

impl EffectRunGuard {
    pub(crate) fn new(effect: EffectId) -> Self {
        let prev_effect = set_active_effect(Some(effect));
        let prev_should_track = SHOULD_TRACK.with(|c| c.replace(true));
        EffectRunGuard {
            prev_effect,
            prev_should_track,
        }
    }
}

impl Drop for EffectRunGuard {
    fn drop(&mut self) {
        set_active_effect(self.prev_effect);
        SHOULD_TRACK.with(|c| c.set(self.prev_should_track));
    }
}
