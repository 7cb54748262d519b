//! The effect engine: re-runnable computations with precise dependency edges.
//!
//! Effect metadata lives in a global slab arena behind a lock, in the same
//! shape as the rest of the runtime's storage: an [`EffectId`] is a stale-safe
//! index, and accessing a removed effect is a no-op rather than an error.
//! Scalar state (dirty level, track-id, running depth) is atomic so it can be
//! read without taking callback locks; callbacks are taken out of their cells
//! while running and restored by drop guards, so a panicking user closure
//! never loses the callback or corrupts bookkeeping.
//!
//! # Edge reconciliation
//!
//! Every run increments the effect's track-id and resets its dep cursor.
//! `track` rewrites dep slots in place as the run touches locations in order;
//! when consecutive runs touch the same deps in the same order (the common
//! case) no allocation or cleanup happens at all. Slots beyond the cursor at
//! run end are unsubscribed, and a dep whose stored track-id no longer
//! matches its effect's is reclaimed on the next touch.

use crate::dep::Dep;
use crate::ops::{DebugEventKind, DebuggerEvent, Key, TrackOp};
use crate::scheduler::{queue_job, Job};
use crate::scope::{record_scope_id, EffectScope};
use crate::tracking::{self, EffectRunGuard};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// How stale an effect currently is.
///
/// Levels only upgrade between runs (`NotDirty` → `MaybeDirty` → `Dirty`);
/// a run resets the level to `NotDirty` before executing.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirtyLevel {
    /// Up to date.
    NotDirty = 0,
    /// An upstream computed may have changed; must be probed.
    MaybeDirty = 1,
    /// Must re-run.
    Dirty = 2,
}

impl DirtyLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DirtyLevel::NotDirty,
            1 => DirtyLevel::MaybeDirty,
            _ => DirtyLevel::Dirty,
        }
    }
}

type EffectFn = Box<dyn FnMut() + Send>;
type DebugHookFn = Box<dyn FnMut(&DebuggerEvent) + Send>;

/// Global effect arena.
static EFFECT_ARENA: RwLock<Slab<EffectMeta>> = RwLock::new(Slab::new());

/// Monotonic creation-order uid, used as the default scheduler job id so
/// earlier-created effects flush before later ones.
static NEXT_EFFECT_UID: AtomicU32 = AtomicU32::new(1);

struct DepList {
    deps: Vec<Arc<Dep>>,
    /// The dep cursor: slots below this index were touched by the current
    /// (or last completed) run.
    len: usize,
}

pub(crate) struct EffectMeta {
    uid: u32,
    active: AtomicBool,
    allow_recurse: bool,
    dirty_level: AtomicU8,
    track_id: AtomicU32,
    runnings: AtomicU32,
    should_schedule: AtomicBool,
    deps: Mutex<DepList>,
    func: Mutex<Option<EffectFn>>,
    trigger_hook: Mutex<Option<EffectFn>>,
    scheduler: Mutex<Option<EffectFn>>,
    on_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    on_track: Mutex<Option<DebugHookFn>>,
    on_trigger: Mutex<Option<DebugHookFn>>,
}

/// Stale-safe index of an effect in the arena.
///
/// When the owning [`Effect`] is dropped the id goes stale; every operation
/// on a stale id is inert.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId(u32);

impl EffectId {
    fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) fn from_raw(index: u32) -> Self {
        EffectId(index)
    }

    /// Access the effect metadata. Returns `None` for stale ids.
    fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectMeta) -> R,
    {
        let arena = EFFECT_ARENA.read();
        arena.get(self.index()).map(f)
    }

    pub(crate) fn is_active(self) -> bool {
        self.with(|m| m.active.load(Ordering::Relaxed)).unwrap_or(false)
    }

    /// Creation uid of the effect currently occupying this slot. Arena slots
    /// are reused, so a queued job compares this against the uid it was built
    /// for before acting on the id.
    pub(crate) fn uid(self) -> Option<u32> {
        self.with(|m| m.uid)
    }

    pub(crate) fn allow_recurse(self) -> bool {
        self.with(|m| m.allow_recurse).unwrap_or(false)
    }

    pub(crate) fn dirty_level(self) -> DirtyLevel {
        self.with(|m| DirtyLevel::from_u8(m.dirty_level.load(Ordering::Relaxed)))
            .unwrap_or(DirtyLevel::NotDirty)
    }

    pub(crate) fn set_dirty_level(self, level: DirtyLevel) {
        self.with(|m| m.dirty_level.store(level as u8, Ordering::Relaxed));
    }

    pub(crate) fn track_id(self) -> u32 {
        self.with(|m| m.track_id.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub(crate) fn runnings(self) -> u32 {
        self.with(|m| m.runnings.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub(crate) fn should_schedule(self) -> bool {
        self.with(|m| m.should_schedule.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub(crate) fn set_should_schedule(self, v: bool) {
        self.with(|m| m.should_schedule.store(v, Ordering::Relaxed));
    }

    pub(crate) fn has_scheduler(self) -> bool {
        self.with(|m| m.scheduler.lock().is_some()).unwrap_or(false)
    }

    /// Execute the effect with tracking enabled and this effect active.
    pub(crate) fn run(self) {
        self.set_dirty_level(DirtyLevel::NotDirty);
        if !self.is_active() {
            // Inert effects run the raw closure under the ambient context.
            take_and_call(self, |m| &m.func);
            return;
        }

        struct FinishGuard(EffectId);
        impl Drop for FinishGuard {
            fn drop(&mut self) {
                self.0.post_cleanup();
                self.0.with(|m| m.runnings.fetch_sub(1, Ordering::Relaxed));
            }
        }

        let _outer = EffectRunGuard::new(self);
        self.with(|m| m.runnings.fetch_add(1, Ordering::Relaxed));
        self.pre_cleanup();
        let _finish = FinishGuard(self);
        take_and_call(self, |m| &m.func);
    }

    /// Mark all edges from the previous run as stale by id and rewind the
    /// dep cursor.
    fn pre_cleanup(self) {
        self.with(|m| {
            m.track_id.fetch_add(1, Ordering::Relaxed);
            m.deps.lock().len = 0;
        });
    }

    /// Unsubscribe from every dep the current run did not touch.
    fn post_cleanup(self) {
        let tail: SmallVec<[Arc<Dep>; 4]> = self
            .with(|m| {
                let mut list = m.deps.lock();
                if list.deps.len() > list.len {
                    let split_at = list.len;
                    list.deps.split_off(split_at).into_iter().collect()
                } else {
                    SmallVec::new()
                }
            })
            .unwrap_or_default();
        for dep in &tail {
            cleanup_dep_effect(dep, self);
        }
    }

    /// Deactivate the effect, unsubscribing it everywhere. Idempotent.
    pub(crate) fn stop(self) {
        if !self.is_active() {
            return;
        }
        self.pre_cleanup();
        self.post_cleanup();
        let on_stop = self.with(|m| m.on_stop.lock().take()).flatten();
        if let Some(cb) = on_stop {
            cb();
        }
        self.with(|m| m.active.store(false, Ordering::Relaxed));
    }

    /// Whether the effect must re-run, probing computed sources if the level
    /// is `MaybeDirty`.
    ///
    /// The probe walks the current run's deps (`deps[..len]`); outside a run
    /// that is exactly the last completed run's edge set. Probing must not
    /// add dependencies or schedule downstream effects, so it runs under
    /// paired tracking and scheduling pauses.
    pub(crate) fn dirty(self) -> bool {
        if self.dirty_level() == DirtyLevel::MaybeDirty {
            tracking::pause_tracking();
            tracking::pause_scheduling();
            let probe: SmallVec<[Arc<Dep>; 8]> = self
                .with(|m| {
                    let list = m.deps.lock();
                    list.deps[..list.len].iter().cloned().collect()
                })
                .unwrap_or_default();
            for dep in &probe {
                if let Some(computed) = dep.computed() {
                    computed.refresh();
                    if self.dirty_level() >= DirtyLevel::Dirty {
                        cov_mark::hit!(probe_upgraded_to_dirty);
                        break;
                    }
                }
            }
            if self.dirty_level() < DirtyLevel::Dirty {
                cov_mark::hit!(probe_settled_clean);
                self.set_dirty_level(DirtyLevel::NotDirty);
            }
            tracking::reset_scheduling();
            tracking::reset_tracking();
        }
        self.dirty_level() >= DirtyLevel::Dirty
    }

    pub(crate) fn set_dirty(self, dirty: bool) {
        self.set_dirty_level(if dirty {
            DirtyLevel::Dirty
        } else {
            DirtyLevel::NotDirty
        });
    }

    pub(crate) fn call_scheduler(self) {
        take_and_call(self, |m| &m.scheduler);
    }

    fn call_trigger_hook(self) {
        take_and_call(self, |m| &m.trigger_hook);
    }

    fn call_on_track(self, op: TrackOp, key: Option<&Key>) {
        let installed = self.with(|m| m.on_track.lock().is_some()).unwrap_or(false);
        if !installed {
            return;
        }
        let event = DebuggerEvent {
            kind: DebugEventKind::Track(op),
            key: key.cloned(),
        };
        take_and_call_debug(self, |m| &m.on_track, &event);
    }

    fn call_on_trigger(self, event: Option<&DebuggerEvent>) {
        let Some(event) = event else { return };
        let installed = self.with(|m| m.on_trigger.lock().is_some()).unwrap_or(false);
        if !installed {
            return;
        }
        take_and_call_debug(self, |m| &m.on_trigger, event);
    }

    // Test introspection.

    #[cfg(test)]
    pub(crate) fn deps_storage_len(self) -> usize {
        self.with(|m| m.deps.lock().deps.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn deps_cursor(self) -> usize {
        self.with(|m| m.deps.lock().len).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn dep_at(self, i: usize) -> Option<Arc<Dep>> {
        self.with(|m| m.deps.lock().deps.get(i).cloned()).flatten()
    }
}

/// Run a stored callback without holding its cell, restoring it afterwards.
///
/// The callback is taken out so the closure can re-enter the effect (tracking,
/// nested runs) without deadlocking on its own cell; the drop guard restores
/// it even if the closure panics.
fn take_and_call(id: EffectId, pick: fn(&EffectMeta) -> &Mutex<Option<EffectFn>>) {
    struct Restore {
        id: EffectId,
        pick: fn(&EffectMeta) -> &Mutex<Option<EffectFn>>,
        cb: Option<EffectFn>,
    }
    impl Drop for Restore {
        fn drop(&mut self) {
            if let Some(cb) = self.cb.take() {
                let arena = EFFECT_ARENA.read();
                if let Some(meta) = arena.get(self.id.index()) {
                    let mut slot = (self.pick)(meta).lock();
                    if slot.is_none() {
                        *slot = Some(cb);
                    }
                }
            }
        }
    }

    let cb = {
        let arena = EFFECT_ARENA.read();
        arena.get(id.index()).and_then(|meta| (pick)(meta).lock().take())
    };
    if let Some(cb) = cb {
        let mut guard = Restore {
            id,
            pick,
            cb: Some(cb),
        };
        if let Some(f) = guard.cb.as_mut() {
            f();
        }
    }
}

fn take_and_call_debug(
    id: EffectId,
    pick: fn(&EffectMeta) -> &Mutex<Option<DebugHookFn>>,
    event: &DebuggerEvent,
) {
    let cb = {
        let arena = EFFECT_ARENA.read();
        arena.get(id.index()).and_then(|meta| (pick)(meta).lock().take())
    };
    if let Some(mut cb) = cb {
        cb(event);
        let arena = EFFECT_ARENA.read();
        if let Some(meta) = arena.get(id.index()) {
            let mut slot = (pick)(meta).lock();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

/// Associate the active effect with a dep.
///
/// This is the dep-level seam used by custom wrappers (refs, computed
/// outputs): it applies the same incremental edge-update protocol the target
/// map uses, and is a no-op unless tracking is enabled and an effect is
/// running.
pub fn track_effect(dep: &Arc<Dep>) {
    if !tracking::should_track() {
        return;
    }
    let Some(effect) = tracking::active_effect() else {
        return;
    };
    link_effect(effect, dep, TrackOp::Get, None);
}

/// The incremental edge-update protocol of `track`.
pub(crate) fn link_effect(effect: EffectId, dep: &Arc<Dep>, op: TrackOp, key: Option<&Key>) {
    let track_id = effect.track_id();
    if dep.get(effect) == Some(track_id) {
        // Already touched this run.
        return;
    }
    dep.insert(effect, track_id);
    let displaced = effect
        .with(|m| {
            let mut list = m.deps.lock();
            let slot = list.len;
            let old = list.deps.get(slot).cloned();
            let reused = matches!(&old, Some(o) if Arc::ptr_eq(o, dep));
            if reused {
                cov_mark::hit!(dep_slot_reused);
            } else if slot < list.deps.len() {
                list.deps[slot] = dep.clone();
            } else {
                list.deps.push(dep.clone());
            }
            list.len += 1;
            if reused {
                None
            } else {
                old
            }
        })
        .flatten();
    if let Some(old) = displaced {
        cleanup_dep_effect(&old, effect);
    }
    if cfg!(debug_assertions) {
        effect.call_on_track(op, key);
    }
}

/// Drop an effect's edge from a dep if the edge is stale, firing the dep's
/// cleanup when the removal empties it.
pub(crate) fn cleanup_dep_effect(dep: &Arc<Dep>, effect: EffectId) {
    let track_id = effect.track_id();
    if let Some(stored) = dep.get(effect) {
        if stored != track_id && dep.remove(effect) {
            cov_mark::hit!(dep_cleanup_fired);
            dep.run_cleanup();
        }
    }
}

/// Lift every live subscriber of a dep to `dirty_level`.
///
/// Subscribers lifted out of `NotDirty` have their trigger hook invoked
/// synchronously (this is how a computed propagates `MaybeDirty` downstream
/// without running anything). Scheduler enqueues produced here are deferred
/// through the pause-scheduling buffer, so a batch of mutations yields at
/// most one scheduler invocation per effect.
pub fn trigger_effects(dep: &Arc<Dep>, dirty_level: DirtyLevel) {
    trigger_effects_with(dep, dirty_level, None);
}

pub(crate) fn trigger_effects_with(
    dep: &Arc<Dep>,
    dirty_level: DirtyLevel,
    debug: Option<&DebuggerEvent>,
) {
    tracking::pause_scheduling();
    for effect in dep.snapshot() {
        if effect.dirty_level() < dirty_level && dep.get(effect) == Some(effect.track_id()) {
            let last = effect.dirty_level();
            effect.set_dirty_level(dirty_level);
            if last == DirtyLevel::NotDirty {
                effect.set_should_schedule(true);
                if cfg!(debug_assertions) {
                    effect.call_on_trigger(debug);
                }
                effect.call_trigger_hook();
            }
        }
    }
    schedule_effects(dep);
    tracking::reset_scheduling();
}

/// Queue the schedulers of a dep's invalidated subscribers.
pub(crate) fn schedule_effects(dep: &Arc<Dep>) {
    for effect in dep.snapshot() {
        if effect.has_scheduler()
            && effect.should_schedule()
            && (effect.runnings() == 0 || effect.allow_recurse())
            && dep.get(effect) == Some(effect.track_id())
        {
            effect.set_should_schedule(false);
            tracking::defer_scheduler(effect);
        }
    }
}

/// How an invalidated effect gets re-run.
#[derive(Default)]
pub enum EffectScheduler {
    /// Queue a run-if-dirty job on the scheduler, keyed by the effect's
    /// creation uid; the job runs at the next flush.
    #[default]
    Microtask,
    /// A caller-supplied callback, invoked once per invalidation batch.
    Custom(Box<dyn FnMut() + Send>),
    /// No scheduler: the effect only goes dirty and the owner re-runs it
    /// (how computed collaborators drive their inner effect).
    Manual,
}

/// Options for [`effect_with`].
#[derive(Default)]
pub struct EffectOptions {
    /// Skip the initial run.
    pub lazy: bool,
    /// Let the effect re-enqueue itself while it is running.
    pub allow_recurse: bool,
    /// Re-run strategy; defaults to the queued microtask job.
    pub scheduler: EffectScheduler,
    /// Synchronous invalidation hook, invoked when the effect's dirty level
    /// is lifted out of `NotDirty`. Distinct from the scheduler.
    pub trigger: Option<Box<dyn FnMut() + Send>>,
    /// Register with this scope instead of the currently active one.
    pub scope: Option<EffectScope>,
    /// Invoked once when the effect is stopped.
    pub on_stop: Option<Box<dyn FnOnce() + Send>>,
    /// Debug hook for recorded edges (development builds only).
    pub on_track: Option<Box<dyn FnMut(&DebuggerEvent) + Send>>,
    /// Debug hook for invalidations (development builds only).
    pub on_trigger: Option<Box<dyn FnMut(&DebuggerEvent) + Send>>,
}

/// Owning handle for a reactive effect.
///
/// Dropping the handle stops the effect and releases its arena slot; ids held
/// elsewhere (queued jobs, scopes, deps) go stale and become inert.
pub struct Effect {
    id: EffectId,
}

impl Effect {
    /// Re-run the effect now.
    pub fn run(&self) {
        self.id.run();
    }

    /// Deactivate the effect. Idempotent.
    pub fn stop(&self) {
        self.id.stop();
    }

    /// Whether the effect must re-run; probes computed sources when the
    /// level is `MaybeDirty`.
    pub fn dirty(&self) -> bool {
        self.id.dirty()
    }

    /// Force the dirty level to `Dirty` or `NotDirty`.
    pub fn set_dirty(&self, dirty: bool) {
        self.id.set_dirty(dirty);
    }

    /// Whether the effect has not been stopped.
    pub fn is_active(&self) -> bool {
        self.id.is_active()
    }

    pub(crate) fn id(&self) -> EffectId {
        self.id
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.id.stop();
        let mut arena = EFFECT_ARENA.write();
        if arena.contains(self.id.index()) {
            arena.remove(self.id.index());
        }
    }
}

/// Create an effect and run it immediately.
pub fn effect<F>(f: F) -> Effect
where
    F: FnMut() + Send + 'static,
{
    effect_with(f, EffectOptions::default())
}

/// Create an effect with explicit options, running it unless `lazy`.
pub fn effect_with<F>(f: F, options: EffectOptions) -> Effect
where
    F: FnMut() + Send + 'static,
{
    let uid = NEXT_EFFECT_UID.fetch_add(1, Ordering::Relaxed);
    let meta = EffectMeta {
        uid,
        active: AtomicBool::new(true),
        allow_recurse: options.allow_recurse,
        dirty_level: AtomicU8::new(DirtyLevel::Dirty as u8),
        track_id: AtomicU32::new(0),
        runnings: AtomicU32::new(0),
        should_schedule: AtomicBool::new(false),
        deps: Mutex::new(DepList {
            deps: Vec::new(),
            len: 0,
        }),
        func: Mutex::new(Some(Box::new(f))),
        trigger_hook: Mutex::new(options.trigger),
        scheduler: Mutex::new(None),
        on_stop: Mutex::new(options.on_stop),
        on_track: Mutex::new(options.on_track),
        on_trigger: Mutex::new(options.on_trigger),
    };
    let id = {
        let mut arena = EFFECT_ARENA.write();
        let entry = arena.vacant_entry();
        let key = entry.key();
        entry.insert(meta);
        EffectId(key as u32)
    };

    let scheduler: Option<EffectFn> = match options.scheduler {
        EffectScheduler::Custom(s) => Some(s),
        EffectScheduler::Manual => None,
        EffectScheduler::Microtask => {
            let mut builder = Job::builder().id(uid);
            if options.allow_recurse {
                builder = builder.allow_recurse();
            }
            let job = builder
                .build(move || {
                    // A stop between trigger and drain must not resurrect the
                    // raw closure, and a reused arena slot must not run a
                    // stranger's effect.
                    if id.uid() == Some(uid) && id.is_active() && id.dirty() {
                        id.run();
                    }
                });
            Some(Box::new(move || queue_job(&job)))
        }
    };
    if let Some(s) = scheduler {
        id.with(|m| *m.scheduler.lock() = Some(s));
    }

    record_scope_id(id, options.scope.as_ref());
    if !options.lazy {
        id.run();
    }
    Effect { id }
}

/// Stop a runner. Equivalent to [`Effect::stop`].
pub fn stop(runner: &Effect) {
    runner.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn effect_runs_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let _e = effect(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lazy_effect_waits_for_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let e = effect_with(
            move || {
                runs_clone.fetch_add(1, Ordering::Relaxed);
            },
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        e.run();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stop_is_idempotent_and_fires_on_stop_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stops_clone = stops.clone();
        let e = effect_with(
            || {},
            EffectOptions {
                on_stop: Some(Box::new(move || {
                    stops_clone.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        );
        e.stop();
        e.stop();
        assert_eq!(stops.load(Ordering::Relaxed), 1);
        assert!(!e.is_active());
    }

    #[test]
    fn stopped_effect_runs_raw_without_tracking() {
        let dep = Dep::standalone();
        let dep_clone = dep.clone();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let e = effect(move || {
            track_effect(&dep_clone);
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(dep.len(), 1);

        e.stop();
        assert_eq!(dep.len(), 0);

        // Inert run executes the closure but records no edges.
        e.run();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(dep.len(), 0);
    }

    #[test]
    fn trigger_lifts_dirty_level_and_invokes_trigger_hook() {
        let dep = Dep::standalone();
        let dep_clone = dep.clone();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_calls_clone = hook_calls.clone();
        let e = effect_with(
            move || {
                track_effect(&dep_clone);
            },
            EffectOptions {
                scheduler: EffectScheduler::Manual,
                trigger: Some(Box::new(move || {
                    hook_calls_clone.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        );
        assert!(!e.dirty());

        trigger_effects(&dep, DirtyLevel::Dirty);
        assert_eq!(hook_calls.load(Ordering::Relaxed), 1);
        assert!(e.dirty());

        // Already dirty: no second hook invocation.
        trigger_effects(&dep, DirtyLevel::Dirty);
        assert_eq!(hook_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_closure_restores_tracking_state() {
        let boom = Arc::new(AtomicUsize::new(0));
        let boom_clone = boom.clone();
        let e = effect_with(
            move || {
                if boom_clone.fetch_add(1, Ordering::Relaxed) > 0 {
                    panic!("effect body panicked");
                }
            },
            EffectOptions::default(),
        );

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| e.run()));
        assert!(result.is_err());
        assert!(tracking::active_effect().is_none());
        assert!(tracking::should_track());

        // The closure survived the panic and can run again.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| e.run()));
        assert!(result.is_err());
        assert_eq!(boom.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn repeated_reads_create_one_edge() {
        let dep = Dep::standalone();
        let dep_clone = dep.clone();
        let e = effect(move || {
            track_effect(&dep_clone);
            track_effect(&dep_clone);
            track_effect(&dep_clone);
        });
        assert_eq!(dep.len(), 1);
        assert_eq!(e.id().deps_cursor(), 1);
        assert_eq!(e.id().deps_storage_len(), 1);
    }

    #[test]
    fn stable_dep_sequence_reuses_slots() {
        let a = Dep::standalone();
        let b = Dep::standalone();
        let a2 = a.clone();
        let b2 = b.clone();
        let e = effect(move || {
            track_effect(&a2);
            track_effect(&b2);
        });
        assert_eq!(e.id().deps_storage_len(), 2);

        {
            cov_mark::check_count!(dep_cleanup_fired, 0);
            e.run();
        }
        assert_eq!(e.id().deps_storage_len(), 2);
        assert_eq!(e.id().deps_cursor(), 2);
        assert!(Arc::ptr_eq(&e.id().dep_at(0).unwrap(), &a));
        assert!(Arc::ptr_eq(&e.id().dep_at(1).unwrap(), &b));
    }
}
