#![deny(missing_docs)]

//! Fine-grained reactivity with a cooperative microtask-style scheduler
//!
//! This crate observes reads and writes against reactive containers,
//! maintains a precise subscription graph from data locations to dependent
//! computations (effects), and re-executes those computations in a
//! deterministic order when their inputs change, batched through a single
//! scheduler drain per checkpoint.
//!
//! # Quick Start
//!
//! ```ignore
//! use ripple::{effect, flush_jobs, reactive, Key, Target, Value};
//!
//! let state = reactive(Target::record([(Key::str("count"), Value::Int(0))]));
//!
//! // Effects run immediately and auto-track every location they read.
//! let view = state.clone();
//! let runner = effect(move || {
//!     println!("count = {:?}", view.get(&Key::str("count")));
//! });
//!
//! // A write invalidates the effect and queues its re-run.
//! state.set(Key::str("count"), Value::Int(1));
//!
//! // The host drains the scheduler at its next checkpoint.
//! flush_jobs();
//!
//! runner.stop();
//! ```
//!
//! # Core Types
//!
//! - [`Target`] / [`Value`] / [`Key`] - dynamically keyed reactive containers.
//! - [`Reactive`] - a trap handle over a target; four variants (mutable or
//!   readonly, deep or shallow) share one method table.
//! - [`Effect`] - a re-runnable computation with a reconciled dependency
//!   list, a three-level dirty state, and an optional scheduler.
//! - [`Dep`] - the subscription set for one tracked location.
//! - [`Job`] - a schedulable unit ordered by `(id, pre)`.
//!
//! # Tracking and Triggering
//!
//! ```ignore
//! // Custom wrappers use the same entry points the trap layer does:
//! track(&target, TrackOp::Get, Key::str("k"));
//! trigger(&target, TriggerOp::Set, Some(Key::str("k")), Some(&new), Some(&old));
//!
//! // Or the dep-level seam, for wrappers that own their dep (refs, computeds):
//! track_effect(&dep);
//! trigger_effects(&dep, DirtyLevel::Dirty);
//! ```
//!
//! # Batching
//!
//! ```ignore
//! // Scheduler enqueues between pause and reset accumulate, so a batch of
//! // mutations produces at most one scheduler invocation per effect.
//! pause_scheduling();
//! state.set(Key::str("a"), Value::Int(1));
//! state.set(Key::str("b"), Value::Int(2));
//! reset_scheduling();
//! ```
//!
//! # Driving the Scheduler
//!
//! The runtime is cooperative: exactly one suspension point exists, between
//! a flush becoming pending and the host draining it. An event loop
//! integrates with a wake hook:
//!
//! ```ignore
//! set_wake_hook(|| loop_handle.post(flush_jobs));
//! next_tick(|| println!("runs after the flush completes"));
//! ```

mod dep;
mod effect;
mod error;
mod handle;
mod hash;
mod ops;
mod reference;
mod scheduler;
mod scope;
mod target;
mod tracking;

pub use dep::{ComputedSource, Dep};
pub use effect::{
    effect, effect_with, stop, track_effect, trigger_effects, DirtyLevel, Effect, EffectId,
    EffectOptions, EffectScheduler,
};
pub use error::{clear_error_handler, set_error_handler, ErrorCode, ErrorEvent};
pub use handle::{reactive, readonly, shallow_reactive, shallow_readonly, Reactive};
pub use ops::{DebugEventKind, DebuggerEvent, Key, Symbol, TrackOp, TriggerOp};
pub use reference::RefSlot;
pub use scheduler::{
    flush_jobs, flush_post_flush_cbs, flush_pre_flush_cbs, invalidate_job, is_flush_pending,
    next_tick, queue_job, queue_post_flush_cb, queue_post_flush_cbs, set_wake_hook, Job,
    JobBuilder,
};
pub use scope::{on_scope_dispose, record_effect_scope, EffectScope};
pub use target::{
    get_dep_from_reactive, track, trigger, ObjRef, Store, Target, TargetRef, Value, ViewKind,
};
pub use tracking::{
    active_effect, enable_tracking, pause_scheduling, pause_tracking, reset_scheduling,
    reset_tracking, should_track, untracked,
};
