//! The cooperative job scheduler.
//!
//! Jobs queue in `(id, pre)` order and drain in a single FIFO pass per
//! checkpoint. Ascending id means owners created earlier (lower id) update
//! before things created later, so parents run before children; `pre` jobs run
//! before non-`pre` jobs at the same id so early-phase watchers observe state
//! consistent with the work that follows. Jobs without an id sort last.
//!
//! There is exactly one suspension point in the runtime: between
//! [`queue_flush`] marking a flush pending and the host invoking
//! [`flush_jobs`] at its next checkpoint. Everything else runs to completion
//! synchronously. A host event loop integrates by installing a wake hook
//! (see [`set_wake_hook`]) and calling `flush_jobs` when it fires.
//!
//! All scheduler state is thread-local: the runtime is single-threaded and
//! cooperative per thread, so no locks guard the queues.

use crate::error::{handle_error, panic_message, ErrorCode, ErrorEvent};
use crate::hash::FixedHashBuilder;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type JobFn = Box<dyn FnMut() + Send>;

/// A job invoked at most 100 times per flush before the recursion guard
/// reports it and skips it for the rest of the flush.
const RECURSION_LIMIT: u32 = 100;

/// A schedulable unit of work.
///
/// Identity is the allocation: queue deduplication and invalidation compare
/// job handles by pointer, so requeueing the same handle while it is already
/// pending is a no-op (unless the job allows recursion and is currently
/// running).
pub struct Job {
    cb: Mutex<Option<JobFn>>,
    id: Option<u32>,
    pre: bool,
    allow_recurse: bool,
    active: AtomicBool,
}

impl Job {
    /// A job with no id (sorts last) and default flags.
    pub fn new(f: impl FnMut() + Send + 'static) -> Arc<Job> {
        Job::builder().build(f)
    }

    /// Configure a job before building it.
    pub fn builder() -> JobBuilder {
        JobBuilder {
            id: None,
            pre: false,
            allow_recurse: false,
        }
    }

    /// The ordering id, if any.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Whether this is an early-phase job.
    pub fn is_pre(&self) -> bool {
        self.pre
    }

    /// Whether the job will run when reached. Inactive jobs are skipped.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Activate or deactivate the job in place.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Run the callback, taking it out of its cell for the duration so the
    /// job can requeue itself; a drop guard restores it even on panic.
    pub(crate) fn invoke(&self) {
        struct Restore<'a> {
            job: &'a Job,
            cb: Option<JobFn>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if let Some(cb) = self.cb.take() {
                    let mut slot = self.job.cb.lock();
                    if slot.is_none() {
                        *slot = Some(cb);
                    }
                }
            }
        }

        let cb = self.cb.lock().take();
        if let Some(cb) = cb {
            let mut guard = Restore {
                job: self,
                cb: Some(cb),
            };
            if let Some(f) = guard.cb.as_mut() {
                f();
            }
        }
    }
}

/// Builder for [`Job`].
pub struct JobBuilder {
    id: Option<u32>,
    pre: bool,
    allow_recurse: bool,
}

impl JobBuilder {
    /// Set the ordering id. Smaller ids run earlier; jobs without an id run
    /// last.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Mark the job as early-phase: it sorts before non-`pre` jobs with the
    /// same id.
    pub fn pre(mut self) -> Self {
        self.pre = true;
        self
    }

    /// Let the job requeue itself while it is running.
    pub fn allow_recurse(mut self) -> Self {
        self.allow_recurse = true;
        self
    }

    /// Build the job around its callback.
    pub fn build(self, f: impl FnMut() + Send + 'static) -> Arc<Job> {
        Arc::new(Job {
            cb: Mutex::new(Some(Box::new(f))),
            id: self.id,
            pre: self.pre,
            allow_recurse: self.allow_recurse,
            active: AtomicBool::new(true),
        })
    }
}

struct Scheduler {
    queue: Vec<Arc<Job>>,
    flush_index: usize,
    pending_post: Vec<Arc<Job>>,
    active_post: Option<Vec<Arc<Job>>>,
    post_index: usize,
    is_flushing: bool,
    is_flush_pending: bool,
    tick_cbs: Vec<Box<dyn FnOnce()>>,
    wake_hook: Option<Box<dyn Fn()>>,
}

impl Scheduler {
    const fn new() -> Self {
        Scheduler {
            queue: Vec::new(),
            flush_index: 0,
            pending_post: Vec::new(),
            active_post: None,
            post_index: 0,
            is_flushing: false,
            is_flush_pending: false,
            tick_cbs: Vec::new(),
            wake_hook: None,
        }
    }

    /// Smallest index in `[flush_index + 1, len)` whose job has a larger id,
    /// or an equal id without `pre`.
    fn find_insertion_index(&self, id: u64) -> usize {
        let mut start = (self.flush_index + 1).min(self.queue.len());
        let mut end = self.queue.len();
        while start < end {
            let middle = (start + end) >> 1;
            let middle_job = &self.queue[middle];
            let middle_id = sort_id(middle_job);
            if middle_id < id || (middle_id == id && middle_job.pre) {
                start = middle + 1;
            } else {
                end = middle;
            }
        }
        start
    }
}

thread_local! {
    static SCHEDULER: RefCell<Scheduler> = const { RefCell::new(Scheduler::new()) };
}

fn sort_id(job: &Job) -> u64 {
    job.id.map(u64::from).unwrap_or(u64::MAX)
}

fn job_order(a: &Arc<Job>, b: &Arc<Job>) -> std::cmp::Ordering {
    sort_id(a).cmp(&sort_id(b)).then_with(|| match (a.pre, b.pre) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => std::cmp::Ordering::Equal,
    })
}

/// Queue a job in sorted position, deduplicated against the pending range.
///
/// While flushing, a job that allows recursion is compared against the range
/// after the currently running index, so it can requeue itself; every job is
/// otherwise enqueued at most once per flush. A job is never inserted at or
/// before the running index.
pub fn queue_job(job: &Arc<Job>) {
    let added = SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        let start = if s.is_flushing && job.allow_recurse {
            s.flush_index + 1
        } else {
            s.flush_index
        };
        let pending = s.queue.get(start..).unwrap_or(&[]);
        if pending.iter().any(|queued| Arc::ptr_eq(queued, job)) {
            return false;
        }
        match job.id {
            None => s.queue.push(job.clone()),
            Some(id) => {
                let at = s.find_insertion_index(u64::from(id));
                s.queue.insert(at, job.clone());
            }
        }
        true
    });
    if added {
        queue_flush();
    }
}

/// Mark a flush pending and wake the host, unless one is already pending or
/// in progress.
fn queue_flush() {
    let should_wake = SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        if !s.is_flushing && !s.is_flush_pending {
            s.is_flush_pending = true;
            true
        } else {
            false
        }
    });
    if should_wake {
        // Take the hook out so it can call back into the scheduler.
        let hook = SCHEDULER.with(|s| s.borrow_mut().wake_hook.take());
        if let Some(hook) = hook {
            hook();
            SCHEDULER.with(|s| {
                let mut s = s.borrow_mut();
                if s.wake_hook.is_none() {
                    s.wake_hook = Some(hook);
                }
            });
        }
    }
}

/// Whether a flush has been requested but not yet drained.
pub fn is_flush_pending() -> bool {
    SCHEDULER.with(|s| s.borrow().is_flush_pending)
}

/// Install this thread's wake hook, invoked whenever a flush becomes pending.
///
/// A host event loop uses this to schedule a [`flush_jobs`] call at its next
/// checkpoint.
pub fn set_wake_hook(hook: impl Fn() + 'static) {
    SCHEDULER.with(|s| s.borrow_mut().wake_hook = Some(Box::new(hook)));
}

/// Queue a callback to run after the main pass of the current or next flush.
///
/// Scalar callbacks are deduplicated against the in-flight post-flush
/// snapshot (with the recursion offset); use [`queue_post_flush_cbs`] for
/// pre-deduplicated batches.
pub fn queue_post_flush_cb(cb: &Arc<Job>) {
    SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        let duplicate = match &s.active_post {
            Some(active) => {
                let start = if cb.allow_recurse {
                    s.post_index + 1
                } else {
                    s.post_index
                };
                active
                    .get(start..)
                    .unwrap_or(&[])
                    .iter()
                    .any(|queued| Arc::ptr_eq(queued, cb))
            }
            None => false,
        };
        if !duplicate {
            s.pending_post.push(cb.clone());
        }
    });
    queue_flush();
}

/// Queue a batch of post-flush callbacks without deduplication.
pub fn queue_post_flush_cbs(cbs: impl IntoIterator<Item = Arc<Job>>) {
    SCHEDULER.with(|s| s.borrow_mut().pending_post.extend(cbs));
    queue_flush();
}

/// Remove a queued job that has not started running. A job at or before the
/// running index cannot be cancelled.
pub fn invalidate_job(job: &Arc<Job>) {
    SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        if let Some(at) = s.queue.iter().position(|queued| Arc::ptr_eq(queued, job)) {
            if !s.is_flushing || at > s.flush_index {
                s.queue.remove(at);
            }
        }
    });
}

/// Pop and immediately run every `pre` job still pending, optionally only
/// those whose id matches `owner_id`.
///
/// Higher layers use this to force early-phase work to completion at a
/// specific point instead of waiting for the flush to reach it.
pub fn flush_pre_flush_cbs(owner_id: Option<u32>) {
    let mut i = SCHEDULER.with(|s| {
        let s = s.borrow();
        if s.is_flushing {
            s.flush_index + 1
        } else {
            0
        }
    });
    loop {
        let job = SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            while i < s.queue.len() {
                let candidate = s.queue[i].clone();
                if candidate.pre {
                    if owner_id.is_some() && candidate.id != owner_id {
                        i += 1;
                        continue;
                    }
                    s.queue.remove(i);
                    return Some(candidate);
                }
                i += 1;
            }
            None
        });
        match job {
            Some(job) => job.invoke(),
            None => break,
        }
    }
}

/// Drain the pending post-flush callbacks.
///
/// Pending callbacks are deduplicated and sorted by id into an active
/// snapshot; a re-entrant call while a snapshot is draining appends to it
/// and returns.
pub fn flush_post_flush_cbs() {
    let start_drain = SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        if s.pending_post.is_empty() {
            return false;
        }
        let mut deduped: Vec<Arc<Job>> = Vec::with_capacity(s.pending_post.len());
        for job in s.pending_post.drain(..) {
            if !deduped.iter().any(|seen| Arc::ptr_eq(seen, &job)) {
                deduped.push(job);
            }
        }
        deduped.sort_by(job_order);
        if let Some(active) = s.active_post.as_mut() {
            cov_mark::hit!(post_flush_reentrant_append);
            active.extend(deduped);
            return false;
        }
        s.active_post = Some(deduped);
        s.post_index = 0;
        true
    });
    if !start_drain {
        return;
    }
    loop {
        let job = SCHEDULER.with(|s| {
            let s = s.borrow();
            let active = s.active_post.as_ref().expect("active post-flush snapshot");
            active.get(s.post_index).cloned()
        });
        match job {
            Some(job) => {
                job.invoke();
                SCHEDULER.with(|s| s.borrow_mut().post_index += 1);
            }
            None => break,
        }
    }
    SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        s.active_post = None;
        s.post_index = 0;
    });
}

/// Drain the scheduler: the microtask checkpoint.
///
/// Sorts the queue by `(id, pre)`, runs each active job under the error
/// wrapper (a panicking job is reported with [`ErrorCode::Scheduler`] and the
/// flush continues), drains post-flush callbacks, repeats if the drain
/// produced more work, and finally runs next-tick callbacks. Invoked by the
/// host whenever the wake hook fired; re-entrant calls are no-ops.
pub fn flush_jobs() {
    let already = SCHEDULER.with(|s| s.borrow().is_flushing);
    if already {
        return;
    }
    let mut seen: HashMap<usize, u32, FixedHashBuilder> = HashMap::default();
    flush_jobs_round(&mut seen);
    drain_ticks();
}

fn flush_jobs_round(seen: &mut HashMap<usize, u32, FixedHashBuilder>) {
    SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        s.is_flush_pending = false;
        s.is_flushing = true;
        s.queue.sort_by(job_order);
    });
    log::trace!("scheduler flush starting");

    loop {
        let job = SCHEDULER.with(|s| {
            let s = s.borrow();
            s.queue.get(s.flush_index).cloned()
        });
        let Some(job) = job else { break };
        if job.is_active() {
            let skip = cfg!(debug_assertions) && check_recursive_updates(seen, &job);
            if !skip {
                let result = catch_unwind(AssertUnwindSafe(|| job.invoke()));
                if let Err(payload) = result {
                    handle_error(ErrorEvent {
                        code: ErrorCode::Scheduler,
                        message: panic_message(payload.as_ref()),
                        job_id: job.id,
                    });
                }
            }
        }
        SCHEDULER.with(|s| s.borrow_mut().flush_index += 1);
    }

    SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        s.flush_index = 0;
        s.queue.clear();
    });
    flush_post_flush_cbs();
    let more = SCHEDULER.with(|s| {
        let mut s = s.borrow_mut();
        s.is_flushing = false;
        !s.queue.is_empty() || !s.pending_post.is_empty()
    });
    if more {
        // Work arrived during the drain: run a follow-up pass within the
        // same checkpoint.
        flush_jobs_round(seen);
    }
}

fn drain_ticks() {
    loop {
        let cb = SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            if s.tick_cbs.is_empty() {
                None
            } else {
                Some(s.tick_cbs.remove(0))
            }
        });
        match cb {
            Some(cb) => cb(),
            None => break,
        }
    }
}

/// Run `f` after the in-flight flush completes.
///
/// With no flush in flight or pending, an empty drain is scheduled so `f`
/// still runs at the next checkpoint.
pub fn next_tick(f: impl FnOnce() + 'static) {
    SCHEDULER.with(|s| s.borrow_mut().tick_cbs.push(Box::new(f)));
    queue_flush();
}

/// Per-flush recursion guard: a job observed more than [`RECURSION_LIMIT`]
/// times is reported and skipped for the rest of the flush.
fn check_recursive_updates(seen: &mut HashMap<usize, u32, FixedHashBuilder>, job: &Arc<Job>) -> bool {
    let key = Arc::as_ptr(job) as usize;
    let count = seen.get(&key).copied().unwrap_or(0);
    if count > RECURSION_LIMIT {
        cov_mark::hit!(recursive_update_capped);
        handle_error(ErrorEvent {
            code: ErrorCode::AppErrorHandler,
            message: format!(
                "maximum recursive updates exceeded: a job enqueued itself more than {} times in one flush",
                RECURSION_LIMIT
            ),
            job_id: job.id,
        });
        true
    } else {
        seen.insert(key, count + 1);
        false
    }
}

#[cfg(test)]
pub(crate) fn queue_len() -> usize {
    SCHEDULER.with(|s| s.borrow().queue.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recording_job(log: &Arc<parking_lot::Mutex<Vec<&'static str>>>, tag: &'static str) -> Arc<Job> {
        let log = log.clone();
        Job::new(move || log.lock().push(tag))
    }

    #[test]
    fn jobs_run_in_id_order_with_pre_tiebreak() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let l = log.clone();
        let j2 = Job::builder().id(2).build(move || l.lock().push("2"));
        let l = log.clone();
        let j1 = Job::builder().id(1).build(move || l.lock().push("1"));
        let l = log.clone();
        let j2pre = Job::builder().id(2).pre().build(move || l.lock().push("2pre"));
        let jnone = recording_job(&log, "none");

        queue_job(&j2);
        queue_job(&jnone);
        queue_job(&j1);
        queue_job(&j2pre);
        flush_jobs();

        assert_eq!(*log.lock(), vec!["1", "2pre", "2", "none"]);
    }

    #[test]
    fn queueing_a_pending_job_twice_is_a_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let job = Job::new(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });
        queue_job(&job);
        queue_job(&job);
        assert_eq!(queue_len(), 1);
        flush_jobs();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn invalidated_job_does_not_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let job = Job::new(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });
        queue_job(&job);
        invalidate_job(&job);
        flush_jobs();
        assert_eq!(runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn inactive_job_is_skipped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let job = Job::new(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });
        queue_job(&job);
        job.set_active(false);
        flush_jobs();
        assert_eq!(runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn panicking_job_is_reported_and_flush_continues() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        crate::error::set_error_handler(move |event| {
            assert_eq!(event.code, ErrorCode::Scheduler);
            assert_eq!(event.job_id, Some(1));
            errors_clone.fetch_add(1, Ordering::Relaxed);
        });

        let bad = Job::builder().id(1).build(|| panic!("job failed"));
        let l = log.clone();
        let good = Job::builder().id(2).build(move || l.lock().push("good"));
        queue_job(&bad);
        queue_job(&good);
        flush_jobs();

        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert_eq!(*log.lock(), vec!["good"]);
        // The panicking callback was restored by the invoke guard.
        assert!(bad.cb.lock().is_some());
        crate::error::clear_error_handler();
    }

    #[test]
    fn flush_pre_flush_cbs_pops_only_pre_jobs() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let l = log.clone();
        let pre = Job::builder().id(7).pre().build(move || l.lock().push("pre"));
        let l = log.clone();
        let main = Job::builder().id(7).build(move || l.lock().push("main"));
        queue_job(&main);
        queue_job(&pre);

        flush_pre_flush_cbs(None);
        assert_eq!(*log.lock(), vec!["pre"]);

        flush_jobs();
        assert_eq!(*log.lock(), vec!["pre", "main"]);
    }

    #[test]
    fn flush_pre_flush_cbs_filters_by_owner() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let l = log.clone();
        let mine = Job::builder().id(3).pre().build(move || l.lock().push("mine"));
        let l = log.clone();
        let other = Job::builder().id(4).pre().build(move || l.lock().push("other"));
        queue_job(&mine);
        queue_job(&other);

        flush_pre_flush_cbs(Some(3));
        assert_eq!(*log.lock(), vec!["mine"]);

        flush_jobs();
        assert_eq!(*log.lock(), vec!["mine", "other"]);
    }

    #[test]
    fn next_tick_without_pending_work_still_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        next_tick(move || {
            ran_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(is_flush_pending());
        flush_jobs();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wake_hook_fires_once_per_pending_flush() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let wakes_clone = wakes.clone();
        set_wake_hook(move || {
            wakes_clone.fetch_add(1, Ordering::Relaxed);
        });

        let a = Job::new(|| {});
        let b = Job::new(|| {});
        queue_job(&a);
        queue_job(&b);
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        flush_jobs();
        queue_job(&a);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
        flush_jobs();
    }

    #[test]
    fn jobs_queued_during_flush_run_in_the_same_checkpoint() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let late = recording_job(&log, "late");
        let l = log.clone();
        let first = Job::builder().id(1).build(move || {
            l.lock().push("first");
            queue_job(&late);
        });
        queue_job(&first);
        flush_jobs();
        assert_eq!(*log.lock(), vec!["first", "late"]);
    }
}
