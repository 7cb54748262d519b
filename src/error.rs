//! Error routing for the scheduler.
//!
//! Failures inside queued jobs are never fatal to the runtime: they are
//! captured, handed to the registered per-thread error handler, and the flush
//! proceeds with the next job. Anything synchronous outside the scheduler
//! propagates to its caller. There are no retries.

use std::any::Any;
use std::cell::RefCell;

/// Where an error surfaced.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ErrorCode {
    /// A job body failed during a flush.
    Scheduler,
    /// The recursion guard tripped on a self-requeueing job.
    AppErrorHandler,
}

/// An error routed through the handler.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    /// Where the error surfaced.
    pub code: ErrorCode,
    /// The captured message.
    pub message: String,
    /// The offending job's id, when it had one.
    pub job_id: Option<u32>,
}

type Handler = Box<dyn Fn(&ErrorEvent)>;

thread_local! {
    static HANDLER: RefCell<Option<Handler>> = const { RefCell::new(None) };
}

/// Install this thread's error handler, replacing any previous one.
pub fn set_error_handler(handler: impl Fn(&ErrorEvent) + 'static) {
    HANDLER.with(|h| *h.borrow_mut() = Some(Box::new(handler)));
}

/// Remove this thread's error handler, falling back to the log-based default.
pub fn clear_error_handler() {
    HANDLER.with(|h| *h.borrow_mut() = None);
}

/// Route an error to the handler, or log it if none is installed.
///
/// The handler is taken out of its slot for the duration of the call so it
/// can safely reach back into the runtime.
pub(crate) fn handle_error(event: ErrorEvent) {
    let handler = HANDLER.with(|h| h.borrow_mut().take());
    match handler {
        Some(handler) => {
            handler(&event);
            HANDLER.with(|h| {
                let mut slot = h.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            });
        }
        None => log::error!(
            "unhandled {:?} error (job {:?}): {}",
            event.code,
            event.job_id,
            event.message
        ),
    }
}

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handler_receives_events_and_survives() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        set_error_handler(move |event| {
            assert_eq!(event.code, ErrorCode::Scheduler);
            seen_clone.fetch_add(1, Ordering::Relaxed);
        });

        handle_error(ErrorEvent {
            code: ErrorCode::Scheduler,
            message: "boom".into(),
            job_id: Some(3),
        });
        handle_error(ErrorEvent {
            code: ErrorCode::Scheduler,
            message: "boom again".into(),
            job_id: None,
        });
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        clear_error_handler();
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = std::panic::catch_unwind(|| panic!("literal")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "literal");

        let payload = std::panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "42");
    }
}
