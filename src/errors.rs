//! Error handling for user callbacks.
//!
//! The engine's own paths do not panic; failures originate in user code
//! (watch getters, callbacks, cleanups, queued jobs). Those run through
//! [`call_with_error_handling`], which catches the unwind, tags it with a
//! [`CallbackKind`], and hands it to the installed handler, falling back to
//! a `tracing` error. The effect runtime's drop guards keep the execution
//! stacks balanced regardless, so a panicking callback cannot corrupt
//! tracking state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::error;

/// Which kind of user callback failed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallbackKind {
    /// A watch source getter.
    WatchGetter,
    /// A watch callback.
    WatchCallback,
    /// An invalidation cleanup registered by a watcher.
    WatchCleanup,
    /// A job run by the flush queues.
    Scheduler,
}

impl CallbackKind {
    fn as_str(self) -> &'static str {
        match self {
            CallbackKind::WatchGetter => "watch getter",
            CallbackKind::WatchCallback => "watch callback",
            CallbackKind::WatchCleanup => "watch cleanup",
            CallbackKind::Scheduler => "scheduler job",
        }
    }
}

/// A user callback panicked.
#[derive(Debug, Clone, Error)]
#[error("{} panicked: {message}", .kind.as_str())]
pub struct CallbackError {
    /// Which callback failed.
    pub kind: CallbackKind,
    /// Rendered panic payload.
    pub message: String,
}

/// Sink for callback errors.
pub type ErrorHandler = Arc<dyn Fn(&CallbackError) + Send + Sync>;

static ERROR_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

/// Install a process-wide sink for callback errors, replacing the default
/// `tracing` output. Returns the previous handler.
pub fn set_error_handler(handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
    std::mem::replace(&mut *ERROR_HANDLER.write(), handler)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run a user callback, converting a panic into a reported
/// [`CallbackError`]. Returns `None` when the callback panicked.
pub fn call_with_error_handling<R>(kind: CallbackKind, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(out) => Some(out),
        Err(payload) => {
            let err = CallbackError {
                kind,
                message: panic_message(payload),
            };
            let handler = ERROR_HANDLER.read().clone();
            match handler {
                Some(handler) => handler(&err),
                None => error!("{err}"),
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn successful_calls_pass_through() {
        assert_eq!(
            call_with_error_handling(CallbackKind::Scheduler, || 42),
            Some(42)
        );
    }

    #[test]
    fn panics_reach_the_installed_handler() {
        let seen: Arc<Mutex<Vec<CallbackError>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let prev = set_error_handler(Some(Arc::new(move |e| {
            seen2.lock().push(e.clone());
        })));

        let out: Option<()> = call_with_error_handling(CallbackKind::WatchCallback, || {
            panic!("boom");
        });
        assert!(out.is_none());

        let errors = seen.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, CallbackKind::WatchCallback);
        assert!(errors[0].message.contains("boom"));
        drop(errors);

        set_error_handler(prev);
    }
}
