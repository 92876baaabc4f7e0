//! Stream servers: the owner side of a transfer.
//!
//! A server holds exactly one local resource and exposes it through the
//! sequenced protocol. All operations on one server are serialized by the
//! lock around its state, and the resource itself lives inside that state so
//! it is only touched while the lock is held.

pub mod input;
pub mod output;

pub use input::InputStreamServer;
pub use output::OutputStreamServer;

use crate::error::{Result, StreamError};
use crate::monitor::StreamMonitor;
use crate::protocol::StreamControl;
use std::io;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Runs once from a server's close path with the clean flag.
pub type CloseHook = Box<dyn FnOnce(bool) + Send>;

/// `None` once the hooks have run.
pub(crate) struct CloseHooks {
    hooks: Mutex<Option<Vec<CloseHook>>>,
}

impl Default for CloseHooks {
    fn default() -> Self {
        Self {
            hooks: Mutex::new(Some(Vec::new())),
        }
    }
}

impl CloseHooks {
    /// Queue `hook`, or hand it back when the hooks already ran.
    pub(crate) fn push(&self, hook: CloseHook) -> Option<CloseHook> {
        let mut hooks = lock_for_close(&self.hooks);
        match hooks.as_mut() {
            Some(pending) => {
                pending.push(hook);
                None
            }
            None => Some(hook),
        }
    }

    pub(crate) fn run(&self, clean: bool) {
        let hooks = lock_for_close(&self.hooks).take().unwrap_or_default();
        for hook in hooks {
            hook(clean);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StreamError::Io(io::Error::other("stream lock poisoned")))
}

/// Lock for the close path, which must proceed even after a panic elsewhere.
pub(crate) fn lock_for_close<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("stream lock poisoned, closing anyway");
            poisoned.into_inner()
        }
    }
}

/// Report failures of the local resource. Protocol misuse is not a failure
/// of the resource, so it is only returned.
pub(crate) fn observe<T>(
    result: Result<T>,
    monitor: &dyn StreamMonitor,
    control: &StreamControl,
) -> Result<T> {
    if let Err(err) = &result {
        if matches!(err, StreamError::Io(_) | StreamError::Codec(_)) {
            monitor.failure(control, err);
        }
    }
    result
}
