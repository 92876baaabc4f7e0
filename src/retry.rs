//! Retry policies and the decorators that apply them to remote calls.
//!
//! Only [`StreamError::Communication`] is retried. Every remote operation is
//! keyed by a sequence id, so re-issuing a call whose response was lost
//! replays the server's cached result instead of repeating the effect.

use crate::error::Result;
use crate::remote::{RemoteInput, RemoteOutput};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Fail on the first error.
    Never,
    /// Fixed pause between attempts.
    Simple { max_retries: u32, backoff_ms: u64 },
    /// Pause doubles after each attempt, capped at `max_backoff_ms`.
    Exponential {
        max_retries: u32,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Simple {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::Never => 0,
            RetryPolicy::Simple { max_retries, .. } => *max_retries,
            RetryPolicy::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Pause before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Never => Duration::ZERO,
            RetryPolicy::Simple { backoff_ms, .. } => Duration::from_millis(*backoff_ms),
            RetryPolicy::Exponential {
                initial_backoff_ms,
                max_backoff_ms,
                ..
            } => {
                let shift = attempt.saturating_sub(1).min(32);
                let ms = initial_backoff_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(ms.min(*max_backoff_ms))
            }
        }
    }

    /// Run `op`, retrying retryable failures up to the policy's bound.
    ///
    /// Returns the last error once retries are exhausted.
    pub fn call<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max = self.max_retries();
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "remote call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max => {
                    attempt += 1;
                    let pause = self.backoff(attempt);
                    warn!(attempt, max, error = %err, ?pause, "retrying remote call");
                    if !pause.is_zero() {
                        thread::sleep(pause);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Applies a [`RetryPolicy`] around every [`RemoteInput`] method.
pub struct RetryingInput<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RemoteInput> RetryingInput<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<R: RemoteInput> RemoteInput for RetryingInput<R> {
    fn using_compression(&self) -> Result<bool> {
        self.policy.call(|| self.inner.using_compression())
    }

    fn available(&self) -> Result<usize> {
        self.policy.call(|| self.inner.available())
    }

    fn read_packet(&self, id: u32) -> Result<Option<Bytes>> {
        self.policy.call(|| self.inner.read_packet(id))
    }

    fn skip(&self, n: u64, id: u32) -> Result<u64> {
        self.policy.call(|| self.inner.skip(n, id))
    }

    fn close(&self, read_success: bool) -> Result<()> {
        self.policy.call(|| self.inner.close(read_success))
    }
}

/// Applies a [`RetryPolicy`] around every [`RemoteOutput`] method.
pub struct RetryingOutput<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RemoteOutput> RetryingOutput<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<R: RemoteOutput> RemoteOutput for RetryingOutput<R> {
    fn using_compression(&self) -> Result<bool> {
        self.policy.call(|| self.inner.using_compression())
    }

    fn write_packet(&self, packet: Bytes, id: u32) -> Result<()> {
        // Bytes clones share the buffer
        self.policy
            .call(|| self.inner.write_packet(packet.clone(), id))
    }

    fn flush(&self) -> Result<()> {
        self.policy.call(|| self.inner.flush())
    }

    fn close(&self, write_success: bool) -> Result<()> {
        self.policy.call(|| self.inner.close(write_success))
    }
}
