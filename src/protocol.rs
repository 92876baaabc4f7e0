//! Sequenced transfer protocol.
//!
//! Every remote operation carries a client-chosen sequence id. The server
//! executes each new id at most once and replays the cached result when the
//! same id shows up again, so a client that lost a response can blindly
//! re-issue the call.
//!
//! ```text
//! id <  last  ->  InvalidSequence, state untouched
//! id == last  ->  replay cached result (reattempt)
//! id >  last  ->  run the operation, cache (id, result) on success only
//! ```

use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tracing::debug;

/// Which way bytes flow through a stream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Server reads locally, client pulls packets.
    Input,
    /// Client pushes packets, server writes locally.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Result of a sequenced operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    pub value: T,
    /// `true` when the value was replayed from cache.
    pub reattempt: bool,
}

/// One monotonic sequence-id space and the cached result of its last op.
#[derive(Debug)]
pub struct Sequenced<T> {
    last_id: Option<u32>,
    last_result: Option<T>,
}

impl<T> Default for Sequenced<T> {
    fn default() -> Self {
        Self {
            last_id: None,
            last_result: None,
        }
    }
}

impl<T: Clone> Sequenced<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_id(&self) -> Option<u32> {
        self.last_id
    }

    /// Run `op` for a new id, or replay the cached result for a repeated one.
    ///
    /// A failing `op` leaves the state as it was, so retrying the same id
    /// attempts the real operation again.
    pub fn perform<F>(&mut self, id: u32, op: F) -> Result<Outcome<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let (Some(last), Some(cached)) = (self.last_id, self.last_result.as_ref()) {
            if id < last {
                return Err(StreamError::InvalidSequence { id, last });
            }
            if id == last {
                return Ok(Outcome {
                    value: cached.clone(),
                    reattempt: true,
                });
            }
        }

        let value = op()?;
        self.last_id = Some(id);
        self.last_result = Some(value.clone());
        Ok(Outcome {
            value,
            reattempt: false,
        })
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// OPEN -> CLOSING -> CLOSED, each transition taken exactly once.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Claim the close path. Only the first caller gets `true`.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Identity and abort switch of one stream server.
///
/// Monitors receive a reference to this, so a callback may abort the very
/// stream it is observing.
#[derive(Debug)]
pub struct StreamControl {
    id: u64,
    direction: Direction,
    aborted: AtomicBool,
}

impl StreamControl {
    pub fn new(direction: Direction) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Idempotent; takes effect at the next operation's precondition check.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            debug!(stream = self.id, direction = %self.direction, "stream aborted");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(StreamError::Aborted);
        }
        Ok(())
    }
}

/// Precondition shared by every server operation.
pub(crate) fn check_usable(control: &StreamControl, lifecycle: &Lifecycle) -> Result<()> {
    control.check_aborted()?;
    if !lifecycle.is_open() {
        return Err(StreamError::ClosedOrAborted);
    }
    Ok(())
}
