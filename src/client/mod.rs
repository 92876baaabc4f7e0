//! Client adapters: ordinary blocking byte streams over the remote surface.

pub mod input;
pub mod output;

pub use input::InputStreamClient;
pub use output::OutputStreamClient;

use crate::error::Result;
use std::io::Read;

/// A reader whose remote end must be told when reading is over.
pub trait StreamRead: Read {
    fn close(&mut self) -> Result<()>;
}

/// Next id of a client-side sequence counter.
pub(crate) fn advance(counter: &mut u32) -> Result<()> {
    *counter = counter
        .checked_add(1)
        .ok_or_else(|| crate::error::StreamError::unsupported("sequence ids exhausted"))?;
    Ok(())
}
