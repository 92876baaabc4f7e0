//! Bounded producer/consumer pipe.
//!
//! One thread pushes items into a [`Sink`], another pulls them from a
//! [`Source`]. Either side closing early is seen by the other as an abort:
//! a consumer blocked in `has_next` wakes up with [`StreamError::Aborted`],
//! and a producer blocked on a full queue fails instead of hanging.

use crate::error::{Result, StreamError};
use crate::iterator::IoIterator;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

#[derive(Debug)]
enum Msg<T> {
    Item(T),
    Finished,
}

/// Create a pipe holding at most `capacity` queued items.
pub fn pipe<T>(capacity: usize) -> (Sink<T>, Source<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        Sink {
            tx: Some(tx),
            finished: false,
        },
        Source {
            rx: Some(rx),
            peeked: None,
            done: false,
        },
    )
}

/// Producer end.
#[derive(Debug)]
pub struct Sink<T> {
    /// `None` once closed.
    tx: Option<Sender<Msg<T>>>,
    finished: bool,
}

impl<T> Sink<T> {
    /// Queue `item`, blocking while the pipe is full.
    pub fn add_next(&mut self, item: T) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(StreamError::ClosedOrAborted)?;
        tx.send(Msg::Item(item)).map_err(|_| StreamError::Aborted)
    }

    /// No more items will follow.
    pub fn set_finished(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StreamError::ClosedOrAborted)?;
        self.finished = true;
        tx.send(Msg::Finished).map_err(|_| StreamError::Aborted)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Idempotent. Before `set_finished` the consumer sees an abort.
    pub fn close(&mut self) {
        if self.tx.take().is_some() && !self.finished {
            debug!("pipe sink closed before finish");
        }
    }
}

/// Consumer end.
#[derive(Debug)]
pub struct Source<T> {
    /// `None` once closed.
    rx: Option<Receiver<Msg<T>>>,
    peeked: Option<T>,
    done: bool,
}

impl<T> Source<T> {
    /// Block until an item is ready (`true`) or the producer finished
    /// (`false`). A producer that went away without finishing is an abort.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_some() {
            return Ok(true);
        }
        if self.done {
            return Ok(false);
        }
        let rx = self.rx.as_ref().ok_or(StreamError::ClosedOrAborted)?;
        match rx.recv() {
            Ok(Msg::Item(item)) => {
                self.peeked = Some(item);
                Ok(true)
            }
            Ok(Msg::Finished) => {
                self.done = true;
                Ok(false)
            }
            Err(_) => Err(StreamError::Aborted),
        }
    }

    pub fn next_item(&mut self) -> Result<Option<T>> {
        if self.has_next()? {
            Ok(self.peeked.take())
        } else {
            Ok(None)
        }
    }

    /// Idempotent. A producer still adding items fails from now on.
    pub fn close(&mut self) {
        if self.rx.take().is_some() && !self.done {
            debug!("pipe source closed before finish");
        }
        self.peeked = None;
    }
}

impl<T> Iterator for Source<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}

impl<T> IoIterator<T> for Source<T> {
    fn has_next(&mut self) -> Result<bool> {
        Source::has_next(self)
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        Source::next_item(self)
    }

    fn close(&mut self) -> Result<()> {
        Source::close(self);
        Ok(())
    }
}
