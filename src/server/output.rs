//! Output stream server: accepts packets and writes them to a local sink.

use super::{lock, lock_for_close, observe, CloseHook, CloseHooks};
use crate::config::StreamConfig;
use crate::error::{from_io, Result, StreamError};
use crate::framing::Decompressor;
use crate::monitor::{self, StreamMonitor};
use crate::protocol::{check_usable, Direction, Lifecycle, Sequenced, StreamControl};
use crate::remote::RemoteOutput;
use bytes::Bytes;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Counts bytes on their way to the local sink.
struct Counting<'a, W: ?Sized> {
    inner: &'a mut W,
    written: usize,
}

impl<W: Write + ?Sized> Write for Counting<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Strategy {
    Plain { local: Box<dyn Write + Send> },
    Compressed {
        local: Box<dyn Write + Send>,
        /// Created on the first packet.
        decoder: Option<Decompressor>,
        transfer_size: usize,
    },
}

impl Strategy {
    /// Returns bytes handed to the local sink.
    fn write(&mut self, packet: &[u8]) -> io::Result<usize> {
        match self {
            Strategy::Plain { local } => {
                local.write_all(packet)?;
                Ok(packet.len())
            }
            Strategy::Compressed {
                local,
                decoder,
                transfer_size,
            } => {
                let decoder = match decoder {
                    Some(decoder) => decoder,
                    slot => slot.insert(Decompressor::new(*transfer_size)?),
                };
                let mut sink = Counting {
                    inner: local.as_mut(),
                    written: 0,
                };
                decoder.decompress(packet, &mut sink)?;
                Ok(sink.written)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Strategy::Plain { local } | Strategy::Compressed { local, .. } => local.flush(),
        }
    }

    /// Drain what is left and check the compressed stream ended cleanly.
    fn finish(&mut self) -> io::Result<()> {
        if let Strategy::Compressed {
            decoder: Some(decoder),
            ..
        } = self
        {
            decoder.finish()?;
        }
        self.flush()
    }
}

struct OutputState {
    strategy: Option<Strategy>,
    writes: Sequenced<()>,
}

pub struct OutputStreamServer {
    control: Arc<StreamControl>,
    lifecycle: Lifecycle,
    monitor: Arc<dyn StreamMonitor>,
    compressed: bool,
    state: Mutex<OutputState>,
    hooks: CloseHooks,
}

impl OutputStreamServer {
    pub fn new(
        local: impl Write + Send + 'static,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let control = Arc::new(StreamControl::new(Direction::Output));
        let local: Box<dyn Write + Send> = Box::new(local);
        let strategy = if config.compression {
            Strategy::Compressed {
                local,
                decoder: None,
                transfer_size: config.output_transfer_size(),
            }
        } else {
            Strategy::Plain { local }
        };
        debug!(
            stream = control.id(),
            compression = config.compression,
            "output stream server created"
        );
        Ok(Self {
            control,
            lifecycle: Lifecycle::new(),
            monitor,
            compressed: config.compression,
            state: Mutex::new(OutputState {
                strategy: Some(strategy),
                writes: Sequenced::new(),
            }),
            hooks: CloseHooks::default(),
        })
    }

    pub fn plain(local: impl Write + Send + 'static) -> Result<Self> {
        Self::new(local, &StreamConfig::uncompressed(), monitor::noop())
    }

    pub fn compressed(local: impl Write + Send + 'static) -> Result<Self> {
        Self::new(local, &StreamConfig::default(), monitor::noop())
    }

    pub fn id(&self) -> u64 {
        self.control.id()
    }

    pub fn control(&self) -> &Arc<StreamControl> {
        &self.control
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub fn on_close(&self, hook: impl FnOnce(bool) + Send + 'static) {
        if let Some(hook) = self.hooks.push(Box::new(hook) as CloseHook) {
            hook(false);
        }
    }

    pub fn using_compression(&self) -> bool {
        self.compressed
    }

    pub fn write_packet(&self, packet: Bytes, id: u32) -> Result<()> {
        let control = &*self.control;
        let monitor = &*self.monitor;
        let mut state = lock(&self.state)?;
        check_usable(control, &self.lifecycle)?;
        let OutputState { strategy, writes } = &mut *state;
        let strategy = strategy.as_mut().ok_or(StreamError::ClosedOrAborted)?;

        let outcome = writes.perform(id, || {
            let written = strategy.write(&packet).map_err(from_io)?;
            monitor.local_bytes_moved(control, written);
            Ok(())
        });
        let outcome = observe(outcome, monitor, control)?;
        drop(state);

        if outcome.reattempt {
            trace!(stream = control.id(), id, "duplicate packet ignored");
        }
        monitor.bytes_moved(control, packet.len(), outcome.reattempt);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        check_usable(&self.control, &self.lifecycle)?;
        let strategy = state.strategy.as_mut().ok_or(StreamError::ClosedOrAborted)?;
        observe(
            strategy.flush().map_err(from_io),
            &*self.monitor,
            &self.control,
        )
    }

    /// Close once. With `write_success` and no abort, the compressed stream
    /// is checked for completeness and the sink flushed before it is dropped.
    pub fn close(&self, write_success: bool) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        let strategy = lock_for_close(&self.state).strategy.take();
        let mut clean = write_success && !self.control.is_aborted();
        let mut result = Ok(());
        if let Some(mut strategy) = strategy {
            if clean {
                if let Err(err) = strategy.finish() {
                    let err = from_io(err);
                    warn!(stream = self.control.id(), error = %err, "output close failed");
                    self.monitor.failure(&self.control, &err);
                    clean = false;
                    result = Err(err);
                }
            }
        }
        self.lifecycle.finish_close();

        self.hooks.run(clean);
        self.monitor.closed(&self.control, clean);
        debug!(stream = self.control.id(), clean, "output stream server closed");
        result
    }
}

impl Drop for OutputStreamServer {
    fn drop(&mut self) {
        if self.lifecycle.is_open() {
            let _ = self.close(false);
        }
    }
}

impl RemoteOutput for OutputStreamServer {
    fn using_compression(&self) -> Result<bool> {
        Ok(OutputStreamServer::using_compression(self))
    }

    fn write_packet(&self, packet: Bytes, id: u32) -> Result<()> {
        OutputStreamServer::write_packet(self, packet, id)
    }

    fn flush(&self) -> Result<()> {
        OutputStreamServer::flush(self)
    }

    fn close(&self, write_success: bool) -> Result<()> {
        OutputStreamServer::close(self, write_success)
    }
}
