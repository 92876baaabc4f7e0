//! Input stream server: reads a local source and serves it as packets.

use super::{lock, lock_for_close, observe, CloseHook, CloseHooks};
use crate::config::StreamConfig;
use crate::error::{from_io, Result, StreamError};
use crate::framing::{Compressor, Encode, EncodingSource, LocalInput, PacketRead, PacketSink};
use crate::monitor::{self, StreamMonitor};
use crate::protocol::{check_usable, Direction, Lifecycle, Sequenced, StreamControl};
use crate::remote::RemoteInput;
use bytes::Bytes;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Feeds a zstd compressor from the local source on demand.
struct CompressingEncoder {
    local: LocalInput,
    /// Created on first data; an empty source produces no bytes at all.
    compressor: Option<Compressor>,
    level: i32,
    control: Arc<StreamControl>,
    monitor: Arc<dyn StreamMonitor>,
}

impl Encode for CompressingEncoder {
    fn encode(&mut self, sink: &mut PacketSink, _suggested_len: usize) -> io::Result<()> {
        match self.local.read_some()? {
            Some(data) => {
                self.monitor.local_bytes_moved(&self.control, data.len());
                let compressor = match &mut self.compressor {
                    Some(compressor) => compressor,
                    slot => slot.insert(Compressor::new(self.level)?),
                };
                compressor.compress(&data, sink)?;
            }
            None => {
                if let Some(compressor) = &mut self.compressor {
                    compressor.finish(sink)?;
                }
                sink.close();
            }
        }
        Ok(())
    }
}

/// How packets are produced from the local source.
enum Strategy {
    /// Packets are the local data itself.
    Plain { local: LocalInput, no_delay: bool },
    /// Packets are zstd output; skipping is not possible.
    Compressed(EncodingSource<CompressingEncoder>),
}

struct InputState {
    /// `None` once closed, which also drops the local source.
    strategy: Option<Strategy>,
    reads: Sequenced<Option<Bytes>>,
    skips: Sequenced<u64>,
}

pub struct InputStreamServer {
    control: Arc<StreamControl>,
    lifecycle: Lifecycle,
    monitor: Arc<dyn StreamMonitor>,
    compressed: bool,
    state: Mutex<InputState>,
    hooks: CloseHooks,
}

impl InputStreamServer {
    /// Serve a plain reader, read in chunks of `config.chunk_size`.
    pub fn from_reader(
        reader: impl Read + Send + 'static,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
    ) -> Result<Self> {
        Self::new(LocalInput::reader(reader, config.chunk_size), config, monitor)
    }

    /// Serve a packet source. Uncompressed packets pass through untouched.
    pub fn from_packets(
        source: impl PacketRead + Send + 'static,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
    ) -> Result<Self> {
        Self::new(LocalInput::packets(source), config, monitor)
    }

    pub fn new(
        local: LocalInput,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let control = Arc::new(StreamControl::new(Direction::Input));
        let strategy = if config.compression {
            let encoder = CompressingEncoder {
                local,
                compressor: None,
                level: config.compression_level,
                control: Arc::clone(&control),
                monitor: Arc::clone(&monitor),
            };
            Strategy::Compressed(EncodingSource::new(encoder, config.chunk_size))
        } else {
            Strategy::Plain {
                local,
                no_delay: config.effective_no_delay(),
            }
        };
        debug!(
            stream = control.id(),
            compression = config.compression,
            chunk_size = config.chunk_size,
            "input stream server created"
        );
        Ok(Self {
            control,
            lifecycle: Lifecycle::new(),
            monitor,
            compressed: config.compression,
            state: Mutex::new(InputState {
                strategy: Some(strategy),
                reads: Sequenced::new(),
                skips: Sequenced::new(),
            }),
            hooks: CloseHooks::default(),
        })
    }

    /// Plain server with default settings and no monitor.
    pub fn plain(reader: impl Read + Send + 'static) -> Result<Self> {
        Self::from_reader(reader, &StreamConfig::uncompressed(), monitor::noop())
    }

    /// Compressed server with default settings and no monitor.
    pub fn compressed(reader: impl Read + Send + 'static) -> Result<Self> {
        Self::from_reader(reader, &StreamConfig::default(), monitor::noop())
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

    /// Register `hook` to run once when the server closes. Runs right away
    /// (as unclean) if the server is already closed.
    pub fn on_close(&self, hook: impl FnOnce(bool) + Send + 'static) {
        if let Some(hook) = self.hooks.push(Box::new(hook) as CloseHook) {
            hook(false);
        }
    }

    fn with_open_state<T>(&self, op: impl FnOnce(&mut InputState) -> Result<T>) -> Result<T> {
        let mut state = lock(&self.state)?;
        check_usable(&self.control, &self.lifecycle)?;
        op(&mut state)
    }

    pub fn read_packet(&self, id: u32) -> Result<Option<Bytes>> {
        let control = &*self.control;
        let monitor = &*self.monitor;
        let outcome = self.with_open_state(|state| {
            let InputState {
                strategy, reads, ..
            } = state;
            let strategy = strategy.as_mut().ok_or(StreamError::ClosedOrAborted)?;
            let outcome = reads.perform(id, || match strategy {
                Strategy::Plain { local, no_delay } => {
                    let packet = if *no_delay {
                        local.read_some()
                    } else {
                        local.read_packet()
                    }
                    .map_err(from_io)?;
                    if let Some(packet) = &packet {
                        monitor.local_bytes_moved(control, packet.len());
                    }
                    Ok(packet)
                }
                Strategy::Compressed(source) => source.read_packet().map_err(from_io),
            });
            observe(outcome, monitor, control)
        })?;

        if outcome.reattempt {
            trace!(stream = control.id(), id, "replaying cached packet");
        }
        if let Some(packet) = &outcome.value {
            monitor.bytes_moved(control, packet.len(), outcome.reattempt);
        }
        Ok(outcome.value)
    }

    pub fn skip(&self, n: u64, id: u32) -> Result<u64> {
        let control = &*self.control;
        let monitor = &*self.monitor;
        let outcome = self.with_open_state(|state| {
            let InputState {
                strategy, skips, ..
            } = state;
            let strategy = strategy.as_mut().ok_or(StreamError::ClosedOrAborted)?;
            let local = match strategy {
                Strategy::Plain { local, .. } => local,
                Strategy::Compressed(_) => {
                    return Err(StreamError::unsupported(
                        "skip on a compressed input stream",
                    ))
                }
            };
            let outcome = skips.perform(id, || {
                let skipped = local.skip(n).map_err(from_io)?;
                monitor.local_bytes_skipped(control, skipped);
                Ok(skipped)
            });
            observe(outcome, monitor, control)
        })?;

        monitor.bytes_skipped(control, outcome.value, outcome.reattempt);
        Ok(outcome.value)
    }

    /// Bytes that can be served without touching the local source.
    pub fn available(&self) -> Result<usize> {
        self.with_open_state(|state| {
            Ok(match &state.strategy {
                Some(Strategy::Plain { local, .. }) => local.buffered(),
                Some(Strategy::Compressed(source)) => source.available(),
                None => 0,
            })
        })
    }

    pub fn using_compression(&self) -> bool {
        self.compressed
    }

    /// Close once. Later calls, from any trigger, return immediately.
    pub fn close(&self, read_success: bool) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        let strategy = lock_for_close(&self.state).strategy.take();
        // dropping the strategy releases the local source
        drop(strategy);
        self.lifecycle.finish_close();

        let clean = read_success && !self.control.is_aborted();
        self.hooks.run(clean);
        self.monitor.closed(&self.control, clean);
        debug!(stream = self.control.id(), clean, "input stream server closed");
        Ok(())
    }
}

impl Drop for InputStreamServer {
    fn drop(&mut self) {
        if self.lifecycle.is_open() {
            let _ = self.close(false);
        }
    }
}

impl RemoteInput for InputStreamServer {
    fn using_compression(&self) -> Result<bool> {
        Ok(InputStreamServer::using_compression(self))
    }

    fn available(&self) -> Result<usize> {
        InputStreamServer::available(self)
    }

    fn read_packet(&self, id: u32) -> Result<Option<Bytes>> {
        InputStreamServer::read_packet(self, id)
    }

    fn skip(&self, n: u64, id: u32) -> Result<u64> {
        InputStreamServer::skip(self, n, id)
    }

    fn close(&self, read_success: bool) -> Result<()> {
        InputStreamServer::close(self, read_success)
    }
}
