use super::{advance, StreamRead};
use crate::buffer::PacketBuffer;
use crate::error::{from_io, Result, StreamError};
use crate::framing::Decompressor;
use crate::remote::RemoteInput;
use crate::retry::{RetryPolicy, RetryingInput};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

/// Blocking reader over a [`RemoteInput`].
///
/// Packets are pulled one sequence id at a time and re-chunked locally, so
/// reads of any size work. A compressed stream is decoded here, which also
/// means skipping it is done by reading and discarding.
pub struct InputStreamClient {
    remote: RetryingInput<Arc<dyn RemoteInput>>,
    compressed: bool,
    next_read_id: u32,
    next_skip_id: u32,
    buffer: PacketBuffer,
    decoder: Option<Decompressor>,
    chunk_size: usize,
    eof: bool,
    closed: bool,
}

impl InputStreamClient {
    pub fn new(remote: Arc<dyn RemoteInput>, retry: RetryPolicy, chunk_size: usize) -> Result<Self> {
        let remote = RetryingInput::new(remote, retry);
        let compressed = remote.using_compression()?;
        Ok(Self {
            remote,
            compressed,
            next_read_id: 0,
            next_skip_id: 0,
            buffer: PacketBuffer::new(),
            decoder: None,
            chunk_size: chunk_size.max(1),
            eof: false,
            closed: false,
        })
    }

    pub fn using_compression(&self) -> bool {
        self.compressed
    }

    pub fn reached_eof(&self) -> bool {
        self.eof && !self.buffer.has_remaining()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StreamError::ClosedOrAborted);
        }
        Ok(())
    }

    /// Pull packets until something is buffered. `false` at end of stream.
    fn fill(&mut self) -> Result<bool> {
        while !self.buffer.has_remaining() && !self.eof {
            let packet = self.remote.read_packet(self.next_read_id)?;
            advance(&mut self.next_read_id)?;
            match packet {
                None => {
                    self.eof = true;
                    if let Some(decoder) = &mut self.decoder {
                        decoder.finish().map_err(from_io)?;
                    }
                }
                Some(packet) if self.compressed => {
                    let decoder = match &mut self.decoder {
                        Some(decoder) => decoder,
                        slot => slot.insert(Decompressor::new(self.chunk_size)?),
                    };
                    decoder
                        .decompress(&packet, &mut self.buffer)
                        .map_err(from_io)?;
                }
                Some(packet) => self.buffer.write_packet(packet),
            }
        }
        Ok(self.buffer.has_remaining())
    }

    /// Discard up to `n` bytes, returning how many were skipped.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.check_open()?;
        let mut skipped = 0u64;
        while skipped < n {
            let buffered = self.buffer.remaining() as u64;
            if buffered > 0 {
                let step = buffered.min(n - skipped);
                self.buffer.skip(step as usize)?;
                skipped += step;
                continue;
            }
            if self.eof {
                break;
            }
            if self.compressed {
                if !self.fill()? {
                    break;
                }
            } else {
                let got = self.remote.skip(n - skipped, self.next_skip_id)?;
                advance(&mut self.next_skip_id)?;
                skipped += got;
                if got == 0 {
                    break;
                }
            }
        }
        Ok(skipped)
    }

    /// Bytes readable without blocking, as far as is known.
    pub fn available(&mut self) -> Result<usize> {
        self.check_open()?;
        let remote = if self.compressed || self.eof {
            0
        } else {
            self.remote.available()?
        };
        Ok(self.buffer.remaining().saturating_add(remote))
    }

    /// Tell the server reading is over. The read counts as successful when
    /// the end of stream was reached. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        debug!(read_success = self.eof, "closing input stream client");
        self.remote.close(self.eof)
    }
}

impl Read for InputStreamClient {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        Ok(self.buffer.read_up_to(buf))
    }
}

impl StreamRead for InputStreamClient {
    fn close(&mut self) -> Result<()> {
        InputStreamClient::close(self)
    }
}

impl Drop for InputStreamClient {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(error = %err, "input stream client close on drop failed");
        }
    }
}
