//! Compression framing adapter.
//!
//! Translates between arbitrary-size local reads/writes and the wire packets
//! carried by the sequenced protocol.
//!
//! Encoding side: an [`EncodingSource`] owns a [`PacketSink`]. Whenever a
//! packet is pulled and the sink cannot satisfy it, the owner's [`Encode`]
//! hook is asked to push more bytes in. The hook is never invoked while
//! enough data is already buffered, so read-ahead stays bounded.
//!
//! Decoding side: [`Decompressor`] is push-driven. Every call decodes only
//! the compressed bytes just supplied and hands over whatever output that
//! input yields, so it can never stall waiting for packets that have not
//! arrived yet.

use crate::buffer::PacketBuffer;
use bytes::Bytes;
use std::io::{self, Read, Write};
use zstd::stream::raw::{Decoder, Encoder, Operation, OutBuffer};

/// Default zstd level (fast, good ratio).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Scratch size for compressor output.
const COMPRESS_SCRATCH_SIZE: usize = 32 * 1024;

/// A source that yields whole packets. `None` marks end of stream.
pub trait PacketRead {
    fn read_packet(&mut self) -> io::Result<Option<Bytes>>;
}

impl<P: PacketRead + ?Sized> PacketRead for Box<P> {
    fn read_packet(&mut self) -> io::Result<Option<Bytes>> {
        (**self).read_packet()
    }
}

// =============================================================================
// Local input
// =============================================================================

enum InputKind {
    Bytes(Box<dyn Read + Send>),
    Packets(Box<dyn PacketRead + Send>),
}

/// The local resource behind an input stream server, read in packets.
///
/// Plain readers are read until `chunk` bytes are gathered or EOF; packet
/// sources hand their packets through untouched.
pub struct LocalInput {
    kind: InputKind,
    scratch: Vec<u8>,
    /// Part of a packet left over from a skip.
    leftover: Option<Bytes>,
}

impl LocalInput {
    pub fn reader(reader: impl Read + Send + 'static, chunk_size: usize) -> Self {
        Self {
            kind: InputKind::Bytes(Box::new(reader)),
            scratch: vec![0u8; chunk_size.max(1)],
            leftover: None,
        }
    }

    pub fn packets(source: impl PacketRead + Send + 'static) -> Self {
        Self {
            kind: InputKind::Packets(Box::new(source)),
            scratch: Vec::new(),
            leftover: None,
        }
    }

    /// Next packet, reading a plain source until the chunk fills or EOF.
    pub fn read_packet(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(rest) = self.leftover.take() {
            return Ok(Some(rest));
        }
        match &mut self.kind {
            InputKind::Packets(source) => source.read_packet(),
            InputKind::Bytes(reader) => {
                let filled = read_full(reader, &mut self.scratch)?;
                if filled == 0 {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::copy_from_slice(&self.scratch[..filled])))
                }
            }
        }
    }

    /// Whatever a single read yields, for feeding a compressor.
    pub fn read_some(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(rest) = self.leftover.take() {
            return Ok(Some(rest));
        }
        match &mut self.kind {
            InputKind::Packets(source) => source.read_packet(),
            InputKind::Bytes(reader) => loop {
                match reader.read(&mut self.scratch) {
                    Ok(0) => return Ok(None),
                    Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.scratch[..n]))),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Discard up to `n` bytes, returning how many were actually skipped.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut skipped = 0u64;
        if let Some(mut rest) = self.leftover.take() {
            let step = (rest.len() as u64).min(n) as usize;
            let _ = rest.split_to(step);
            skipped += step as u64;
            if !rest.is_empty() {
                self.leftover = Some(rest);
                return Ok(skipped);
            }
        }
        match &mut self.kind {
            InputKind::Bytes(reader) => {
                skipped += io::copy(&mut reader.take(n - skipped), &mut io::sink())?;
            }
            InputKind::Packets(source) => {
                while skipped < n {
                    let Some(mut packet) = source.read_packet()? else {
                        break;
                    };
                    let step = (packet.len() as u64).min(n - skipped) as usize;
                    let _ = packet.split_to(step);
                    skipped += step as u64;
                    if !packet.is_empty() {
                        self.leftover = Some(packet);
                    }
                }
            }
        }
        Ok(skipped)
    }

    /// Bytes known to be readable without blocking.
    pub fn buffered(&self) -> usize {
        self.leftover.as_ref().map_or(0, Bytes::len)
    }
}

fn read_full(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// =============================================================================
// Packet sink / encoding source
// =============================================================================

/// Where an [`Encode`] hook writes its output.
#[derive(Debug, Default)]
pub struct PacketSink {
    buffer: PacketBuffer,
    closed: bool,
}

impl PacketSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over a packet that should reach the wire as one unit.
    pub fn write_packet(&mut self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.check_open()?;
        self.buffer.write_packet(packet);
        Ok(())
    }

    /// Mark end of data. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered(&self) -> usize {
        self.buffer.remaining()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "packet sink already closed",
            ));
        }
        Ok(())
    }
}

impl Write for PacketSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.buffer.write(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Producer hook driven by an [`EncodingSource`].
pub trait Encode {
    /// Push roughly `suggested_len` more bytes into `sink`, or close it once
    /// there is nothing left to produce.
    fn encode(&mut self, sink: &mut PacketSink, suggested_len: usize) -> io::Result<()>;
}

impl<F> Encode for F
where
    F: FnMut(&mut PacketSink, usize) -> io::Result<()>,
{
    fn encode(&mut self, sink: &mut PacketSink, suggested_len: usize) -> io::Result<()> {
        self(sink, suggested_len)
    }
}

/// Pull-side view over an [`Encode`] hook.
pub struct EncodingSource<E> {
    sink: PacketSink,
    encoder: E,
    chunk_size: usize,
    no_delay: bool,
}

impl<E: Encode> EncodingSource<E> {
    pub fn new(encoder: E, chunk_size: usize) -> Self {
        Self::with_no_delay(encoder, chunk_size, false)
    }

    /// With `no_delay`, a packet is released as soon as one encode call
    /// produced anything instead of waiting for a full chunk.
    pub fn with_no_delay(encoder: E, chunk_size: usize, no_delay: bool) -> Self {
        Self {
            sink: PacketSink::new(),
            encoder,
            chunk_size: chunk_size.max(1),
            no_delay,
        }
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    /// Bytes ready without calling the hook again.
    pub fn available(&self) -> usize {
        self.sink.buffered()
    }

    /// Throw away at most `n` bytes.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let want = usize::try_from(n).unwrap_or(usize::MAX);
        self.fill(want, false)?;
        let step = want.min(self.sink.buffer.remaining());
        self.sink.buffer.skip(step)?;
        Ok(step as u64)
    }

    /// Call the hook until `want` bytes are buffered, a packet edge shows up,
    /// or the sink is closed.
    fn fill(&mut self, want: usize, stop_at_packet: bool) -> io::Result<()> {
        while !self.sink.closed && self.sink.buffer.remaining() < want {
            if stop_at_packet && self.sink.buffer.packets_available() > 0 {
                break;
            }
            let before = self.sink.buffer.remaining();
            let suggested = want - before;
            self.encoder.encode(&mut self.sink, suggested)?;
            if self.no_delay && self.sink.buffer.remaining() > before {
                break;
            }
        }
        Ok(())
    }
}

impl<E: Encode> PacketRead for EncodingSource<E> {
    fn read_packet(&mut self) -> io::Result<Option<Bytes>> {
        if self.sink.buffer.packets_available() == 0 {
            self.fill(self.chunk_size, true)?;
        }
        let max = if self.sink.buffer.packets_available() > 0 {
            usize::MAX
        } else {
            self.chunk_size
        };
        Ok(self.sink.buffer.read_packet_max(max))
    }
}

impl<E: Encode> Read for EncodingSource<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.sink.buffer.has_remaining() {
            self.fill(buf.len(), false)?;
        }
        Ok(self.sink.buffer.read_up_to(buf))
    }
}

// =============================================================================
// zstd
// =============================================================================

/// Streaming zstd compressor writing into any sink.
pub struct Compressor {
    encoder: Encoder<'static>,
    scratch: Vec<u8>,
}

impl Compressor {
    pub fn new(level: i32) -> io::Result<Self> {
        Ok(Self {
            encoder: Encoder::new(level)?,
            scratch: vec![0u8; COMPRESS_SCRATCH_SIZE],
        })
    }

    /// Compress `input`, returning how many compressed bytes reached `sink`.
    pub fn compress<W: Write + ?Sized>(&mut self, mut input: &[u8], sink: &mut W) -> io::Result<usize> {
        let mut produced = 0;
        while !input.is_empty() {
            let status = self.encoder.run_on_buffers(input, &mut self.scratch)?;
            sink.write_all(&self.scratch[..status.bytes_written])?;
            produced += status.bytes_written;
            input = &input[status.bytes_read..];
        }
        Ok(produced)
    }

    /// Emit everything buffered so far without ending the frame.
    pub fn flush<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        let mut produced = 0;
        loop {
            let mut out = OutBuffer::around(&mut self.scratch[..]);
            let remaining = self.encoder.flush(&mut out)?;
            let n = out.pos();
            sink.write_all(&self.scratch[..n])?;
            produced += n;
            if remaining == 0 {
                return Ok(produced);
            }
        }
    }

    /// End the frame, emitting the trailer.
    pub fn finish<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        let mut produced = 0;
        loop {
            let mut out = OutBuffer::around(&mut self.scratch[..]);
            let remaining = self.encoder.finish(&mut out, true)?;
            let n = out.pos();
            sink.write_all(&self.scratch[..n])?;
            produced += n;
            if remaining == 0 {
                return Ok(produced);
            }
        }
    }
}

/// Push-driven zstd decompressor.
pub struct Decompressor {
    decoder: Decoder<'static>,
    scratch: Vec<u8>,
    /// Set once the decoder reported a fully decoded and flushed frame.
    frame_done: bool,
}

impl Decompressor {
    /// `transfer_size` bounds each write handed to the sink.
    pub fn new(transfer_size: usize) -> io::Result<Self> {
        Ok(Self {
            decoder: Decoder::new()?,
            scratch: vec![0u8; transfer_size.max(1)],
            frame_done: false,
        })
    }

    /// Decode exactly the supplied compressed bytes, returning how many
    /// decompressed bytes reached `sink`.
    pub fn decompress<W: Write + ?Sized>(&mut self, mut input: &[u8], sink: &mut W) -> io::Result<usize> {
        let mut produced = 0;
        loop {
            let status = self.decoder.run_on_buffers(input, &mut self.scratch)?;
            if status.bytes_written > 0 {
                sink.write_all(&self.scratch[..status.bytes_written])?;
                produced += status.bytes_written;
            }
            input = &input[status.bytes_read..];
            if status.bytes_read > 0 || status.bytes_written > 0 {
                self.frame_done = status.remaining == 0;
            }
            // scratch not filled means the decoder holds no more output for this input
            if input.is_empty() && status.bytes_written < self.scratch.len() {
                return Ok(produced);
            }
        }
    }

    /// Verify the compressed stream ended on a frame edge.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.frame_done {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "compressed stream closed early",
            ));
        }
        Ok(())
    }
}
