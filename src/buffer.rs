//! Packet-aware byte buffer.
//!
//! Raw bytes and whole packets can be written and read in any interleaving.
//! Each packet written with [`PacketBuffer::write_packet`] records a boundary
//! so that a later [`PacketBuffer::read_packet`] hands back exactly that
//! slice (without copying, when nothing has nibbled at it in between).
//!
//! ```text
//!  read_pos                      boundaries                     write_pos
//!     |  raw  |      packet      |   raw    |  packet  |    raw    |
//!     +-------+------------------+----------+----------+-----------+
//!             ^                  ^          ^          ^
//! ```
//!
//! Not synchronized; owners lock around it.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;

#[derive(Debug, Default)]
pub struct PacketBuffer {
    /// Frozen data, oldest first. Everything here precedes `tail`.
    segments: VecDeque<Bytes>,
    /// Raw bytes written since the last packet.
    tail: BytesMut,
    /// Absolute stream offsets where a packet ends, all in `(read_pos, write_pos]`.
    boundaries: VecDeque<u64>,
    read_pos: u64,
    write_pos: u64,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remaining(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    pub fn has_remaining(&self) -> bool {
        self.write_pos > self.read_pos
    }

    /// Number of pending boundaries, i.e. how many upcoming `read_packet`
    /// calls will end exactly on a recorded packet edge.
    pub fn packets_available(&self) -> usize {
        self.boundaries.len()
    }

    /// Append raw bytes.
    pub fn write(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        self.tail.extend_from_slice(buf);
        self.write_pos += buf.len() as u64;
    }

    /// Append a whole packet. The buffer takes ownership of it.
    pub fn write_packet(&mut self, packet: impl Into<Bytes>) {
        let packet = packet.into();
        if packet.is_empty() {
            return;
        }

        // close off any raw run so the packet starts on its own edge
        let last_edge = self.boundaries.back().copied().unwrap_or(self.read_pos);
        if self.write_pos > last_edge {
            self.boundaries.push_back(self.write_pos);
        }
        if !self.tail.is_empty() {
            let raw = self.tail.split().freeze();
            self.segments.push_back(raw);
        }

        self.write_pos += packet.len() as u64;
        self.segments.push_back(packet);
        self.boundaries.push_back(self.write_pos);
    }

    /// Consume exactly `dest.len()` bytes.
    pub fn read(&mut self, dest: &mut [u8]) -> io::Result<()> {
        self.check_remaining(dest.len())?;
        let mut filled = 0;
        while filled < dest.len() {
            let want = dest.len() - filled;
            let n = match self.segments.front_mut() {
                Some(seg) => {
                    let n = want.min(seg.len());
                    dest[filled..filled + n].copy_from_slice(&seg[..n]);
                    seg.advance(n);
                    if seg.is_empty() {
                        self.segments.pop_front();
                    }
                    n
                }
                None => {
                    let n = want.min(self.tail.len());
                    dest[filled..filled + n].copy_from_slice(&self.tail[..n]);
                    self.tail.advance(n);
                    n
                }
            };
            filled += n;
        }
        self.consumed(dest.len());
        Ok(())
    }

    /// Read up to `dest.len()` bytes, returning how many were copied.
    pub fn read_up_to(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.remaining());
        // cannot fail, n is within remaining()
        let _ = self.read(&mut dest[..n]);
        n
    }

    /// Discard exactly `n` bytes from the front.
    pub fn skip(&mut self, n: usize) -> io::Result<()> {
        self.check_remaining(n)?;
        let mut left = n;
        while left > 0 {
            match self.segments.front_mut() {
                Some(seg) => {
                    let step = left.min(seg.len());
                    seg.advance(step);
                    if seg.is_empty() {
                        self.segments.pop_front();
                    }
                    left -= step;
                }
                None => {
                    self.tail.advance(left);
                    left = 0;
                }
            }
        }
        self.consumed(n);
        Ok(())
    }

    /// Take the bytes up to the next packet edge, or everything buffered when
    /// no edge is pending. `None` when empty.
    pub fn read_packet(&mut self) -> Option<Bytes> {
        self.read_packet_max(usize::MAX)
    }

    /// Like [`read_packet`](Self::read_packet) but never longer than `max`.
    pub fn read_packet_max(&mut self, max: usize) -> Option<Bytes> {
        if !self.has_remaining() || max == 0 {
            return None;
        }
        let end = self.boundaries.front().copied().unwrap_or(self.write_pos);
        let len = ((end - self.read_pos) as usize).min(max);

        let packet = match self.segments.front().map(Bytes::len) {
            Some(front_len) if front_len >= len => {
                let out = match self.segments.front_mut() {
                    Some(seg) => seg.split_to(len),
                    None => Bytes::new(),
                };
                if front_len == len {
                    self.segments.pop_front();
                }
                out
            }
            Some(_) => self.gather(len),
            None => self.tail.split_to(len).freeze(),
        };
        self.consumed(len);
        Some(packet)
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.tail.clear();
        self.boundaries.clear();
        self.read_pos = self.write_pos;
    }

    fn gather(&mut self, len: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            let want = len - out.len();
            match self.segments.front_mut() {
                Some(seg) => {
                    let n = want.min(seg.len());
                    out.extend_from_slice(&seg[..n]);
                    seg.advance(n);
                    if seg.is_empty() {
                        self.segments.pop_front();
                    }
                }
                None => {
                    out.extend_from_slice(&self.tail[..want]);
                    self.tail.advance(want);
                }
            }
        }
        out.freeze()
    }

    fn check_remaining(&self, n: usize) -> io::Result<()> {
        if n > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "requested {} bytes but only {} buffered",
                    n,
                    self.remaining()
                ),
            ));
        }
        Ok(())
    }

    fn consumed(&mut self, n: usize) {
        self.read_pos += n as u64;
        while matches!(self.boundaries.front(), Some(&b) if b <= self.read_pos) {
            self.boundaries.pop_front();
        }
    }
}

impl io::Write for PacketBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PacketBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
