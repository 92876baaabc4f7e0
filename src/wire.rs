//! Wire codec for remote stream calls.
//!
//! Wire format: all multi-byte integers are big-endian.
//!
//! ```text
//! request: len:u32 | method:u16 | target:u64 | payload
//! reply:   len:u32 | tag:u8 | payload
//! ```
//!
//! `len` counts everything after itself.

use crate::error::{ErrorClass, Result, StreamError};
use crate::remote::{RemoteInput, RemoteOutput};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Method Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Method {
    OutputUsingCompression = 1301,
    OutputClose = 1302,
    OutputFlush = 1303,
    OutputWritePacket = 1304,
    InputUsingCompression = 1351,
    InputAvailable = 1352,
    InputClose = 1353,
    InputReadPacket = 1354,
    InputSkip = 1355,
}

impl Method {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1301 => Some(Self::OutputUsingCompression),
            1302 => Some(Self::OutputClose),
            1303 => Some(Self::OutputFlush),
            1304 => Some(Self::OutputWritePacket),
            1351 => Some(Self::InputUsingCompression),
            1352 => Some(Self::InputAvailable),
            1353 => Some(Self::InputClose),
            1354 => Some(Self::InputReadPacket),
            1355 => Some(Self::InputSkip),
            _ => None,
        }
    }
}

// =============================================================================
// Calls
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InputUsingCompression,
    InputAvailable,
    InputReadPacket { id: u32 },
    InputSkip { n: u64, id: u32 },
    InputClose { read_success: bool },
    OutputUsingCompression,
    OutputWritePacket { id: u32, packet: Bytes },
    OutputFlush,
    OutputClose { write_success: bool },
}

impl Call {
    pub fn method(&self) -> Method {
        match self {
            Call::InputUsingCompression => Method::InputUsingCompression,
            Call::InputAvailable => Method::InputAvailable,
            Call::InputReadPacket { .. } => Method::InputReadPacket,
            Call::InputSkip { .. } => Method::InputSkip,
            Call::InputClose { .. } => Method::InputClose,
            Call::OutputUsingCompression => Method::OutputUsingCompression,
            Call::OutputWritePacket { .. } => Method::OutputWritePacket,
            Call::OutputFlush => Method::OutputFlush,
            Call::OutputClose { .. } => Method::OutputClose,
        }
    }
}

/// A call addressed to one exported stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: u64,
    pub call: Call,
}

impl Request {
    pub fn new(target: u64, call: Call) -> Self {
        Self { target, call }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match &self.call {
            Call::InputUsingCompression
            | Call::InputAvailable
            | Call::OutputUsingCompression
            | Call::OutputFlush => {}
            Call::InputReadPacket { id } => payload.put_u32(*id),
            Call::InputSkip { n, id } => {
                payload.put_u64(*n);
                payload.put_u32(*id);
            }
            Call::InputClose { read_success } => payload.put_u8(*read_success as u8),
            Call::OutputWritePacket { id, packet } => {
                payload.put_u32(*id);
                payload.put_u32(packet.len() as u32);
                payload.put_slice(packet);
            }
            Call::OutputClose { write_success } => payload.put_u8(*write_success as u8),
        }

        let body_len = 2 + 8 + payload.len();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u16(self.call.method() as u16);
        buf.put_u64(self.target);
        buf.put_slice(&payload);
        buf.freeze()
    }

    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut body = open_frame(frame)?;
        if body.remaining() < 10 {
            return Err(codec("request header truncated"));
        }
        let code = body.get_u16();
        let target = body.get_u64();
        let method =
            Method::from_u16(code).ok_or_else(|| StreamError::unsupported(format!("method {code}")))?;

        let call = match method {
            Method::InputUsingCompression => Call::InputUsingCompression,
            Method::InputAvailable => Call::InputAvailable,
            Method::OutputUsingCompression => Call::OutputUsingCompression,
            Method::OutputFlush => Call::OutputFlush,
            Method::InputReadPacket => {
                need(&body, 4, "read-packet")?;
                Call::InputReadPacket { id: body.get_u32() }
            }
            Method::InputSkip => {
                need(&body, 12, "skip")?;
                Call::InputSkip {
                    n: body.get_u64(),
                    id: body.get_u32(),
                }
            }
            Method::InputClose => {
                need(&body, 1, "input close")?;
                Call::InputClose {
                    read_success: body.get_u8() != 0,
                }
            }
            Method::OutputWritePacket => {
                need(&body, 8, "write-packet")?;
                let id = body.get_u32();
                let len = body.get_u32() as usize;
                need(&body, len, "write-packet payload")?;
                Call::OutputWritePacket {
                    id,
                    packet: body.split_to(len),
                }
            }
            Method::OutputClose => {
                need(&body, 1, "output close")?;
                Call::OutputClose {
                    write_success: body.get_u8() != 0,
                }
            }
        };
        Ok(Self { target, call })
    }
}

// =============================================================================
// Replies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ReplyTag {
    Unit = 0x01,
    Bool = 0x02,
    Count = 0x03,
    Packet = 0x04,
    EndOfStream = 0x05,
    Error = 0x06,
}

impl ReplyTag {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Unit),
            0x02 => Some(Self::Bool),
            0x03 => Some(Self::Count),
            0x04 => Some(Self::Packet),
            0x05 => Some(Self::EndOfStream),
            0x06 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Reply {
    Unit,
    Bool(bool),
    Count(u64),
    Packet(Bytes),
    EndOfStream,
    Error(StreamError),
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        let tag = match self {
            Reply::Unit => ReplyTag::Unit,
            Reply::Bool(value) => {
                payload.put_u8(*value as u8);
                ReplyTag::Bool
            }
            Reply::Count(n) => {
                payload.put_u64(*n);
                ReplyTag::Count
            }
            Reply::Packet(packet) => {
                payload.put_slice(packet);
                ReplyTag::Packet
            }
            Reply::EndOfStream => ReplyTag::EndOfStream,
            Reply::Error(err) => {
                payload.put_u8(err.class() as u8);
                let (id, last) = match err {
                    StreamError::InvalidSequence { id, last } => (*id, *last),
                    _ => (0, 0),
                };
                payload.put_u32(id);
                payload.put_u32(last);
                let message = error_message(err);
                payload.put_u32(message.len() as u32);
                payload.put_slice(message.as_bytes());
                ReplyTag::Error
            }
        };

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u32(1 + payload.len() as u32);
        buf.put_u8(tag as u8);
        buf.put_slice(&payload);
        buf.freeze()
    }

    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut body = open_frame(frame)?;
        need(&body, 1, "reply tag")?;
        let raw = body.get_u8();
        let tag = ReplyTag::from_u8(raw).ok_or_else(|| codec(format!("unknown reply tag {raw}")))?;
        Ok(match tag {
            ReplyTag::Unit => Reply::Unit,
            ReplyTag::Bool => {
                need(&body, 1, "bool reply")?;
                Reply::Bool(body.get_u8() != 0)
            }
            ReplyTag::Count => {
                need(&body, 8, "count reply")?;
                Reply::Count(body.get_u64())
            }
            ReplyTag::Packet => Reply::Packet(body),
            ReplyTag::EndOfStream => Reply::EndOfStream,
            ReplyTag::Error => {
                need(&body, 13, "error reply")?;
                let class = body.get_u8();
                let id = body.get_u32();
                let last = body.get_u32();
                let len = body.get_u32() as usize;
                need(&body, len, "error message")?;
                let message = String::from_utf8_lossy(&body.split_to(len)).into_owned();
                let class = ErrorClass::from_u8(class)
                    .ok_or_else(|| codec(format!("unknown error class {class}")))?;
                Reply::Error(rebuild_error(class, id, last, message))
            }
        })
    }

    /// Turn an error reply back into `Err`.
    fn ok(self) -> Result<Self> {
        match self {
            Reply::Error(err) => Err(err),
            other => Ok(other),
        }
    }

    pub fn into_unit(self) -> Result<()> {
        match self.ok()? {
            Reply::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self.ok()? {
            Reply::Bool(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_count(self) -> Result<u64> {
        match self.ok()? {
            Reply::Count(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_packet(self) -> Result<Option<Bytes>> {
        match self.ok()? {
            Reply::Packet(packet) => Ok(Some(packet)),
            Reply::EndOfStream => Ok(None),
            other => Err(unexpected(&other)),
        }
    }
}

impl<T: Into<Reply>> From<Result<T>> for Reply {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(err) => Reply::Error(err),
        }
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Unit
    }
}

impl From<bool> for Reply {
    fn from(value: bool) -> Self {
        Reply::Bool(value)
    }
}

impl From<u64> for Reply {
    fn from(n: u64) -> Self {
        Reply::Count(n)
    }
}

impl From<Option<Bytes>> for Reply {
    fn from(packet: Option<Bytes>) -> Self {
        match packet {
            Some(packet) => Reply::Packet(packet),
            None => Reply::EndOfStream,
        }
    }
}

fn error_message(err: &StreamError) -> String {
    match err {
        StreamError::Communication(msg)
        | StreamError::Unsupported(msg)
        | StreamError::Codec(msg)
        | StreamError::Config(msg) => msg.clone(),
        StreamError::Io(e) => e.to_string(),
        StreamError::InvalidSequence { .. } | StreamError::Aborted | StreamError::ClosedOrAborted => {
            String::new()
        }
    }
}

fn rebuild_error(class: ErrorClass, id: u32, last: u32, message: String) -> StreamError {
    match class {
        ErrorClass::Communication => StreamError::Communication(message),
        ErrorClass::Io => StreamError::Io(io::Error::other(message)),
        ErrorClass::InvalidSequence => StreamError::InvalidSequence { id, last },
        ErrorClass::Aborted => StreamError::Aborted,
        ErrorClass::Unsupported => StreamError::Unsupported(message),
        ErrorClass::ClosedOrAborted => StreamError::ClosedOrAborted,
        ErrorClass::Codec => StreamError::Codec(message),
        ErrorClass::Config => StreamError::Config(message),
    }
}

fn open_frame(mut frame: Bytes) -> Result<Bytes> {
    need(&frame, 4, "frame length")?;
    let len = frame.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(codec(format!("frame of {len} bytes exceeds limit")));
    }
    if frame.remaining() != len {
        return Err(codec(format!(
            "frame length {len} but {} bytes present",
            frame.remaining()
        )));
    }
    Ok(frame)
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(codec(format!(
            "{what} truncated: expected {n} bytes, got {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn codec(message: impl Into<String>) -> StreamError {
    StreamError::Codec(message.into())
}

fn unexpected(reply: &Reply) -> StreamError {
    codec(format!("unexpected reply {reply:?}"))
}

// =============================================================================
// Dispatch
// =============================================================================

/// Run a decoded call against an input stream.
pub fn invoke_input(server: &dyn RemoteInput, call: Call) -> Reply {
    match call {
        Call::InputUsingCompression => server.using_compression().into(),
        Call::InputAvailable => server.available().map(|n| n as u64).into(),
        Call::InputReadPacket { id } => server.read_packet(id).into(),
        Call::InputSkip { n, id } => server.skip(n, id).into(),
        Call::InputClose { read_success } => server.close(read_success).into(),
        other => Reply::Error(StreamError::unsupported(format!(
            "{:?} on an input stream",
            other.method()
        ))),
    }
}

/// Run a decoded call against an output stream.
pub fn invoke_output(server: &dyn RemoteOutput, call: Call) -> Reply {
    match call {
        Call::OutputUsingCompression => server.using_compression().into(),
        Call::OutputWritePacket { id, packet } => server.write_packet(packet, id).into(),
        Call::OutputFlush => server.flush().into(),
        Call::OutputClose { write_success } => server.close(write_success).into(),
        other => Reply::Error(StreamError::unsupported(format!(
            "{:?} on an output stream",
            other.method()
        ))),
    }
}

// =============================================================================
// Proxies
// =============================================================================

/// Carries one encoded request and returns the encoded reply.
///
/// A transport failure must surface as [`StreamError::Communication`].
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: Bytes) -> Result<Bytes>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn round_trip(&self, request: Bytes) -> Result<Bytes> {
        (**self).round_trip(request)
    }
}

fn send<T: Transport + ?Sized>(transport: &T, target: u64, call: Call) -> Result<Reply> {
    let reply = transport.round_trip(Request::new(target, call).encode())?;
    Reply::decode(reply)
}

/// [`RemoteInput`] over a [`Transport`].
pub struct InputProxy<T> {
    transport: T,
    target: u64,
}

impl<T: Transport> InputProxy<T> {
    pub fn new(transport: T, target: u64) -> Self {
        Self { transport, target }
    }
}

impl<T: Transport> RemoteInput for InputProxy<T> {
    fn using_compression(&self) -> Result<bool> {
        send(&self.transport, self.target, Call::InputUsingCompression)?.into_bool()
    }

    fn available(&self) -> Result<usize> {
        let n = send(&self.transport, self.target, Call::InputAvailable)?.into_count()?;
        Ok(usize::try_from(n).unwrap_or(usize::MAX))
    }

    fn read_packet(&self, id: u32) -> Result<Option<Bytes>> {
        send(&self.transport, self.target, Call::InputReadPacket { id })?.into_packet()
    }

    fn skip(&self, n: u64, id: u32) -> Result<u64> {
        send(&self.transport, self.target, Call::InputSkip { n, id })?.into_count()
    }

    fn close(&self, read_success: bool) -> Result<()> {
        send(&self.transport, self.target, Call::InputClose { read_success })?.into_unit()
    }
}

/// [`RemoteOutput`] over a [`Transport`].
pub struct OutputProxy<T> {
    transport: T,
    target: u64,
}

impl<T: Transport> OutputProxy<T> {
    pub fn new(transport: T, target: u64) -> Self {
        Self { transport, target }
    }
}

impl<T: Transport> RemoteOutput for OutputProxy<T> {
    fn using_compression(&self) -> Result<bool> {
        send(&self.transport, self.target, Call::OutputUsingCompression)?.into_bool()
    }

    fn write_packet(&self, packet: Bytes, id: u32) -> Result<()> {
        send(
            &self.transport,
            self.target,
            Call::OutputWritePacket { id, packet },
        )?
        .into_unit()
    }

    fn flush(&self) -> Result<()> {
        send(&self.transport, self.target, Call::OutputFlush)?.into_unit()
    }

    fn close(&self, write_success: bool) -> Result<()> {
        send(&self.transport, self.target, Call::OutputClose { write_success })?.into_unit()
    }
}
