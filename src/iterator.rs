//! Object streams layered on the byte protocol.
//!
//! Objects travel as `len:u32 | bytes` frames inside an ordinary input
//! stream. [`IteratorServer`] encodes objects on demand as the client pulls
//! packets, and [`IteratorClient`] decodes them back on the other side.

use crate::client::StreamRead;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::exporter::Exporter;
use crate::framing::{Encode, EncodingSource, LocalInput, PacketSink};
use crate::handle::InputHandle;
use crate::monitor::StreamMonitor;
use crate::pipe::{self, Sink};
use crate::server::InputStreamServer;
use crate::wire::MAX_FRAME_SIZE;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, Read, Write};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

// =============================================================================
// Codecs
// =============================================================================

pub trait ObjectCodec<T>: Send + Sync {
    fn encode(&self, item: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

pub struct BincodeCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned> ObjectCodec<T> for BincodeCodec<T> {
    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        bincode::serialize(item).map_err(|e| StreamError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| StreamError::Codec(e.to_string()))
    }
}

pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned> ObjectCodec<T> for JsonCodec<T> {
    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(item).map_err(|e| StreamError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| StreamError::Codec(e.to_string()))
    }
}

// =============================================================================
// Pull iterators
// =============================================================================

/// Pull interface whose steps may fail.
pub trait IoIterator<T> {
    fn has_next(&mut self) -> Result<bool>;

    fn next_item(&mut self) -> Result<Option<T>>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Adapts any [`Iterator`].
pub struct IterAdapter<I: Iterator> {
    inner: std::iter::Peekable<I>,
}

impl<I: Iterator> IterAdapter<I> {
    pub fn new(inner: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            inner: inner.into_iter().peekable(),
        }
    }
}

impl<I: Iterator> IoIterator<I::Item> for IterAdapter<I> {
    fn has_next(&mut self) -> Result<bool> {
        Ok(self.inner.peek().is_some())
    }

    fn next_item(&mut self) -> Result<Option<I::Item>> {
        Ok(self.inner.next())
    }
}

/// Maps each item of another [`IoIterator`].
pub struct ConvertingIterator<I, F, S> {
    inner: I,
    convert: F,
    _source: PhantomData<fn() -> S>,
}

impl<I, F, S> ConvertingIterator<I, F, S> {
    pub fn new(inner: I, convert: F) -> Self {
        Self {
            inner,
            convert,
            _source: PhantomData,
        }
    }
}

impl<I, F, S, T> IoIterator<T> for ConvertingIterator<I, F, S>
where
    I: IoIterator<S>,
    F: FnMut(S) -> Result<T>,
{
    fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next()
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        self.inner.next_item()?.map(&mut self.convert).transpose()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Lines of a [`BufRead`], without line terminators.
pub struct LineIterator<R> {
    reader: R,
    trim: bool,
    skip_blank: bool,
    peeked: Option<String>,
    done: bool,
}

impl<R: BufRead> LineIterator<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            trim: false,
            skip_blank: false,
            peeked: None,
            done: false,
        }
    }

    pub fn trimmed(mut self, trim: bool) -> Self {
        self.trim = trim;
        self
    }

    pub fn skip_blank(mut self, skip_blank: bool) -> Self {
        self.skip_blank = skip_blank;
        self
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let end = line.trim_end_matches(&['\n', '\r'][..]).len();
            line.truncate(end);
            if self.trim {
                line = line.trim().to_string();
            }
            if self.skip_blank && line.trim().is_empty() {
                continue;
            }
            return Ok(Some(line));
        }
    }
}

impl<R: BufRead> IoIterator<String> for LineIterator<R> {
    fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() && !self.done {
            self.peeked = self.read_line()?;
            self.done = self.peeked.is_none();
        }
        Ok(self.peeked.is_some())
    }

    fn next_item(&mut self) -> Result<Option<String>> {
        self.has_next()?;
        Ok(self.peeked.take())
    }

    fn close(&mut self) -> Result<()> {
        self.done = true;
        self.peeked = None;
        Ok(())
    }
}

// =============================================================================
// Server side
// =============================================================================

/// Encode hook writing one framed object per call.
struct ObjectEncoder<I, C, T> {
    items: Arc<Mutex<I>>,
    codec: C,
    /// Each object becomes its own packet.
    packet_per_object: bool,
    _item: PhantomData<fn() -> T>,
}

impl<I, C, T> Encode for ObjectEncoder<I, C, T>
where
    I: IoIterator<T>,
    C: ObjectCodec<T>,
{
    fn encode(&mut self, sink: &mut PacketSink, _suggested_len: usize) -> io::Result<()> {
        let item = {
            let mut items = self
                .items
                .lock()
                .map_err(|_| io::Error::other("object iterator lock poisoned"))?;
            items.next_item()?
        };
        let Some(item) = item else {
            sink.close();
            return Ok(());
        };
        let bytes = self.codec.encode(&item)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "object too large"));
        }
        let len = bytes.len() as u32;
        let mut frame = BytesMut::with_capacity(4 + bytes.len());
        frame.put_u32(len);
        frame.put_slice(&bytes);
        if self.packet_per_object {
            sink.write_packet(frame.freeze())
        } else {
            sink.write_all(&frame)
        }
    }
}

/// Serves a sequence of objects as an input stream.
pub struct IteratorServer {
    stream: Arc<InputStreamServer>,
}

impl IteratorServer {
    pub fn new<T, I, C>(
        items: I,
        codec: C,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
    ) -> Result<Self>
    where
        T: 'static,
        I: IoIterator<T> + Send + 'static,
        C: ObjectCodec<T> + 'static,
    {
        let items = Arc::new(Mutex::new(items));
        let no_delay = config.effective_no_delay();
        let encoder = ObjectEncoder {
            items: Arc::clone(&items),
            codec,
            packet_per_object: no_delay,
            _item: PhantomData,
        };
        let source = EncodingSource::with_no_delay(encoder, config.chunk_size, no_delay);
        let local = if config.compression {
            LocalInput::reader(source, config.chunk_size)
        } else {
            LocalInput::packets(source)
        };
        let stream = Arc::new(InputStreamServer::new(local, config, monitor)?);

        stream.on_close(move |clean| {
            let mut items = match items.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(err) = items.close() {
                warn!(error = %err, "closing object iterator failed");
            }
            debug!(clean, "iterator server closed");
        });
        Ok(Self { stream })
    }

    /// Server fed by a background producer through a bounded pipe.
    pub fn from_pipe<T, C>(
        codec: C,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
    ) -> Result<(Self, Sink<T>)>
    where
        T: Send + 'static,
        C: ObjectCodec<T> + 'static,
    {
        let (sink, source) = pipe::pipe(config.pipe_capacity);
        let server = Self::new(source, codec, config, monitor)?;
        Ok((server, sink))
    }

    pub fn stream(&self) -> &Arc<InputStreamServer> {
        &self.stream
    }

    pub fn export(&self, exporter: &dyn Exporter, config: &StreamConfig) -> Result<InputHandle> {
        InputHandle::export(Arc::clone(&self.stream), exporter, config)
    }

    pub fn abort(&self) {
        self.stream.abort();
    }

    pub fn close(&self) -> Result<()> {
        self.stream.close(true)
    }
}

// =============================================================================
// Client side
// =============================================================================

/// Decodes objects from a remote input stream.
pub struct IteratorClient<T, C, R> {
    input: R,
    codec: C,
    peeked: Option<T>,
    done: bool,
}

impl<T, C, R> IteratorClient<T, C, R>
where
    C: ObjectCodec<T>,
    R: StreamRead,
{
    pub fn new(input: R, codec: C) -> Self {
        Self {
            input,
            codec,
            peeked: None,
            done: false,
        }
    }

    fn read_object(&mut self) -> Result<Option<T>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.input.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(StreamError::Codec("object frame header truncated".into()));
            }
            filled += n;
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(StreamError::Codec(format!(
                "object frame of {len} bytes exceeds limit"
            )));
        }
        let mut bytes = vec![0u8; len];
        self.input.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StreamError::Codec("object frame truncated".into())
            } else {
                crate::error::from_io(e)
            }
        })?;
        self.codec.decode(&bytes).map(Some)
    }

    pub fn into_inner(self) -> R {
        self.input
    }
}

impl<T, C, R> IoIterator<T> for IteratorClient<T, C, R>
where
    C: ObjectCodec<T>,
    R: StreamRead,
{
    fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() && !self.done {
            self.peeked = self.read_object()?;
            self.done = self.peeked.is_none();
        }
        Ok(self.peeked.is_some())
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        self.has_next()?;
        Ok(self.peeked.take())
    }

    fn close(&mut self) -> Result<()> {
        self.peeked = None;
        self.input.close()
    }
}

impl<T, C, R> Iterator for IteratorClient<T, C, R>
where
    C: ObjectCodec<T>,
    R: StreamRead,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InputStreamClient;
    use crate::monitor;
    use crate::retry::RetryPolicy;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        name: String,
    }

    fn records(n: u32) -> Vec<Record> {
        (0..n)
            .map(|id| Record {
                id,
                name: format!("record-{id}"),
            })
            .collect()
    }

    fn client_for(
        server: &IteratorServer,
    ) -> IteratorClient<Record, BincodeCodec<Record>, InputStreamClient> {
        let input =
            InputStreamClient::new(server.stream().clone(), RetryPolicy::Never, 1024).unwrap();
        IteratorClient::new(input, BincodeCodec::default())
    }

    #[test]
    fn test_objects_round_trip() {
        for config in [StreamConfig::uncompressed(), StreamConfig::default()] {
            let server = IteratorServer::new(
                IterAdapter::new(records(500)),
                BincodeCodec::default(),
                &config.with_chunk_size(256),
                monitor::noop(),
            )
            .unwrap();
            let got: Vec<Record> = client_for(&server).collect::<Result<_>>().unwrap();
            assert_eq!(got, records(500));
        }
    }

    #[test]
    fn test_no_delay_packet_per_object() {
        let config = StreamConfig::uncompressed().with_no_delay(true);
        let server = IteratorServer::new(
            IterAdapter::new(records(3)),
            BincodeCodec::default(),
            &config,
            monitor::noop(),
        )
        .unwrap();
        let codec = BincodeCodec::<Record>::default();
        for expected in records(3) {
            let packet = server.stream().read_packet(expected.id).unwrap().unwrap();
            assert_eq!(codec.decode(&packet[4..]).unwrap(), expected);
        }
        assert!(server.stream().read_packet(3).unwrap().is_none());
    }

    #[test]
    fn test_empty_iterator() {
        let server = IteratorServer::new(
            IterAdapter::new(Vec::<Record>::new()),
            BincodeCodec::default(),
            &StreamConfig::default(),
            monitor::noop(),
        )
        .unwrap();
        let mut client = client_for(&server);
        assert!(!client.has_next().unwrap());
        client.close().unwrap();
        assert!(server.stream().is_closed());
    }

    #[test]
    fn test_close_closes_local_iterator() {
        struct Tracked(Arc<Mutex<bool>>);
        impl IoIterator<Record> for Tracked {
            fn has_next(&mut self) -> Result<bool> {
                Ok(true)
            }
            fn next_item(&mut self) -> Result<Option<Record>> {
                Ok(Some(Record {
                    id: 0,
                    name: String::new(),
                }))
            }
            fn close(&mut self) -> Result<()> {
                *self.0.lock().unwrap() = true;
                Ok(())
            }
        }

        let closed = Arc::new(Mutex::new(false));
        let server = IteratorServer::new(
            Tracked(Arc::clone(&closed)),
            JsonCodec::default(),
            &StreamConfig::uncompressed(),
            monitor::noop(),
        )
        .unwrap();
        server.close().unwrap();
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_line_iterator() {
        let text = "alpha\r\n  beta  \n\n   \ngamma";
        let mut lines = LineIterator::new(Cursor::new(text))
            .trimmed(true)
            .skip_blank(true);
        let mut got = Vec::new();
        while let Some(line) = lines.next_item().unwrap() {
            got.push(line);
        }
        assert_eq!(got, vec!["alpha", "beta", "gamma"]);

        let mut raw = LineIterator::new(Cursor::new("a\n\nb\n"));
        assert_eq!(raw.next_item().unwrap().as_deref(), Some("a"));
        assert_eq!(raw.next_item().unwrap().as_deref(), Some(""));
        assert_eq!(raw.next_item().unwrap().as_deref(), Some("b"));
        assert!(!raw.has_next().unwrap());
    }

    #[test]
    fn test_converting_iterator() {
        let mut lengths = ConvertingIterator::new(
            IterAdapter::new(vec!["a".to_string(), "abc".to_string()]),
            |s: String| -> Result<usize> { Ok(s.len()) },
        );
        assert_eq!(lengths.next_item().unwrap(), Some(1));
        assert_eq!(lengths.next_item().unwrap(), Some(3));
        assert_eq!(lengths.next_item().unwrap(), None);
    }

    #[test]
    fn test_truncated_or_oversized_frame_is_codec_error() {
        struct Raw(Cursor<Vec<u8>>);
        impl Read for Raw {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl StreamRead for Raw {
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut frame = 10u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"abc");
        let mut client =
            IteratorClient::<Record, _, _>::new(Raw(Cursor::new(frame)), BincodeCodec::default());
        assert!(matches!(client.has_next(), Err(StreamError::Codec(_))));

        let huge = u32::MAX.to_be_bytes().to_vec();
        let mut client =
            IteratorClient::<Record, _, _>::new(Raw(Cursor::new(huge)), BincodeCodec::default());
        assert!(matches!(client.has_next(), Err(StreamError::Codec(_))));
    }
}
