use super::advance;
use crate::error::{Result, StreamError};
use crate::framing::{Compressor, DEFAULT_COMPRESSION_LEVEL};
use crate::remote::RemoteOutput;
use crate::retry::{RetryPolicy, RetryingOutput};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// Blocking writer over a [`RemoteOutput`].
///
/// Writes accumulate into `chunk_size` packets. When the server expects
/// compressed data the packets carry zstd output produced here.
pub struct OutputStreamClient {
    remote: RetryingOutput<Arc<dyn RemoteOutput>>,
    compressed: bool,
    /// Created on first data.
    compressor: Option<Compressor>,
    level: i32,
    pending: BytesMut,
    chunk_size: usize,
    next_write_id: u32,
    closed: bool,
}

impl OutputStreamClient {
    pub fn new(remote: Arc<dyn RemoteOutput>, retry: RetryPolicy, chunk_size: usize) -> Result<Self> {
        let remote = RetryingOutput::new(remote, retry);
        let compressed = remote.using_compression()?;
        let chunk_size = chunk_size.max(1);
        Ok(Self {
            remote,
            compressed,
            compressor: None,
            level: DEFAULT_COMPRESSION_LEVEL,
            pending: BytesMut::with_capacity(chunk_size),
            chunk_size,
            next_write_id: 0,
            closed: false,
        })
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn using_compression(&self) -> bool {
        self.compressed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StreamError::ClosedOrAborted);
        }
        Ok(())
    }

    fn send(&mut self, packet: Bytes) -> Result<()> {
        self.remote.write_packet(packet, self.next_write_id)?;
        advance(&mut self.next_write_id)
    }

    fn send_full_chunks(&mut self) -> Result<()> {
        while self.pending.len() >= self.chunk_size {
            let packet = self.pending.split_to(self.chunk_size).freeze();
            self.send(packet)?;
        }
        Ok(())
    }

    fn send_pending(&mut self) -> Result<()> {
        self.send_full_chunks()?;
        if !self.pending.is_empty() {
            let packet = self.pending.split().freeze();
            self.send(packet)?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(());
        }
        if self.compressed {
            let compressor = match &mut self.compressor {
                Some(compressor) => compressor,
                slot => slot.insert(Compressor::new(self.level)?),
            };
            let mut sink = (&mut self.pending).writer();
            compressor.compress(buf, &mut sink)?;
        } else {
            self.pending.extend_from_slice(buf);
        }
        self.send_full_chunks()
    }

    /// Push everything written so far to the server and flush it there.
    pub fn flush_remote(&mut self) -> Result<()> {
        self.check_open()?;
        if let Some(compressor) = &mut self.compressor {
            let mut sink = (&mut self.pending).writer();
            compressor.flush(&mut sink)?;
        }
        self.send_pending()?;
        self.remote.flush()
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(compressor) = &mut self.compressor {
            let mut sink = (&mut self.pending).writer();
            compressor.finish(&mut sink)?;
        }
        self.send_pending()
    }

    /// Send the tail and close the server side as successful. If sending
    /// fails the server is closed as unsuccessful instead. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.finish() {
            Ok(()) => self.remote.close(true),
            Err(err) => {
                warn!(error = %err, "output stream client failed to finish");
                if let Err(close_err) = self.remote.close(false) {
                    debug!(error = %close_err, "ignoring secondary close failure");
                }
                Err(err)
            }
        }
    }

    /// Drop unsent data and close the server side as unsuccessful.
    pub fn abort_close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.compressor = None;
        self.remote.close(false)
    }
}

impl Write for OutputStreamClient {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_remote()?)
    }
}

impl Drop for OutputStreamClient {
    fn drop(&mut self) {
        if !self.closed {
            debug!("output stream client dropped without close");
            if let Err(err) = self.abort_close() {
                debug!(error = %err, "close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::monitor::TransferStats;
    use crate::server::OutputStreamServer;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn text(len: usize) -> Vec<u8> {
        b"lorem ipsum dolor sit amet "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    fn pair(
        config: &StreamConfig,
        stats: Arc<TransferStats>,
    ) -> (OutputStreamClient, Arc<OutputStreamServer>, Shared) {
        let sink = Shared::default();
        let server = Arc::new(OutputStreamServer::new(sink.clone(), config, stats).unwrap());
        let client =
            OutputStreamClient::new(server.clone(), RetryPolicy::Never, config.output_chunk_size)
                .unwrap();
        (client, server, sink)
    }

    #[test]
    fn test_writes_packed_into_chunks() {
        let stats = Arc::new(TransferStats::new());
        let mut config = StreamConfig::uncompressed();
        config.output_chunk_size = 100;
        let (mut client, server, sink) = pair(&config, stats.clone());

        for piece in text(1050).chunks(33) {
            client.write_all(piece).unwrap();
        }
        client.close().unwrap();

        assert_eq!(*sink.0.lock().unwrap(), text(1050));
        assert!(server.is_closed());
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_moved, 1050);
        assert!(snap.clean_close);
    }

    #[test]
    fn test_compressed_round_trip() {
        let stats = Arc::new(TransferStats::new());
        let (mut client, _, sink) = pair(&StreamConfig::default(), stats.clone());
        let data = text(200_000);
        client.write_all(&data).unwrap();
        client.close().unwrap();

        assert_eq!(*sink.0.lock().unwrap(), data);
        let snap = stats.snapshot();
        assert!(snap.bytes_moved < data.len() as u64);
        assert_eq!(snap.local_bytes_moved, data.len() as u64);
    }

    #[test]
    fn test_flush_delivers_partial_chunk() {
        let mut config = StreamConfig::default();
        config.output_chunk_size = 1 << 20;
        let (mut client, _, sink) = pair(&config, Arc::new(TransferStats::new()));
        client.write_all(b"first line\n").unwrap();
        client.flush().unwrap();
        assert_eq!(*sink.0.lock().unwrap(), b"first line\n");
        client.close().unwrap();
    }

    #[test]
    fn test_drop_without_close_is_unclean() {
        let stats = Arc::new(TransferStats::new());
        {
            let (mut client, _, _) = pair(&StreamConfig::uncompressed(), stats.clone());
            client.write_all(b"abandoned").unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.closes, 1);
        assert!(!snap.clean_close);
    }

    #[test]
    fn test_write_after_close_fails() {
        let server = Arc::new(OutputStreamServer::plain(Shared::default()).unwrap());
        let mut client = OutputStreamClient::new(server, RetryPolicy::Never, 16).unwrap();
        client.close().unwrap();
        assert!(client.write(b"late").is_err());
        assert!(client.close().is_ok());
    }

    #[test]
    fn test_empty_compressed_output() {
        let (mut client, server, sink) = pair(&StreamConfig::default(), Arc::new(TransferStats::new()));
        client.close().unwrap();
        assert!(server.is_closed());
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
