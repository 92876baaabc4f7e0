//! Serializable stream handles.
//!
//! A handle carries only a remote reference and the client settings. The
//! live connection is rebuilt lazily by the receiving side on first use.

use crate::client::{InputStreamClient, OutputStreamClient, StreamRead};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::exporter::{Exporter, Resolver};
use crate::protocol::Direction;
use crate::remote::{RemoteInput, RemoteOutput};
use crate::retry::{RetryPolicy, RetryingInput, RetryingOutput};
use crate::server::{InputStreamServer, OutputStreamServer};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::debug;

/// Opaque address of an exported stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub id: u64,
    pub kind: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputHandle {
    pub remote: RemoteRef,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHandle {
    pub remote: RemoteRef,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
    /// zstd level used by the writing side when the server decompresses.
    pub compression_level: i32,
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StreamError::Codec(e.to_string()))
}

fn from_bytes<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StreamError::Codec(e.to_string()))
}

impl InputHandle {
    /// Export `server` and describe it with the client settings of `config`.
    pub fn export(
        server: Arc<InputStreamServer>,
        exporter: &dyn Exporter,
        config: &StreamConfig,
    ) -> Result<Self> {
        let remote = exporter.export_input(server)?;
        Ok(Self {
            remote,
            retry: config.retry.clone(),
            chunk_size: config.chunk_size,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_bytes(bytes)
    }

    pub fn open(self, resolver: Arc<dyn Resolver>) -> LazyInput {
        LazyInput {
            handle: self,
            resolver,
            client: None,
        }
    }

    fn connect(&self, resolver: &dyn Resolver) -> Result<InputStreamClient> {
        let remote = resolver.resolve_input(&self.remote)?;
        debug!(remote = self.remote.id, "input handle connected");
        InputStreamClient::new(remote, self.retry.clone(), self.chunk_size)
    }

    /// Close the remote stream as unsuccessful without ever reading it.
    fn release(&self, resolver: &dyn Resolver) -> Result<()> {
        let remote = resolver.resolve_input(&self.remote)?;
        RetryingInput::new(remote, self.retry.clone()).close(false)
    }
}

impl OutputHandle {
    pub fn export(
        server: Arc<OutputStreamServer>,
        exporter: &dyn Exporter,
        config: &StreamConfig,
    ) -> Result<Self> {
        let remote = exporter.export_output(server)?;
        Ok(Self {
            remote,
            retry: config.retry.clone(),
            chunk_size: config.output_chunk_size,
            compression_level: config.compression_level,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_bytes(bytes)
    }

    pub fn open(self, resolver: Arc<dyn Resolver>) -> LazyOutput {
        LazyOutput {
            handle: self,
            resolver,
            client: None,
        }
    }

    fn connect(&self, resolver: &dyn Resolver) -> Result<OutputStreamClient> {
        let remote = resolver.resolve_output(&self.remote)?;
        debug!(remote = self.remote.id, "output handle connected");
        let client = OutputStreamClient::new(remote, self.retry.clone(), self.chunk_size)?;
        Ok(client.with_compression_level(self.compression_level))
    }

    fn release(&self, resolver: &dyn Resolver) -> Result<()> {
        let remote = resolver.resolve_output(&self.remote)?;
        RetryingOutput::new(remote, self.retry.clone()).close(false)
    }
}

/// Reads through an [`InputHandle`], connecting on first use.
///
/// Dropping it before first use closes the remote stream as unsuccessful.
pub struct LazyInput {
    handle: InputHandle,
    resolver: Arc<dyn Resolver>,
    client: Option<InputStreamClient>,
}

impl LazyInput {
    pub fn handle(&self) -> &InputHandle {
        &self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn client(&mut self) -> Result<&mut InputStreamClient> {
        if self.client.is_none() {
            self.client = Some(self.handle.connect(self.resolver.as_ref())?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| StreamError::communication("input handle not connected"))
    }

    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.client()?.skip(n)
    }

    pub fn available(&mut self) -> Result<usize> {
        self.client()?.available()
    }

    /// Closes the remote stream, connecting first if needed.
    pub fn close(&mut self) -> Result<()> {
        self.client()?.close()
    }
}

impl Read for LazyInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.client()?.read(buf)
    }
}

impl StreamRead for LazyInput {
    fn close(&mut self) -> Result<()> {
        LazyInput::close(self)
    }
}

impl Drop for LazyInput {
    fn drop(&mut self) {
        // a connected client closes itself
        if self.client.is_some() {
            return;
        }
        if let Err(err) = self.handle.release(self.resolver.as_ref()) {
            debug!(
                remote = self.handle.remote.id,
                error = %err,
                "release of unused input handle failed"
            );
        }
    }
}

/// Writes through an [`OutputHandle`], connecting on first use.
///
/// Dropping it without `close` closes the remote stream as unsuccessful.
pub struct LazyOutput {
    handle: OutputHandle,
    resolver: Arc<dyn Resolver>,
    client: Option<OutputStreamClient>,
}

impl LazyOutput {
    pub fn handle(&self) -> &OutputHandle {
        &self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn client(&mut self) -> Result<&mut OutputStreamClient> {
        if self.client.is_none() {
            self.client = Some(self.handle.connect(self.resolver.as_ref())?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| StreamError::communication("output handle not connected"))
    }

    pub fn close(&mut self) -> Result<()> {
        self.client()?.close()
    }

    pub fn abort_close(&mut self) -> Result<()> {
        self.client()?.abort_close()
    }
}

impl Write for LazyOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.client()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.client()?.flush()
    }
}

impl Drop for LazyOutput {
    fn drop(&mut self) {
        if self.client.is_some() {
            return;
        }
        if let Err(err) = self.handle.release(self.resolver.as_ref()) {
            debug!(
                remote = self.handle.remote.id,
                error = %err,
                "release of unused output handle failed"
            );
        }
    }
}
