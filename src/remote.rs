//! The remotely callable surface of a stream server.
//!
//! Both directions are idempotent by sequence id, so any method may be
//! re-issued after a lost response.

use crate::error::Result;
use bytes::Bytes;
use std::sync::Arc;

/// Server reads locally, client pulls packets.
pub trait RemoteInput: Send + Sync {
    fn using_compression(&self) -> Result<bool>;

    /// Approximate, non-blocking hint.
    fn available(&self) -> Result<usize>;

    /// `None` signals end of stream.
    fn read_packet(&self, id: u32) -> Result<Option<Bytes>>;

    fn skip(&self, n: u64, id: u32) -> Result<u64>;

    fn close(&self, read_success: bool) -> Result<()>;
}

/// Client pushes packets, server writes locally.
pub trait RemoteOutput: Send + Sync {
    fn using_compression(&self) -> Result<bool>;

    fn write_packet(&self, packet: Bytes, id: u32) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn close(&self, write_success: bool) -> Result<()>;
}

impl<R: RemoteInput + ?Sized> RemoteInput for Arc<R> {
    fn using_compression(&self) -> Result<bool> {
        (**self).using_compression()
    }

    fn available(&self) -> Result<usize> {
        (**self).available()
    }

    fn read_packet(&self, id: u32) -> Result<Option<Bytes>> {
        (**self).read_packet(id)
    }

    fn skip(&self, n: u64, id: u32) -> Result<u64> {
        (**self).skip(n, id)
    }

    fn close(&self, read_success: bool) -> Result<()> {
        (**self).close(read_success)
    }
}

impl<R: RemoteOutput + ?Sized> RemoteOutput for Arc<R> {
    fn using_compression(&self) -> Result<bool> {
        (**self).using_compression()
    }

    fn write_packet(&self, packet: Bytes, id: u32) -> Result<()> {
        (**self).write_packet(packet, id)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn close(&self, write_success: bool) -> Result<()> {
        (**self).close(write_success)
    }
}
