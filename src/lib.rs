//! ferry - reliable byte and object streams over retryable request/response
//! calls.
//!
//! A stream server owns a local reader or writer and exposes it as a series
//! of small packet calls keyed by client-chosen sequence ids. Re-issuing a
//! call with the same id replays the cached result, so clients retry lost
//! calls blindly without duplicating or skipping data.
//!
//! ```text
//! local source -> framing -> InputStreamServer -> [exporter] -> InputStreamClient -> app
//! app -> OutputStreamClient -> [exporter] -> OutputStreamServer -> framing -> local sink
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod exporter;
pub mod framing;
pub mod handle;
pub mod iterator;
pub mod logging;
pub mod monitor;
pub mod pipe;
pub mod protocol;
pub mod remote;
pub mod retry;
pub mod server;
pub mod wire;

pub use buffer::PacketBuffer;
pub use client::{InputStreamClient, OutputStreamClient, StreamRead};
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use exporter::{Exporter, FaultPlan, LoopbackExporter, Resolver};
pub use handle::{InputHandle, LazyInput, LazyOutput, OutputHandle, RemoteRef};
pub use iterator::{BincodeCodec, IoIterator, IteratorClient, IteratorServer, JsonCodec, ObjectCodec};
pub use monitor::{NoopMonitor, StreamMonitor, TracingMonitor, TransferStats};
pub use pipe::{pipe, Sink, Source};
pub use protocol::Direction;
pub use remote::{RemoteInput, RemoteOutput};
pub use retry::RetryPolicy;
pub use server::{InputStreamServer, OutputStreamServer};
