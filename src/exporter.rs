//! Making stream servers remotely callable.
//!
//! [`Exporter`] publishes a server and hands back a [`RemoteRef`];
//! [`Resolver`] turns a reference back into something callable. Callers
//! receive these explicitly, there is no process-wide registry.
//!
//! [`LoopbackExporter`] implements both in-process. Every call still goes
//! through the wire codec, and a [`FaultPlan`] can drop requests or
//! responses to exercise retries.

use crate::error::{Result, StreamError};
use crate::handle::RemoteRef;
use crate::protocol::Direction;
use crate::remote::{RemoteInput, RemoteOutput};
use crate::server::{InputStreamServer, OutputStreamServer};
use crate::wire::{self, Call, InputProxy, OutputProxy, Reply, Request, Transport};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

pub trait Exporter: Send + Sync {
    /// Publish `server`. It is withdrawn again when the server closes.
    fn export_input(&self, server: Arc<InputStreamServer>) -> Result<RemoteRef>;

    fn export_output(&self, server: Arc<OutputStreamServer>) -> Result<RemoteRef>;

    /// Best-effort; failures are logged, never returned.
    fn unexport(&self, remote: &RemoteRef);
}

pub trait Resolver: Send + Sync {
    fn resolve_input(&self, remote: &RemoteRef) -> Result<Arc<dyn RemoteInput>>;

    fn resolve_output(&self, remote: &RemoteRef) -> Result<Arc<dyn RemoteOutput>>;
}

/// Which calls the loopback transport should fail, counted from 0 across
/// every call that reaches it.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    lost_requests: HashSet<u64>,
    lost_responses: HashSet<u64>,
    lose_every_nth_response: Option<u64>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call number `index` never reaches the server.
    pub fn lose_request(mut self, index: u64) -> Self {
        self.lost_requests.insert(index);
        self
    }

    /// Call number `index` runs on the server but its reply is lost.
    pub fn lose_response(mut self, index: u64) -> Self {
        self.lost_responses.insert(index);
        self
    }

    /// Every `n`th reply (the `n`th, `2n`th, ...) is lost.
    pub fn lose_every_nth_response(mut self, n: u64) -> Self {
        self.lose_every_nth_response = (n > 0).then_some(n);
        self
    }

    fn loses_request(&self, index: u64) -> bool {
        self.lost_requests.contains(&index)
    }

    fn loses_response(&self, index: u64) -> bool {
        self.lost_responses.contains(&index)
            || self
                .lose_every_nth_response
                .map_or(false, |n| (index + 1) % n == 0)
    }
}

#[derive(Clone)]
enum Exported {
    Input(Arc<InputStreamServer>),
    Output(Arc<OutputStreamServer>),
}

#[derive(Default)]
struct Registry {
    streams: Mutex<HashMap<u64, Exported>>,
    next_id: AtomicU64,
    calls: AtomicU64,
    faults: Mutex<FaultPlan>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Registry {
    fn insert(&self, stream: Exported) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        guard(&self.streams).insert(id, stream);
        id
    }

    fn remove(&self, id: u64) -> bool {
        guard(&self.streams).remove(&id).is_some()
    }

    fn lookup(&self, id: u64) -> Option<Exported> {
        guard(&self.streams).get(&id).cloned()
    }
}

impl Transport for Registry {
    fn round_trip(&self, request: Bytes) -> Result<Bytes> {
        let index = self.calls.fetch_add(1, Ordering::Relaxed);
        let faults = guard(&self.faults).clone();
        if faults.loses_request(index) {
            trace!(index, "dropping request");
            return Err(StreamError::communication(format!("request {index} lost")));
        }

        let Request { target, call } = Request::decode(request)?;
        // registry lock is released before the call, close paths unexport
        let reply = match self.lookup(target) {
            Some(Exported::Input(server)) => wire::invoke_input(server.as_ref(), call),
            Some(Exported::Output(server)) => wire::invoke_output(server.as_ref(), call),
            // streams are withdrawn on close, so a retried close lands here
            None if matches!(call, Call::InputClose { .. } | Call::OutputClose { .. }) => {
                Reply::Unit
            }
            None => Reply::Error(StreamError::communication(format!(
                "no stream exported as {target}"
            ))),
        };

        if faults.loses_response(index) {
            trace!(index, "dropping response");
            return Err(StreamError::communication(format!("response {index} lost")));
        }
        Ok(reply.encode())
    }
}

/// In-process exporter and resolver.
#[derive(Clone, Default)]
pub struct LoopbackExporter {
    registry: Arc<Registry>,
}

impl LoopbackExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let exporter = Self::default();
        exporter.set_faults(faults);
        exporter
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        *guard(&self.registry.faults) = faults;
    }

    /// Calls carried so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.registry.calls.load(Ordering::Relaxed)
    }

    pub fn exported_count(&self) -> usize {
        guard(&self.registry.streams).len()
    }

    fn withdraw_on_close(registry: &Arc<Registry>, id: u64) -> impl FnOnce(bool) + Send + 'static {
        let registry: Weak<Registry> = Arc::downgrade(registry);
        move |_clean| {
            if let Some(registry) = registry.upgrade() {
                if registry.remove(id) {
                    debug!(remote = id, "stream unexported on close");
                }
            }
        }
    }
}

impl Exporter for LoopbackExporter {
    fn export_input(&self, server: Arc<InputStreamServer>) -> Result<RemoteRef> {
        let id = self.registry.insert(Exported::Input(Arc::clone(&server)));
        server.on_close(Self::withdraw_on_close(&self.registry, id));
        debug!(remote = id, stream = server.id(), "input stream exported");
        Ok(RemoteRef {
            id,
            kind: Direction::Input,
        })
    }

    fn export_output(&self, server: Arc<OutputStreamServer>) -> Result<RemoteRef> {
        let id = self.registry.insert(Exported::Output(Arc::clone(&server)));
        server.on_close(Self::withdraw_on_close(&self.registry, id));
        debug!(remote = id, stream = server.id(), "output stream exported");
        Ok(RemoteRef {
            id,
            kind: Direction::Output,
        })
    }

    fn unexport(&self, remote: &RemoteRef) {
        if self.registry.remove(remote.id) {
            debug!(remote = remote.id, "stream unexported");
        } else {
            warn!(remote = remote.id, "unexport of unknown stream");
        }
    }
}

impl Resolver for LoopbackExporter {
    fn resolve_input(&self, remote: &RemoteRef) -> Result<Arc<dyn RemoteInput>> {
        if remote.kind != Direction::Input {
            return Err(StreamError::unsupported("not an input stream reference"));
        }
        Ok(Arc::new(InputProxy::new(Arc::clone(&self.registry), remote.id)))
    }

    fn resolve_output(&self, remote: &RemoteRef) -> Result<Arc<dyn RemoteOutput>> {
        if remote.kind != Direction::Output {
            return Err(StreamError::unsupported("not an output stream reference"));
        }
        Ok(Arc::new(OutputProxy::new(Arc::clone(&self.registry), remote.id)))
    }
}
