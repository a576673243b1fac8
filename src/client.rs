//! Consumer side of the worker.
//!
//! [`WorkerClient`] owns the request side of a host and a router task that
//! resolves responses by request id. Unsolicited host events are rebroadcast.
//! A request that outlives its deadline is cancelled and resolved as
//! [`WorkerError::Timeout`]; if the host stayed silent for the whole window it
//! is presumed stuck and replaced.

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::metrics::MetricsSnapshot;
use crate::model::{Chunk, ChunkRegion, SheetSummary, WorkbookKey, WorkbookRef};
use crate::protocol::{CacheSizes, Request, RequestBody, RequestId, ResponseBody, WorkerMessage};
use crate::worker::{HostHandle, spawn_host};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

type Waiters = Arc<Mutex<AHashMap<RequestId, oneshot::Sender<WorkerMessage>>>>;
type Spawner = Arc<dyn Fn() -> Result<HostHandle, WorkerError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct StructureResponse {
    pub structure: Vec<SheetSummary>,
    pub processing_time_ms: f64,
    pub workbook_key: WorkbookKey,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResponse {
    pub chunk: Chunk,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsResponse {
    pub metrics: MetricsSnapshot,
    pub memory_usage: f64,
    pub cache_size: CacheSizes,
    pub openmetrics: String,
}

/// One live host: its inbox, pending waiters and router
struct Connection {
    generation: u64,
    requests: UnboundedSender<Request>,
    waiters: Waiters,
    /// Messages received from this host so far
    activity: Arc<AtomicU64>,
    router: JoinHandle<()>,
}

impl Connection {
    fn open(
        generation: u64,
        handle: HostHandle,
        events: broadcast::Sender<WorkerMessage>,
    ) -> Self {
        let HostHandle {
            requests,
            messages,
            thread: _,
        } = handle;
        let waiters: Waiters = Arc::default();
        let activity = Arc::new(AtomicU64::new(0));
        let router = tokio::spawn(route(messages, waiters.clone(), activity.clone(), events));
        Self {
            generation,
            requests,
            waiters,
            activity,
            router,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.router.abort();
        self.waiters.lock().clear();
    }
}

async fn route(
    mut messages: UnboundedReceiver<WorkerMessage>,
    waiters: Waiters,
    activity: Arc<AtomicU64>,
    events: broadcast::Sender<WorkerMessage>,
) {
    while let Some(message) = messages.recv().await {
        activity.fetch_add(1, Ordering::SeqCst);
        let waiter = message.id.and_then(|id| waiters.lock().remove(&id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => {
                let _ = events.send(message);
            }
        }
    }
    debug!("worker message stream closed");
    // Dropping the senders resolves every waiter as disconnected
    waiters.lock().clear();
}

struct ClientInner {
    spawner: Spawner,
    connection: Mutex<Connection>,
    next_id: AtomicU64,
    events: broadcast::Sender<WorkerMessage>,
    timeout: Duration,
}

/// Cloneable handle to a background worker. Must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl WorkerClient {
    /// Start a worker measuring this process's memory
    pub fn spawn(config: WorkerConfig) -> Result<Self, WorkerError> {
        Self::spawn_with_probe(config, || Box::new(ProcessMemoryProbe::new()))
    }

    /// Start a worker with a custom memory probe; the factory runs again
    /// whenever a stuck worker is replaced
    pub fn spawn_with_probe<F>(config: WorkerConfig, probe: F) -> Result<Self, WorkerError>
    where
        F: Fn() -> Box<dyn MemoryProbe> + Send + Sync + 'static,
    {
        let timeout = config.request_timeout;
        let spawner: Spawner = Arc::new(move || spawn_host(config.clone(), probe()));
        Self::with_spawner(spawner, timeout)
    }

    pub(crate) fn with_spawner(spawner: Spawner, timeout: Duration) -> Result<Self, WorkerError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connection = Connection::open(0, spawner()?, events.clone());
        Ok(Self {
            inner: Arc::new(ClientInner {
                spawner,
                connection: Mutex::new(connection),
                next_id: AtomicU64::new(1),
                events,
                timeout,
            }),
        })
    }

    /// Unsolicited host messages: `WORKER_READY`, `MEMORY_STATUS`, `MEMORY_CLEANUP`
    pub fn events(&self) -> broadcast::Receiver<WorkerMessage> {
        self.inner.events.subscribe()
    }

    pub async fn load_structure(&self, workbook: &WorkbookRef) -> Result<StructureResponse, WorkerError> {
        let body = RequestBody::LoadStructureOnly {
            workbook: workbook.clone(),
        };
        match self.request(body, None).await? {
            ResponseBody::StructureLoaded {
                structure,
                processing_time_ms,
                workbook_key,
                cache_hit,
            } => Ok(StructureResponse {
                structure,
                processing_time_ms,
                workbook_key,
                cache_hit,
            }),
            other => Err(WorkerError::UnexpectedResponse(other.name())),
        }
    }

    /// Request one chunk. Cancelling `cancel` resolves the call as
    /// [`WorkerError::Cancelled`] and the host emits nothing for it.
    pub async fn process_chunk(
        &self,
        workbook: &WorkbookRef,
        region: ChunkRegion,
        extract_styles: bool,
        cancel: CancellationToken,
    ) -> Result<ChunkResponse, WorkerError> {
        let body = RequestBody::ProcessChunk {
            workbook: workbook.clone(),
            region,
            extract_styles,
            cancel: cancel.clone(),
        };
        match self.request(body, Some(cancel)).await? {
            ResponseBody::ChunkProcessed {
                chunk,
                processing_time_ms,
            } => Ok(ChunkResponse {
                chunk,
                processing_time_ms,
            }),
            other => Err(WorkerError::UnexpectedResponse(other.name())),
        }
    }

    pub async fn metrics(&self) -> Result<MetricsResponse, WorkerError> {
        match self.request(RequestBody::GetMetrics, None).await? {
            ResponseBody::WorkerMetrics {
                metrics,
                memory_usage,
                cache_size,
                openmetrics,
            } => Ok(MetricsResponse {
                metrics,
                memory_usage,
                cache_size,
                openmetrics,
            }),
            other => Err(WorkerError::UnexpectedResponse(other.name())),
        }
    }

    pub async fn cleanup(&self) -> Result<(), WorkerError> {
        match self.request(RequestBody::Cleanup, None).await? {
            ResponseBody::CleanupComplete => Ok(()),
            other => Err(WorkerError::UnexpectedResponse(other.name())),
        }
    }

    /// Ask the host to stop; outstanding requests resolve as disconnected
    pub fn shutdown(&self) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = self.inner.connection.lock();
        let _ = connection.requests.send(Request {
            id,
            body: RequestBody::Shutdown,
        });
    }

    async fn request(
        &self,
        body: RequestBody,
        cancel: Option<CancellationToken>,
    ) -> Result<ResponseBody, WorkerError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = body.name();
        let (tx, rx) = oneshot::channel();

        let (generation, waiters, activity) = {
            let connection = self.inner.connection.lock();
            connection.waiters.lock().insert(id, tx);
            if connection.requests.send(Request { id, body }).is_err() {
                connection.waiters.lock().remove(&id);
                return Err(WorkerError::Disconnected);
            }
            (
                connection.generation,
                connection.waiters.clone(),
                connection.activity.clone(),
            )
        };
        let seen = activity.load(Ordering::SeqCst);
        let cancel = cancel.unwrap_or_default();

        let outcome = tokio::select! {
            response = tokio::time::timeout(self.inner.timeout, rx) => response,
            _ = cancel.cancelled() => {
                waiters.lock().remove(&id);
                return Err(WorkerError::Cancelled);
            }
        };

        match outcome {
            Ok(Ok(message)) => match message.body {
                ResponseBody::Error { error } => Err(WorkerError::Remote(error)),
                body => Ok(body),
            },
            Ok(Err(_)) => Err(WorkerError::Disconnected),
            Err(_) => {
                waiters.lock().remove(&id);
                cancel.cancel();
                warn!(request_id = id, request = name, timeout = ?self.inner.timeout, "worker request timed out");
                if activity.load(Ordering::SeqCst) == seen {
                    self.recycle(generation);
                }
                Err(WorkerError::Timeout(self.inner.timeout))
            }
        }
    }

    /// Replace a host that stopped answering. The old thread is left to wind
    /// down on its own once its inbox closes.
    fn recycle(&self, generation: u64) {
        let mut connection = self.inner.connection.lock();
        if connection.generation != generation {
            return;
        }
        match (self.inner.spawner)() {
            Ok(handle) => {
                warn!(generation, "worker unresponsive, starting a replacement");
                *connection = Connection::open(generation + 1, handle, self.inner.events.clone());
            }
            Err(err) => warn!(error = %err, "failed to replace unresponsive worker"),
        }
    }

    /// Times the host has been replaced
    pub fn restarts(&self) -> u64 {
        self.inner.connection.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ManualProbe;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn quiet_config() -> WorkerConfig {
        WorkerConfig {
            request_timeout: Duration::from_millis(200),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn metrics_round_trip() {
        let client =
            WorkerClient::spawn_with_probe(quiet_config(), || Box::new(ManualProbe::new(42.0))).unwrap();
        let response = client.metrics().await.unwrap();
        assert_eq!(response.metrics.chunks_processed, 0);
        assert!((response.memory_usage - 42.0).abs() < 0.01);
        assert_eq!(response.cache_size.workbooks.capacity, 3);
    }

    #[tokio::test]
    async fn silent_host_is_replaced_after_timeout() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(Mutex::new(Vec::new()));

        let spawner: Spawner = {
            let spawned = spawned.clone();
            let parked = parked.clone();
            Arc::new(move || {
                if spawned.fetch_add(1, Ordering::SeqCst) == 0 {
                    // A host that accepts requests and never answers
                    let (requests, inbox) = mpsc::unbounded_channel();
                    let (outbox, messages) = mpsc::unbounded_channel();
                    parked.lock().push((inbox, outbox));
                    Ok(HostHandle {
                        requests,
                        messages,
                        thread: std::thread::spawn(|| {}),
                    })
                } else {
                    spawn_host(quiet_config(), Box::new(ManualProbe::new(1.0)))
                }
            })
        };

        let client = WorkerClient::with_spawner(spawner, Duration::from_millis(100)).unwrap();
        let err = client.metrics().await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
        assert_eq!(client.restarts(), 1);
        assert_eq!(spawned.load(Ordering::SeqCst), 2);

        assert!(client.metrics().await.is_ok());
    }

    #[tokio::test]
    async fn cancelling_resolves_the_request() {
        let client =
            WorkerClient::spawn_with_probe(quiet_config(), || Box::new(ManualProbe::new(1.0))).unwrap();
        let workbook = WorkbookRef::new(b"PK\x03\x04 never decoded".to_vec());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .process_chunk(&workbook, ChunkRegion::new(0, 1, 10, 1, 10), false, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        assert_eq!(client.restarts(), 0);
    }
}
