//! Worker host.
//!
//! One host runs on a dedicated thread with a single-threaded runtime and owns
//! every cache and counter, so nothing here takes a lock. Chunk jobs advance
//! one batch at a time; between batches the host drains its inbox, checks
//! cancellation and memory, and moves on to the next job.

use crate::adapter::DecodedWorkbook;
use crate::cache::{StructureCache, WorkbookCache, structure_cache, workbook_cache};
use crate::chunk::{ChunkJob, ChunkOutput, StepOutcome};
use crate::config::WorkerConfig;
use crate::error::{ChunkError, ErrorCode, ErrorPayload, WorkerError};
use crate::logging::{request_span, workbook_span};
use crate::memory::{MemoryMonitor, MemoryPressure, MemoryProbe};
use crate::metrics::WorkerMetrics;
use crate::model::{ChunkRegion, SheetSummary, WorkbookRef};
use crate::protocol::{
    CAPABILITIES, CacheSizes, Request, RequestBody, RequestId, ResponseBody, WorkerMessage,
};
use crate::structure::load_structure;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ActiveJob {
    id: RequestId,
    job: ChunkJob,
    cancel: CancellationToken,
    started: Instant,
}

pub struct WorkerHost {
    config: WorkerConfig,
    inbox: UnboundedReceiver<Request>,
    outbox: UnboundedSender<WorkerMessage>,
    workbooks: WorkbookCache,
    structures: StructureCache,
    monitor: MemoryMonitor,
    metrics: WorkerMetrics,
    jobs: VecDeque<ActiveJob>,
}

impl WorkerHost {
    pub fn new(
        config: WorkerConfig,
        probe: Box<dyn MemoryProbe>,
        inbox: UnboundedReceiver<Request>,
        outbox: UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            workbooks: workbook_cache(config.workbook_cache_capacity),
            structures: structure_cache(config.structure_cache_capacity),
            monitor: MemoryMonitor::new(probe, config.memory),
            metrics: WorkerMetrics::new(),
            jobs: VecDeque::new(),
            config,
            inbox,
            outbox,
        }
    }

    /// Serve requests until `SHUTDOWN` or until the consumer goes away
    pub async fn run(mut self) {
        info!(
            workbook_cache = self.config.workbook_cache_capacity,
            structure_cache = self.config.structure_cache_capacity,
            "worker ready"
        );
        self.send(WorkerMessage::event(ResponseBody::WorkerReady {
            timestamp: chrono::Utc::now(),
            capabilities: CAPABILITIES.iter().map(|c| (*c).to_string()).collect(),
        }));

        let interval = self.config.memory_sample_interval;
        let mut next_sample = Instant::now() + interval;

        loop {
            loop {
                match self.inbox.try_recv() {
                    Ok(request) => {
                        if !self.handle(request) {
                            return self.stop("shutdown requested");
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.stop("consumer went away"),
                }
            }

            if Instant::now() >= next_sample {
                self.sample_memory();
                next_sample = Instant::now() + interval;
            }

            if !self.jobs.is_empty() {
                self.advance_next_job();
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => {
                        if !self.handle(request) {
                            return self.stop("shutdown requested");
                        }
                    }
                    None => return self.stop("consumer went away"),
                },
                _ = tokio::time::sleep_until(next_sample) => {
                    self.sample_memory();
                    next_sample = Instant::now() + interval;
                }
            }
        }
    }

    fn stop(&mut self, reason: &str) {
        info!(reason, abandoned_jobs = self.jobs.len(), "worker stopping");
        self.jobs.clear();
    }

    fn send(&self, message: WorkerMessage) {
        if self.outbox.send(message).is_err() {
            debug!("consumer dropped, discarding worker message");
        }
    }

    /// Returns false when the host should stop
    fn handle(&mut self, request: Request) -> bool {
        let Request { id, body } = request;
        let _span = request_span(id, body.name()).entered();
        debug!("request received");

        match body {
            RequestBody::LoadStructureOnly { workbook } => self.load_structure(id, &workbook),
            RequestBody::ProcessChunk {
                workbook,
                region,
                extract_styles,
                cancel,
            } => self.start_chunk(id, &workbook, region, extract_styles, cancel),
            RequestBody::GetMetrics => {
                let memory_usage = self.monitor.sample();
                self.metrics.memory_usage_mb.set(memory_usage);
                let openmetrics = self.metrics.encode().unwrap_or_else(|err| {
                    warn!(error = %err, "failed to encode metrics");
                    String::new()
                });
                self.send(WorkerMessage::reply(
                    id,
                    ResponseBody::WorkerMetrics {
                        metrics: self.metrics.snapshot(),
                        memory_usage,
                        cache_size: self.cache_sizes(),
                        openmetrics,
                    },
                ));
            }
            RequestBody::Cleanup => {
                self.cleanup();
                self.send(WorkerMessage::reply(id, ResponseBody::CleanupComplete));
            }
            RequestBody::Shutdown => return false,
        }
        true
    }

    fn load_structure(&mut self, id: RequestId, workbook: &WorkbookRef) {
        let started = Instant::now();
        let key = workbook.key;
        let _span = workbook_span(&key).entered();

        let (structure, cache_hit) = match self.structures.get(&key) {
            Some(structure) => {
                self.metrics.structure_cache_hits.inc();
                (structure, true)
            }
            None => match load_structure(&workbook.bytes, &self.config.structure_options()) {
                Ok(sheets) => {
                    let sheets = Arc::new(sheets);
                    self.structures.insert(key, sheets.clone(), structure_size_hint(&sheets));
                    self.metrics.structures_loaded.inc();
                    self.refresh_cache_gauges();
                    info!(workbook = %key, sheets = sheets.len(), "structure loaded");
                    (sheets, false)
                }
                Err(err) => {
                    warn!(workbook = %key, error = %err, "structure load failed");
                    return self.reply_error(id, ErrorPayload::from(&err));
                }
            },
        };

        let elapsed = started.elapsed();
        self.metrics.record_request("LOAD_STRUCTURE_ONLY", elapsed);
        self.send(WorkerMessage::reply(
            id,
            ResponseBody::StructureLoaded {
                structure: structure.as_ref().clone(),
                processing_time_ms: elapsed.as_secs_f64() * 1000.0,
                workbook_key: key,
                cache_hit,
            },
        ));
    }

    fn start_chunk(
        &mut self,
        id: RequestId,
        workbook: &WorkbookRef,
        region: ChunkRegion,
        extract_styles: bool,
        cancel: CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return self.drop_cancelled(id);
        }
        let started = Instant::now();

        let decoded = match self.decoded_workbook(workbook) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(workbook = %workbook.key, error = %err, "workbook decode failed");
                return self.reply_error(id, ErrorPayload::from(&err));
            }
        };
        if cancel.is_cancelled() {
            return self.drop_cancelled(id);
        }

        match ChunkJob::new(decoded, region, self.config.chunk_options(extract_styles)) {
            Ok(job) => {
                debug!(request_id = id, chunk = %region.chunk_id(), "chunk queued");
                self.jobs.push_back(ActiveJob {
                    id,
                    job,
                    cancel,
                    started,
                });
            }
            Err(err) => self.reply_error(id, ErrorPayload::from(&err)),
        }
    }

    fn decoded_workbook(&mut self, workbook: &WorkbookRef) -> Result<Arc<DecodedWorkbook>, ChunkError> {
        if let Some(decoded) = self.workbooks.get(&workbook.key) {
            self.metrics.workbook_cache_hits.inc();
            return Ok(decoded);
        }

        let _span = workbook_span(&workbook.key).entered();
        let decoded = Arc::new(DecodedWorkbook::decode(workbook)?);
        self.workbooks.insert(workbook.key, decoded.clone(), workbook.bytes.len());
        self.metrics.workbooks_decoded.inc();
        self.refresh_cache_gauges();
        info!(workbook = %workbook.key, sheets = decoded.sheet_count(), "workbook decoded");
        Ok(decoded)
    }

    /// Run one batch of the job at the front of the queue
    fn advance_next_job(&mut self) {
        let Some(mut active) = self.jobs.pop_front() else {
            return;
        };
        if active.cancel.is_cancelled() {
            return self.drop_cancelled(active.id);
        }

        if active.job.step() == StepOutcome::Complete {
            return self.complete(active, false);
        }

        let (usage, pressure) = self.sample_memory();
        if pressure == MemoryPressure::Normal {
            return self.jobs.push_back(active);
        }
        warn!(
            request_id = active.id,
            memory_mb = usage,
            ?pressure,
            "memory ceiling reached, truncating chunk"
        );
        self.complete(active, true);
    }

    fn complete(&mut self, active: ActiveJob, truncate: bool) {
        let ActiveJob {
            id,
            job,
            cancel,
            started,
        } = active;
        if cancel.is_cancelled() {
            return self.drop_cancelled(id);
        }

        let ChunkOutput {
            chunk,
            cells_skipped,
        } = match job.finish(truncate) {
            Ok(output) => output,
            Err(err) => return self.reply_error(id, ErrorPayload::from(&err)),
        };

        self.metrics.chunks_processed.inc();
        self.metrics.cells_emitted.inc_by(chunk.cells.len() as u64);
        self.metrics.cells_skipped.inc_by(cells_skipped);
        if chunk.truncated {
            self.metrics.chunks_truncated.inc();
        }

        let elapsed = started.elapsed();
        self.metrics.record_request("PROCESS_CHUNK", elapsed);
        debug!(
            request_id = id,
            chunk = %chunk.chunk_id,
            cells = chunk.cells.len(),
            skipped = cells_skipped,
            truncated = chunk.truncated,
            "chunk processed"
        );
        self.send(WorkerMessage::reply(
            id,
            ResponseBody::ChunkProcessed {
                chunk,
                processing_time_ms: elapsed.as_secs_f64() * 1000.0,
            },
        ));
    }

    fn drop_cancelled(&mut self, id: RequestId) {
        debug!(request_id = id, "chunk request cancelled");
        self.metrics.chunks_cancelled.inc();
    }

    fn reply_error(&mut self, id: RequestId, payload: ErrorPayload) {
        self.metrics.record_error(payload.code.category());
        self.send(WorkerMessage::reply(id, ResponseBody::Error { error: payload }));
    }

    /// Sample, report `MEMORY_STATUS` and drop caches above the hard ceiling
    fn sample_memory(&mut self) -> (f64, MemoryPressure) {
        let (usage, pressure) = self.monitor.check();
        self.metrics.memory_usage_mb.set(usage);
        self.send(WorkerMessage::event(ResponseBody::MemoryStatus {
            memory_usage: usage,
            metrics: self.metrics.snapshot(),
        }));

        if pressure == MemoryPressure::Hard {
            warn!(memory_mb = usage, "hard memory ceiling reached, dropping caches");
            self.cleanup();
            self.send(WorkerMessage::event(ResponseBody::MemoryCleanup {
                memory_usage: usage,
            }));
        }
        (usage, pressure)
    }

    /// Drop both caches. Running jobs keep their own handle on the workbook.
    fn cleanup(&mut self) {
        self.workbooks.clear();
        self.structures.clear();
        self.metrics.cleanups.inc();
        self.refresh_cache_gauges();
        info!("worker caches cleared");
    }

    fn cache_sizes(&self) -> CacheSizes {
        CacheSizes {
            workbooks: self.workbooks.stats(),
            structures: self.structures.stats(),
        }
    }

    fn refresh_cache_gauges(&self) {
        self.metrics
            .update_cache_sizes(self.workbooks.len(), self.structures.len());
    }
}

/// Rough in-memory size of a structure summary
fn structure_size_hint(sheets: &[SheetSummary]) -> usize {
    sheets
        .iter()
        .map(|sheet| std::mem::size_of::<SheetSummary>() + sheet.id.len() + sheet.name.len())
        .sum()
}

/// Channels and thread of a running host
pub struct HostHandle {
    pub requests: UnboundedSender<Request>,
    pub messages: UnboundedReceiver<WorkerMessage>,
    pub thread: std::thread::JoinHandle<()>,
}

/// Start a host on its own thread
pub fn spawn_host(config: WorkerConfig, probe: Box<dyn MemoryProbe>) -> Result<HostHandle, WorkerError> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    let thread = std::thread::Builder::new()
        .name("spreadsheet-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "failed to build worker runtime");
                    let _ = message_tx.send(WorkerMessage::event(ResponseBody::Error {
                        error: ErrorPayload::from_error(ErrorCode::Internal, &err),
                    }));
                    return;
                }
            };
            let host = WorkerHost::new(config, probe, request_rx, message_tx);
            runtime.block_on(host.run());
        })
        .map_err(|err| WorkerError::Spawn(err.to_string()))?;

    Ok(HostHandle {
        requests: request_tx,
        messages: message_rx,
        thread,
    })
}
