//! Worker metrics
//!
//! Each worker host owns one [`WorkerMetrics`] with its own Prometheus
//! registry. The host is single-threaded, so there is no global collector.
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::time::Duration;

/// Labels for request latency
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Request type (e.g., "PROCESS_CHUNK")
    pub request: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error category from `ErrorCode::category`
    pub category: String,
}

pub struct WorkerMetrics {
    registry: Registry,

    pub structures_loaded: Counter,
    pub structure_cache_hits: Counter,
    pub workbooks_decoded: Counter,
    pub workbook_cache_hits: Counter,
    pub chunks_processed: Counter,
    pub chunks_truncated: Counter,
    pub chunks_cancelled: Counter,
    pub cells_emitted: Counter,
    pub cells_skipped: Counter,
    pub cleanups: Counter,
    pub errors: Family<ErrorLabels, Counter>,

    pub request_duration_seconds: Family<RequestLabels, Histogram>,

    pub memory_usage_mb: Gauge<f64, AtomicU64>,
    pub workbook_cache_entries: Gauge,
    pub structure_cache_entries: Gauge,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("spreadsheet_worker");

        let structures_loaded = Counter::default();
        registry.register(
            "structures_loaded",
            "Structure summaries produced by a fresh parse",
            structures_loaded.clone(),
        );

        let structure_cache_hits = Counter::default();
        registry.register(
            "structure_cache_hits",
            "Structure requests answered from cache",
            structure_cache_hits.clone(),
        );

        let workbooks_decoded = Counter::default();
        registry.register(
            "workbooks_decoded",
            "Full workbook decodes",
            workbooks_decoded.clone(),
        );

        let workbook_cache_hits = Counter::default();
        registry.register(
            "workbook_cache_hits",
            "Chunk requests that reused a decoded workbook",
            workbook_cache_hits.clone(),
        );

        let chunks_processed = Counter::default();
        registry.register(
            "chunks_processed",
            "Chunks returned to the consumer",
            chunks_processed.clone(),
        );

        let chunks_truncated = Counter::default();
        registry.register(
            "chunks_truncated",
            "Chunks cut short by memory pressure",
            chunks_truncated.clone(),
        );

        let chunks_cancelled = Counter::default();
        registry.register(
            "chunks_cancelled",
            "Chunk requests dropped after cancellation",
            chunks_cancelled.clone(),
        );

        let cells_emitted = Counter::default();
        registry.register("cells_emitted", "Cells returned in chunks", cells_emitted.clone());

        let cells_skipped = Counter::default();
        registry.register(
            "cells_skipped",
            "Cells skipped because they failed to decode",
            cells_skipped.clone(),
        );

        let cleanups = Counter::default();
        registry.register("cleanups", "Cache cleanups performed", cleanups.clone());

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register("errors", "Error responses by category", errors.clone());

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 1ms up to ~20s
                Histogram::new(exponential_buckets(0.001, 3.0, 10))
            });
        registry.register(
            "request_duration_seconds",
            "Request processing time in seconds",
            request_duration_seconds.clone(),
        );

        let memory_usage_mb = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "memory_usage_mb",
            "Last sampled resident memory in MB",
            memory_usage_mb.clone(),
        );

        let workbook_cache_entries = Gauge::default();
        registry.register(
            "workbook_cache_entries",
            "Decoded workbooks currently cached",
            workbook_cache_entries.clone(),
        );

        let structure_cache_entries = Gauge::default();
        registry.register(
            "structure_cache_entries",
            "Structure summaries currently cached",
            structure_cache_entries.clone(),
        );

        Self {
            registry,
            structures_loaded,
            structure_cache_hits,
            workbooks_decoded,
            workbook_cache_hits,
            chunks_processed,
            chunks_truncated,
            chunks_cancelled,
            cells_emitted,
            cells_skipped,
            cleanups,
            errors,
            request_duration_seconds,
            memory_usage_mb,
            workbook_cache_entries,
            structure_cache_entries,
        }
    }

    /// Encode metrics in OpenMetrics text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub fn record_request(&self, request: &str, elapsed: Duration) {
        self.request_duration_seconds
            .get_or_create(&RequestLabels {
                request: request.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_error(&self, category: &str) {
        self.errors
            .get_or_create(&ErrorLabels {
                category: category.to_string(),
            })
            .inc();
    }

    pub fn update_cache_sizes(&self, workbooks: usize, structures: usize) {
        self.workbook_cache_entries.set(workbooks as i64);
        self.structure_cache_entries.set(structures as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            structures_loaded: self.structures_loaded.get(),
            structure_cache_hits: self.structure_cache_hits.get(),
            workbooks_decoded: self.workbooks_decoded.get(),
            workbook_cache_hits: self.workbook_cache_hits.get(),
            chunks_processed: self.chunks_processed.get(),
            chunks_truncated: self.chunks_truncated.get(),
            chunks_cancelled: self.chunks_cancelled.get(),
            cells_emitted: self.cells_emitted.get(),
            cells_skipped: self.cells_skipped.get(),
            cleanups: self.cleanups.get(),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of the counters, carried by `WORKER_METRICS` and `MEMORY_STATUS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub structures_loaded: u64,
    pub structure_cache_hits: u64,
    pub workbooks_decoded: u64,
    pub workbook_cache_hits: u64,
    pub chunks_processed: u64,
    pub chunks_truncated: u64,
    pub chunks_cancelled: u64,
    pub cells_emitted: u64,
    pub cells_skipped: u64,
    pub cleanups: u64,
}
