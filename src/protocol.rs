//! Messages exchanged between the consumer and the worker host.
//!
//! Requests stay in-process: they carry shared byte buffers and cancellation
//! tokens. Responses are plain data and serialize with a `type` tag.

use crate::cache::CacheStats;
use crate::error::ErrorPayload;
use crate::metrics::MetricsSnapshot;
use crate::model::{Chunk, ChunkRegion, SheetSummary, WorkbookKey, WorkbookRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use tokio_util::sync::CancellationToken;

pub type RequestId = u64;

/// Features advertised in `WORKER_READY`
pub const CAPABILITIES: &[&str] = &[
    "structure-only",
    "chunked-processing",
    "minimal-styles",
    "memory-monitoring",
    "cancellation",
    "metrics",
];

#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub body: RequestBody,
}

#[derive(Debug, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestBody {
    /// Sheet list and dimensions without decoding cells
    LoadStructureOnly { workbook: WorkbookRef },
    ProcessChunk {
        workbook: WorkbookRef,
        region: ChunkRegion,
        extract_styles: bool,
        cancel: CancellationToken,
    },
    GetMetrics,
    /// Drop both caches
    Cleanup,
    Shutdown,
}

impl RequestBody {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// Everything the host sends; `id` is `None` for unsolicited events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl WorkerMessage {
    pub fn reply(id: RequestId, body: ResponseBody) -> Self {
        Self { id: Some(id), body }
    }

    pub fn event(body: ResponseBody) -> Self {
        Self { id: None, body }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSizes {
    pub workbooks: CacheStats,
    pub structures: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseBody {
    StructureLoaded {
        structure: Vec<SheetSummary>,
        processing_time_ms: f64,
        workbook_key: WorkbookKey,
        cache_hit: bool,
    },
    ChunkProcessed {
        chunk: Chunk,
        processing_time_ms: f64,
    },
    WorkerMetrics {
        metrics: MetricsSnapshot,
        memory_usage: f64,
        cache_size: CacheSizes,
        /// OpenMetrics text exposition of the host registry
        #[serde(default, skip_serializing_if = "String::is_empty")]
        openmetrics: String,
    },
    CleanupComplete,
    WorkerReady {
        timestamp: DateTime<Utc>,
        capabilities: Vec<String>,
    },
    MemoryStatus {
        memory_usage: f64,
        metrics: MetricsSnapshot,
    },
    MemoryCleanup {
        memory_usage: f64,
    },
    Error {
        error: ErrorPayload,
    },
}

impl ResponseBody {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
