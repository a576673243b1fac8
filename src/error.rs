//! Error taxonomy for the spreadsheet worker
//!
//! Errors are layered by blast radius:
//! - [`LoadError`]: the file itself is unusable, fatal for the whole workbook
//! - [`ChunkError`]: a single rectangle failed, recoverable by re-requesting
//! - [`CellError`]: a single cell failed to decode, skipped and never surfaced
//! - [`WorkerError`]: what the consumer sees when a request does not resolve

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Stable codes carried by `ERROR` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The bytes could not be parsed as a workbook
    LoadFailed,
    /// The bytes are a spreadsheet format this worker does not decode
    UnsupportedFormat,
    /// The requested sheet index does not exist
    SheetNotFound,
    /// The request region is malformed
    InvalidRegion,
    /// No response arrived within the request deadline
    Timeout,
    /// The worker went away
    Disconnected,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Check if the consumer may retry the request as-is or narrowed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Disconnected)
    }

    /// Error category for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::LoadFailed | ErrorCode::UnsupportedFormat => "load_error",
            ErrorCode::SheetNotFound | ErrorCode::InvalidRegion => "validation_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Disconnected => "worker_error",
            ErrorCode::Internal => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// LOAD / CHUNK / CELL ERRORS
// =============================================================================

/// The workbook bytes could not be turned into a summary or a decoded workbook
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported spreadsheet format: {0}")]
    UnsupportedFormat(String),

    #[error("workbook archive is corrupt: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("workbook part {part} is not valid XML: {source}")]
    Xml {
        part: String,
        #[source]
        source: quick_xml::Error,
    },

    #[error("workbook is missing required part {0}")]
    MissingPart(String),

    #[error("failed to decode workbook: {0}")]
    Decode(String),

    #[error("failed to read workbook part {part}: {source}")]
    Io {
        part: String,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LoadError::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            _ => ErrorCode::LoadFailed,
        }
    }
}

/// A chunk rectangle could not be produced
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("sheet index {index} out of range (workbook has {count} sheets)")]
    SheetNotFound { index: usize, count: usize },

    #[error("invalid chunk region: {0}")]
    InvalidRegion(String),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl ChunkError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChunkError::SheetNotFound { .. } => ErrorCode::SheetNotFound,
            ChunkError::InvalidRegion(_) => ErrorCode::InvalidRegion,
            ChunkError::Load(inner) => inner.code(),
        }
    }
}

/// A single cell could not be decoded
#[derive(Debug, Error)]
pub enum CellError {
    #[error("decoder panicked reading cell R{row}C{col}: {message}")]
    DecoderPanic { row: u32, col: u32, message: String },
}

// =============================================================================
// CONSUMER-FACING ERRORS
// =============================================================================

/// Serialized form of a failure carried by the `ERROR` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// Source chain, outermost first
    pub stack: Vec<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Build a payload from any error, walking its `source()` chain
    pub fn from_error(code: ErrorCode, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut current = error.source();
        while let Some(cause) = current {
            stack.push(cause.to_string());
            current = cause.source();
        }
        Self {
            code,
            message: error.to_string(),
            stack,
        }
    }
}

impl From<&LoadError> for ErrorPayload {
    fn from(error: &LoadError) -> Self {
        ErrorPayload::from_error(error.code(), error)
    }
}

impl From<&ChunkError> for ErrorPayload {
    fn from(error: &ChunkError) -> Self {
        ErrorPayload::from_error(error.code(), error)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Why a request to the worker did not produce a value
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("worker disconnected")]
    Disconnected,

    #[error("request was cancelled")]
    Cancelled,

    #[error("{0}")]
    Remote(ErrorPayload),

    #[error("unexpected response type {0}")]
    UnexpectedResponse(&'static str),

    #[error("failed to start worker: {0}")]
    Spawn(String),
}

impl WorkerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::Timeout(_) => ErrorCode::Timeout,
            WorkerError::Disconnected | WorkerError::Cancelled => ErrorCode::Disconnected,
            WorkerError::Remote(payload) => payload.code,
            WorkerError::UnexpectedResponse(_) | WorkerError::Spawn(_) => ErrorCode::Internal,
        }
    }

    /// Load failures are never worth retrying; the file itself is bad
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}
