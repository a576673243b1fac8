pub mod adapter;
pub mod cache;
pub mod chunk;
pub mod client;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod session;
pub mod spillover;
pub mod structure;
pub mod styles;
pub mod utils;
pub mod values;
pub mod viewport;
pub mod worker;

pub use client::{ChunkResponse, MetricsResponse, StructureResponse, WorkerClient};
pub use config::{CliArgs, WorkerConfig};
pub use error::{ChunkError, ErrorCode, ErrorPayload, LoadError, WorkerError};
pub use logging::{LoggingConfig, init_logging};
pub use model::{
    CellRecord, CellValue, Chunk, ChunkRegion, SheetSummary, SpilloverRange, Viewport,
    WorkbookKey, WorkbookRef,
};
pub use session::ViewerSession;
pub use spillover::{
    SpilloverConfig, compute_partial_spillovers, compute_sheet_spillovers, compute_spillovers,
};
pub use structure::load_structure;
pub use viewport::{CellState, ViewportManager};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct CliReport {
    workbook: WorkbookKey,
    structure: Vec<SheetSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk: Option<Chunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spillovers: Option<Vec<SpilloverRange>>,
}

/// Open a workbook through a worker and print what the CLI asked for
pub async fn run_cli(args: CliArgs) -> Result<()> {
    let config = WorkerConfig::from_args(&args)?;
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("failed to read workbook {:?}", args.file))?;
    let workbook = WorkbookRef::new(bytes);

    let client = WorkerClient::spawn(config.clone())?;
    let structure = client
        .load_structure(&workbook)
        .await
        .with_context(|| format!("failed to load structure of {:?}", args.file))?;
    tracing::info!(
        workbook = %structure.workbook_key,
        sheets = structure.structure.len(),
        elapsed_ms = structure.processing_time_ms,
        "structure loaded"
    );

    let mut report = CliReport {
        workbook: structure.workbook_key,
        structure: structure.structure,
        chunk: None,
        spillovers: None,
    };

    if args.sheet.is_some() || args.rows.is_some() || args.cols.is_some() {
        let index = args.sheet.unwrap_or(0);
        let sheet = report
            .structure
            .get(index)
            .with_context(|| format!("sheet index {index} out of range"))?;
        let viewport = sheet.default_viewport;
        let (start_row, end_row) = args.rows.unwrap_or((viewport.start_row, viewport.end_row));
        let (start_col, end_col) = args.cols.unwrap_or((viewport.start_col, viewport.end_col));
        let region = ChunkRegion::new(index, start_row, end_row, start_col, end_col);

        let response = client
            .process_chunk(&workbook, region, args.styles, CancellationToken::new())
            .await
            .with_context(|| format!("failed to read chunk {}", region.chunk_id()))?;
        // Columns right of the chunk were not read
        let spillovers = compute_partial_spillovers(
            &response.chunk.cells,
            &response.chunk.column_widths,
            &config.spillover,
            |_, col| col > end_col,
        );
        report.chunk = Some(response.chunk);
        report.spillovers = Some(spillovers);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.metrics {
        let metrics = client.metrics().await.context("failed to read worker metrics")?;
        print!("{}", metrics.openmetrics);
    }

    client.shutdown();
    Ok(())
}
