use crate::cache::{DEFAULT_STRUCTURE_CAPACITY, DEFAULT_WORKBOOK_CAPACITY};
use crate::chunk::{ChunkOptions, DEFAULT_BATCH_CELLS};
use crate::dimensions::DEFAULT_ROW_LOOKAHEAD;
use crate::memory::{DEFAULT_HARD_LIMIT_MB, DEFAULT_SOFT_LIMIT_MB, MemoryLimits};
use crate::spillover::SpilloverConfig;
use crate::structure::StructureOptions;
use crate::utils::column_name_to_number;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_VIEWPORT_ROWS: u32 = 50;
const DEFAULT_VIEWPORT_COLS: u32 = 20;
const DEFAULT_TILE_ROWS: u32 = 50;
const DEFAULT_TILE_COLS: u32 = 20;
const DEFAULT_RETENTION_MARGIN: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub workbook_cache_capacity: usize,
    pub structure_cache_capacity: usize,
    pub memory: MemoryLimits,
    pub memory_sample_interval: Duration,
    pub batch_cells: usize,
    pub row_lookahead: u32,
    pub request_timeout: Duration,
    pub default_viewport_rows: u32,
    pub default_viewport_cols: u32,
    pub tile_rows: u32,
    pub tile_cols: u32,
    /// Tiles kept around the viewport before cells are dropped
    pub retention_margin: u32,
    pub spillover: SpilloverConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workbook_cache_capacity: DEFAULT_WORKBOOK_CAPACITY,
            structure_cache_capacity: DEFAULT_STRUCTURE_CAPACITY,
            memory: MemoryLimits::default(),
            memory_sample_interval: Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS),
            batch_cells: DEFAULT_BATCH_CELLS,
            row_lookahead: DEFAULT_ROW_LOOKAHEAD,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            default_viewport_rows: DEFAULT_VIEWPORT_ROWS,
            default_viewport_cols: DEFAULT_VIEWPORT_COLS,
            tile_rows: DEFAULT_TILE_ROWS,
            tile_cols: DEFAULT_TILE_COLS,
            retention_margin: DEFAULT_RETENTION_MARGIN,
            spillover: SpilloverConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let file_config = if let Some(path) = args.config.as_ref() {
            load_config_file(path)?
        } else {
            PartialConfig::default()
        };

        let PartialConfig {
            workbook_cache_capacity: file_workbook_cache_capacity,
            structure_cache_capacity: file_structure_cache_capacity,
            soft_memory_limit_mb: file_soft_limit,
            hard_memory_limit_mb: file_hard_limit,
            memory_sample_interval_secs: file_sample_interval,
            batch_cells: file_batch_cells,
            row_lookahead: file_row_lookahead,
            request_timeout_secs: file_request_timeout,
            default_viewport_rows: file_viewport_rows,
            default_viewport_cols: file_viewport_cols,
            tile_rows: file_tile_rows,
            tile_cols: file_tile_cols,
            retention_margin: file_retention_margin,
            spillover: file_spillover,
        } = file_config;

        let config = Self {
            workbook_cache_capacity: args
                .workbook_cache_capacity
                .or(file_workbook_cache_capacity)
                .unwrap_or(DEFAULT_WORKBOOK_CAPACITY),
            structure_cache_capacity: args
                .structure_cache_capacity
                .or(file_structure_cache_capacity)
                .unwrap_or(DEFAULT_STRUCTURE_CAPACITY),
            memory: MemoryLimits {
                soft_mb: args
                    .soft_memory_limit_mb
                    .or(file_soft_limit)
                    .unwrap_or(DEFAULT_SOFT_LIMIT_MB),
                hard_mb: args
                    .hard_memory_limit_mb
                    .or(file_hard_limit)
                    .unwrap_or(DEFAULT_HARD_LIMIT_MB),
            },
            memory_sample_interval: Duration::from_secs(
                file_sample_interval.unwrap_or(DEFAULT_SAMPLE_INTERVAL_SECS),
            ),
            batch_cells: args
                .batch_cells
                .or(file_batch_cells)
                .unwrap_or(DEFAULT_BATCH_CELLS),
            row_lookahead: file_row_lookahead.unwrap_or(DEFAULT_ROW_LOOKAHEAD),
            request_timeout: Duration::from_secs(
                args.request_timeout_secs
                    .or(file_request_timeout)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            default_viewport_rows: file_viewport_rows.unwrap_or(DEFAULT_VIEWPORT_ROWS),
            default_viewport_cols: file_viewport_cols.unwrap_or(DEFAULT_VIEWPORT_COLS),
            tile_rows: file_tile_rows.unwrap_or(DEFAULT_TILE_ROWS),
            tile_cols: file_tile_cols.unwrap_or(DEFAULT_TILE_COLS),
            retention_margin: file_retention_margin.unwrap_or(DEFAULT_RETENTION_MARGIN),
            spillover: file_spillover.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.workbook_cache_capacity > 0,
            "workbook cache capacity must be at least 1"
        );
        anyhow::ensure!(
            self.structure_cache_capacity > 0,
            "structure cache capacity must be at least 1"
        );
        anyhow::ensure!(
            self.memory.soft_mb > 0.0 && self.memory.soft_mb < self.memory.hard_mb,
            "soft memory limit ({} MB) must be positive and below the hard limit ({} MB)",
            self.memory.soft_mb,
            self.memory.hard_mb
        );
        anyhow::ensure!(self.batch_cells > 0, "batch size must be at least 1 cell");
        anyhow::ensure!(
            !self.memory_sample_interval.is_zero(),
            "memory sample interval must be non-zero"
        );
        anyhow::ensure!(
            !self.request_timeout.is_zero(),
            "request timeout must be non-zero"
        );
        anyhow::ensure!(
            self.tile_rows > 0 && self.tile_cols > 0,
            "tile size must be at least 1x1"
        );
        anyhow::ensure!(
            self.default_viewport_rows > 0 && self.default_viewport_cols > 0,
            "default viewport must be at least 1x1"
        );
        anyhow::ensure!(
            self.spillover.char_width_px > 0.0,
            "spillover character width must be positive"
        );
        Ok(())
    }

    pub fn structure_options(&self) -> StructureOptions {
        StructureOptions {
            default_rows: self.default_viewport_rows,
            default_cols: self.default_viewport_cols,
        }
    }

    pub fn chunk_options(&self, extract_styles: bool) -> ChunkOptions {
        ChunkOptions {
            extract_styles,
            batch_cells: self.batch_cells,
            row_lookahead: self.row_lookahead,
        }
    }
}

#[derive(Parser, Debug, Default, Clone)]
#[command(
    name = "spreadsheet-worker",
    about = "Inspect a workbook through the background chunk worker",
    version
)]
pub struct CliArgs {
    #[arg(value_name = "FILE", help = "Workbook to open (.xlsx)")]
    pub file: PathBuf,

    #[arg(
        long,
        value_name = "FILE",
        help = "Path to a configuration file (YAML or JSON)"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "INDEX", help = "Sheet index to read a chunk from")]
    pub sheet: Option<usize>,

    #[arg(
        long,
        value_name = "START:END",
        value_parser = parse_row_span,
        help = "Row span of the chunk, e.g. 1:50"
    )]
    pub rows: Option<(u32, u32)>,

    #[arg(
        long,
        value_name = "START:END",
        value_parser = parse_col_span,
        help = "Column span of the chunk, e.g. A:T or 1:20"
    )]
    pub cols: Option<(u32, u32)>,

    #[arg(long, help = "Include minimal cell styles in the chunk")]
    pub styles: bool,

    #[arg(long, help = "Print worker metrics in OpenMetrics format")]
    pub metrics: bool,

    #[arg(
        long,
        env = "SPREADSHEET_WORKER_WORKBOOK_CACHE",
        value_name = "N",
        help = "Decoded workbooks kept in memory"
    )]
    pub workbook_cache_capacity: Option<usize>,

    #[arg(
        long,
        env = "SPREADSHEET_WORKER_STRUCTURE_CACHE",
        value_name = "N",
        help = "Structure summaries kept in memory"
    )]
    pub structure_cache_capacity: Option<usize>,

    #[arg(
        long,
        env = "SPREADSHEET_WORKER_SOFT_LIMIT_MB",
        value_name = "MB",
        help = "Memory above which chunks are truncated"
    )]
    pub soft_memory_limit_mb: Option<f64>,

    #[arg(
        long,
        env = "SPREADSHEET_WORKER_HARD_LIMIT_MB",
        value_name = "MB",
        help = "Memory above which caches are dropped"
    )]
    pub hard_memory_limit_mb: Option<f64>,

    #[arg(
        long,
        env = "SPREADSHEET_WORKER_BATCH_CELLS",
        value_name = "N",
        help = "Cells processed between yields"
    )]
    pub batch_cells: Option<usize>,

    #[arg(
        long,
        env = "SPREADSHEET_WORKER_REQUEST_TIMEOUT",
        value_name = "SECS",
        help = "Seconds before a request is abandoned"
    )]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    workbook_cache_capacity: Option<usize>,
    structure_cache_capacity: Option<usize>,
    soft_memory_limit_mb: Option<f64>,
    hard_memory_limit_mb: Option<f64>,
    memory_sample_interval_secs: Option<u64>,
    batch_cells: Option<usize>,
    row_lookahead: Option<u32>,
    request_timeout_secs: Option<u64>,
    default_viewport_rows: Option<u32>,
    default_viewport_cols: Option<u32>,
    tile_rows: Option<u32>,
    tile_cols: Option<u32>,
    retention_margin: Option<u32>,
    spillover: Option<SpilloverConfig>,
}

fn load_config_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}

fn parse_span(value: &str, parse_bound: impl Fn(&str) -> Option<u32>) -> Result<(u32, u32), String> {
    let (start, end) = value
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got {value:?}"))?;
    let start = parse_bound(start.trim()).ok_or_else(|| format!("invalid start {start:?}"))?;
    let end = parse_bound(end.trim()).ok_or_else(|| format!("invalid end {end:?}"))?;
    if start == 0 || start > end {
        return Err(format!("span {value:?} is empty"));
    }
    Ok((start, end))
}

fn parse_row_span(value: &str) -> Result<(u32, u32), String> {
    parse_span(value, |bound| bound.parse().ok())
}

fn parse_col_span(value: &str) -> Result<(u32, u32), String> {
    parse_span(value, |bound| {
        bound.parse().ok().or_else(|| column_name_to_number(bound))
    })
}
