//! Chunk extraction.
//!
//! A chunk is produced in mini-batches of whole rows so the worker can yield
//! between batches. [`ChunkBuilder`] holds the progress and works against any
//! [`SheetSource`]; [`ChunkJob`] pairs it with a decoded workbook the job keeps
//! alive for its whole run.

use crate::adapter::{DecodedWorkbook, SheetSource};
use crate::dimensions::{DEFAULT_ROW_LOOKAHEAD, extract_dimensions};
use crate::error::ChunkError;
use crate::model::{CellRecord, Chunk, ChunkRegion};
use crate::values::normalize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_BATCH_CELLS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub extract_styles: bool,
    /// Upper bound on cells per batch; a batch always covers at least one row
    pub batch_cells: usize,
    pub row_lookahead: u32,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            extract_styles: false,
            batch_cells: DEFAULT_BATCH_CELLS,
            row_lookahead: DEFAULT_ROW_LOOKAHEAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More rows remain
    Pending,
    /// Every row of the region has been read
    Complete,
}

/// A finished chunk plus what went wrong producing it
#[derive(Debug, Clone)]
pub struct ChunkOutput {
    pub chunk: Chunk,
    pub cells_skipped: u64,
}

#[derive(Debug)]
pub struct ChunkBuilder {
    region: ChunkRegion,
    options: ChunkOptions,
    next_row: u32,
    rows_per_batch: u32,
    cells: Vec<CellRecord>,
    cells_skipped: u64,
}

impl ChunkBuilder {
    pub fn new(region: ChunkRegion, options: ChunkOptions) -> Result<Self, ChunkError> {
        validate_region(&region)?;
        let rows_per_batch = (options.batch_cells / region.width() as usize).max(1);
        Ok(Self {
            region,
            options,
            next_row: region.start_row,
            rows_per_batch: u32::try_from(rows_per_batch).unwrap_or(u32::MAX),
            cells: Vec::new(),
            cells_skipped: 0,
        })
    }

    pub fn region(&self) -> &ChunkRegion {
        &self.region
    }

    pub fn is_complete(&self) -> bool {
        self.next_row > self.region.end_row
    }

    /// Rows read so far
    pub fn rows_done(&self) -> u32 {
        self.next_row - self.region.start_row
    }

    /// Read the next batch of rows
    pub fn step(&mut self, source: &dyn SheetSource) -> StepOutcome {
        if self.is_complete() {
            return StepOutcome::Complete;
        }

        let last = self
            .region
            .end_row
            .min(self.next_row.saturating_add(self.rows_per_batch - 1));
        for row in self.next_row..=last {
            for col in self.region.start_col..=self.region.end_col {
                self.read_one(source, row, col);
            }
        }
        self.next_row = last.saturating_add(1);

        if self.is_complete() {
            StepOutcome::Complete
        } else {
            StepOutcome::Pending
        }
    }

    fn read_one(&mut self, source: &dyn SheetSource, row: u32, col: u32) {
        match source.read_cell(row, col, self.options.extract_styles) {
            Ok(Some(cell)) if !cell.raw.is_null() => self.cells.push(CellRecord {
                row,
                col,
                value: normalize(&cell.raw),
                kind: cell.raw.kind(),
                align: cell.align,
                style: cell.style,
            }),
            Ok(_) => {}
            Err(err) => {
                debug!(row, col, error = %err, "skipping undecodable cell");
                self.cells_skipped += 1;
            }
        }
    }

    /// Close the chunk. With `truncate`, unread rows are left for a follow-up
    /// request starting at `resume_row`.
    pub fn finish(self, source: &dyn SheetSource, truncate: bool) -> ChunkOutput {
        let (column_widths, row_heights) =
            extract_dimensions(source, &self.region, self.options.row_lookahead);
        let truncated = truncate && !self.is_complete();

        ChunkOutput {
            chunk: Chunk {
                chunk_id: self.region.chunk_id(),
                region: self.region,
                cells: self.cells,
                column_widths,
                row_heights,
                truncated,
                resume_row: truncated.then_some(self.next_row),
            },
            cells_skipped: self.cells_skipped,
        }
    }
}

fn validate_region(region: &ChunkRegion) -> Result<(), ChunkError> {
    if region.start_row == 0 || region.start_col == 0 {
        return Err(ChunkError::InvalidRegion(format!(
            "rows and columns are 1-based, got {}",
            region.chunk_id()
        )));
    }
    if region.start_row > region.end_row || region.start_col > region.end_col {
        return Err(ChunkError::InvalidRegion(format!(
            "region {} is empty",
            region.chunk_id()
        )));
    }
    Ok(())
}

/// Run a whole chunk against a source in one go
pub fn process_chunk(
    source: &dyn SheetSource,
    region: ChunkRegion,
    options: ChunkOptions,
) -> Result<ChunkOutput, ChunkError> {
    let mut builder = ChunkBuilder::new(region, options)?;
    while builder.step(source) == StepOutcome::Pending {}
    Ok(builder.finish(source, false))
}

/// A chunk in progress against a decoded workbook
#[derive(Debug)]
pub struct ChunkJob {
    workbook: Arc<DecodedWorkbook>,
    builder: ChunkBuilder,
}

impl ChunkJob {
    pub fn new(
        workbook: Arc<DecodedWorkbook>,
        region: ChunkRegion,
        options: ChunkOptions,
    ) -> Result<Self, ChunkError> {
        let count = workbook.sheet_count();
        if region.sheet_index >= count {
            return Err(ChunkError::SheetNotFound {
                index: region.sheet_index,
                count,
            });
        }
        Ok(Self {
            workbook,
            builder: ChunkBuilder::new(region, options)?,
        })
    }

    pub fn region(&self) -> &ChunkRegion {
        self.builder.region()
    }

    pub fn step(&mut self) -> StepOutcome {
        match self.workbook.sheet(self.builder.region.sheet_index) {
            Some(sheet) => self.builder.step(&sheet),
            None => StepOutcome::Complete,
        }
    }

    pub fn finish(self, truncate: bool) -> Result<ChunkOutput, ChunkError> {
        let index = self.builder.region.sheet_index;
        let sheet = self.workbook.sheet(index).ok_or(ChunkError::SheetNotFound {
            index,
            count: self.workbook.sheet_count(),
        })?;
        Ok(self.builder.finish(&sheet, truncate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::test_sheet::MemorySheet;
    use crate::model::{CellKind, CellValue, HorizontalAlign};
    use crate::values::RawValue;

    fn grid(rows: u32, cols: u32) -> MemorySheet {
        let mut sheet = MemorySheet::default();
        for row in 1..=rows {
            for col in 1..=cols {
                sheet.cells.insert((row, col), RawValue::Number(f64::from(row * 100 + col)));
            }
        }
        sheet
    }

    #[test]
    fn emits_only_non_null_cells() {
        let sheet = MemorySheet::default()
            .with_cell(1, 1, RawValue::Text("a".into()))
            .with_cell(2, 3, RawValue::Formula(None))
            .with_cell(3, 2, RawValue::Null);

        let output = process_chunk(&sheet, ChunkRegion::new(0, 1, 5, 1, 5), ChunkOptions::default())
            .expect("chunk");
        let cells = output.chunk.cells;
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].value, CellValue::Text("a".into()));
        assert_eq!(cells[1].kind, CellKind::Formula);
        assert_eq!(cells[1].value, CellValue::Empty);
        assert!(!output.chunk.truncated);
    }

    #[test]
    fn alignment_is_kept_when_styles_are_off() {
        let mut sheet = MemorySheet::default().with_cell(1, 1, RawValue::Text("r".into()));
        sheet.aligns.insert((1, 1), HorizontalAlign::Right);

        let output = process_chunk(&sheet, ChunkRegion::new(0, 1, 1, 1, 2), ChunkOptions::default())
            .expect("chunk");
        assert_eq!(output.chunk.cells[0].align, Some(HorizontalAlign::Right));
        assert!(output.chunk.cells[0].style.is_none());
    }

    #[test]
    fn batches_whole_rows() {
        let sheet = grid(10, 30);
        let options = ChunkOptions {
            batch_cells: 100,
            ..ChunkOptions::default()
        };
        let mut builder = ChunkBuilder::new(ChunkRegion::new(0, 1, 10, 1, 30), options).unwrap();

        assert_eq!(builder.step(&sheet), StepOutcome::Pending);
        assert_eq!(builder.rows_done(), 3);

        // A row wider than the batch still advances one row at a time
        let options = ChunkOptions {
            batch_cells: 10,
            ..ChunkOptions::default()
        };
        let mut narrow = ChunkBuilder::new(ChunkRegion::new(0, 1, 10, 1, 30), options).unwrap();
        narrow.step(&sheet);
        assert_eq!(narrow.rows_done(), 1);
    }

    #[test]
    fn truncation_returns_prefix_and_resume_row() {
        let sheet = grid(50, 4);
        let region = ChunkRegion::new(0, 1, 50, 1, 4);
        let options = ChunkOptions {
            batch_cells: 40,
            ..ChunkOptions::default()
        };
        let mut builder = ChunkBuilder::new(region, options).unwrap();
        builder.step(&sheet);
        builder.step(&sheet);
        let output = builder.finish(&sheet, true);

        assert!(output.chunk.truncated);
        assert_eq!(output.chunk.resume_row, Some(21));
        assert_eq!(output.chunk.cells.len(), 80);
        assert!(output.chunk.cells.iter().all(|c| c.row < 21));

        let rest = output.chunk.remainder().unwrap();
        let tail = process_chunk(&sheet, rest, options).unwrap();
        assert_eq!(output.chunk.cells.len() + tail.chunk.cells.len(), 200);
        assert!(tail.chunk.cells.iter().all(|c| c.row >= 21));
    }

    #[test]
    fn truncating_a_complete_chunk_is_a_no_op() {
        let sheet = grid(2, 2);
        let mut builder =
            ChunkBuilder::new(ChunkRegion::new(0, 1, 2, 1, 2), ChunkOptions::default()).unwrap();
        builder.step(&sheet);
        let output = builder.finish(&sheet, true);
        assert!(!output.chunk.truncated);
        assert_eq!(output.chunk.resume_row, None);
    }

    #[test]
    fn failing_cells_are_skipped_and_counted() {
        let mut sheet = grid(3, 3);
        sheet.poisoned.insert((2, 2));

        let output =
            process_chunk(&sheet, ChunkRegion::new(0, 1, 3, 1, 3), ChunkOptions::default()).unwrap();
        assert_eq!(output.cells_skipped, 1);
        assert_eq!(output.chunk.cells.len(), 8);
        assert!(!output.chunk.cells.iter().any(|c| c.row == 2 && c.col == 2));
    }

    #[test]
    fn rejects_malformed_regions() {
        let err = ChunkBuilder::new(ChunkRegion::new(0, 0, 5, 1, 1), ChunkOptions::default()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidRegion);
        let err = ChunkBuilder::new(ChunkRegion::new(0, 9, 5, 1, 1), ChunkOptions::default()).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidRegion(_)));
    }
}
