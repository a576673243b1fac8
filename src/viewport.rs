//! Consumer-side viewport bookkeeping.
//!
//! The sheet is cut into fixed tiles. Moving the viewport plans requests for
//! tiles it newly touches and drops tiles that fall outside a retention margin.
//! Responses are matched to plans by id, so arrival order does not matter and
//! answers to dropped plans are ignored. Nothing here performs I/O; the
//! session drives it.

use crate::model::{CellRecord, Chunk, ChunkRegion, SheetSummary, SpilloverRange, Viewport};
use crate::spillover::{SpilloverConfig, compute_partial_spillovers};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeMap;
use tracing::debug;

pub type PlanId = u64;

/// Tile coordinates, zero-based
type TileKey = (u32, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSettings {
    pub tile_rows: u32,
    pub tile_cols: u32,
    pub retention_margin: u32,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self {
            tile_rows: 50,
            tile_cols: 20,
            retention_margin: 1,
        }
    }
}

/// A chunk request the session should issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRequest {
    pub id: PlanId,
    pub region: ChunkRegion,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellState<'a> {
    Value(&'a CellRecord),
    /// Loaded and holds nothing
    Empty,
    /// Not loaded yet
    Pending,
    /// Could not be loaded after a retry
    Error,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    tile: TileKey,
    region: ChunkRegion,
    retried: bool,
}

#[derive(Debug)]
pub struct ViewportManager {
    sheet_index: usize,
    last_row: u32,
    last_col: u32,
    settings: ViewportSettings,
    viewport: Option<Viewport>,
    tiles: AHashSet<TileKey>,
    outstanding: AHashMap<PlanId, Outstanding>,
    cells: AHashMap<(u32, u32), CellRecord>,
    failed: Vec<(TileKey, ChunkRegion)>,
    column_widths: BTreeMap<u32, f64>,
    row_heights: BTreeMap<u32, f64>,
    stale: Vec<PlanId>,
    next_id: PlanId,
}

impl ViewportManager {
    pub fn new(sheet: &SheetSummary, settings: ViewportSettings) -> Self {
        Self {
            sheet_index: sheet.index,
            last_row: sheet.last_row,
            last_col: sheet.last_col,
            settings: ViewportSettings {
                tile_rows: settings.tile_rows.max(1),
                tile_cols: settings.tile_cols.max(1),
                ..settings
            },
            viewport: None,
            tiles: AHashSet::new(),
            outstanding: AHashMap::new(),
            cells: AHashMap::new(),
            failed: Vec::new(),
            column_widths: BTreeMap::new(),
            row_heights: BTreeMap::new(),
            stale: Vec::new(),
            next_id: 1,
        }
    }

    pub fn sheet_index(&self) -> usize {
        self.sheet_index
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn pending_requests(&self) -> usize {
        self.outstanding.len()
    }

    pub fn column_widths(&self) -> &BTreeMap<u32, f64> {
        &self.column_widths
    }

    pub fn row_heights(&self) -> &BTreeMap<u32, f64> {
        &self.row_heights
    }

    pub fn loaded_cells(&self) -> impl Iterator<Item = &CellRecord> {
        self.cells.values()
    }

    /// Ids of planned requests that no longer matter; the caller should
    /// cancel them
    pub fn take_stale(&mut self) -> Vec<PlanId> {
        std::mem::take(&mut self.stale)
    }

    /// Move the viewport, returning requests for newly needed tiles
    pub fn set_viewport(&mut self, viewport: Viewport) -> Vec<PlannedRequest> {
        self.viewport = Some(viewport);
        let Some((rows, cols)) = self.tile_span(&viewport) else {
            self.retain_tiles(None);
            return Vec::new();
        };

        let margin = self.settings.retention_margin;
        let keep = (
            rows.0.saturating_sub(margin),
            rows.1.saturating_add(margin),
            cols.0.saturating_sub(margin),
            cols.1.saturating_add(margin),
        );
        self.retain_tiles(Some(keep));

        let mut planned = Vec::new();
        for tile_row in rows.0..=rows.1 {
            for tile_col in cols.0..=cols.1 {
                let tile = (tile_row, tile_col);
                if self.tiles.insert(tile) {
                    let region = self.tile_region(tile);
                    planned.push(self.plan(tile, region, false));
                }
            }
        }
        if !planned.is_empty() {
            debug!(
                sheet = self.sheet_index,
                requests = planned.len(),
                "viewport planned chunk requests"
            );
        }
        planned
    }

    /// Merge a response. A truncated chunk yields a follow-up for the rest.
    pub fn apply_chunk(&mut self, id: PlanId, chunk: Chunk) -> Vec<PlannedRequest> {
        let Some(outstanding) = self.outstanding.remove(&id) else {
            debug!(plan = id, "ignoring response for unknown or dropped request");
            return Vec::new();
        };

        let region = outstanding.region;
        for cell in chunk.cells {
            if region.contains(cell.row, cell.col) {
                self.cells.insert((cell.row, cell.col), cell);
            }
        }
        self.column_widths.extend(chunk.column_widths);
        self.row_heights.extend(chunk.row_heights);

        match chunk.resume_row.filter(|_| chunk.truncated) {
            Some(resume) if resume > region.start_row && resume <= region.end_row => {
                let rest = ChunkRegion {
                    start_row: resume,
                    ..region
                };
                vec![self.plan(outstanding.tile, rest, outstanding.retried)]
            }
            _ => Vec::new(),
        }
    }

    /// Record a failed request. The first failure retries the region as two
    /// halves; a failure of a retry marks its cells as errors.
    pub fn apply_failure(&mut self, id: PlanId) -> Vec<PlannedRequest> {
        let Some(outstanding) = self.outstanding.remove(&id) else {
            return Vec::new();
        };
        let Outstanding {
            tile,
            region,
            retried,
        } = outstanding;

        if retried {
            debug!(plan = id, region = %region.chunk_id(), "chunk failed after retry");
            self.failed.push((tile, region));
            return Vec::new();
        }

        split_region(&region)
            .into_iter()
            .map(|half| self.plan(tile, half, true))
            .collect()
    }

    pub fn cell_state(&self, row: u32, col: u32) -> CellState<'_> {
        if let Some(cell) = self.cells.get(&(row, col)) {
            return CellState::Value(cell);
        }
        if row == 0 || col == 0 || row > self.last_row || col > self.last_col {
            return CellState::Empty;
        }
        if self.failed.iter().any(|(_, region)| region.contains(row, col)) {
            return CellState::Error;
        }
        if self
            .outstanding
            .values()
            .any(|outstanding| outstanding.region.contains(row, col))
        {
            return CellState::Pending;
        }
        if self.tiles.contains(&self.tile_of(row, col)) {
            CellState::Empty
        } else {
            CellState::Pending
        }
    }

    /// Overflow ranges for text in the visible rows that reach visible columns.
    /// Spills stop short of cells that are still pending or failed.
    pub fn spillovers_for_viewport(&self, config: &SpilloverConfig) -> Vec<SpilloverRange> {
        let Some(viewport) = self.viewport else {
            return Vec::new();
        };
        let rows = self
            .cells
            .values()
            .filter(|cell| cell.row >= viewport.start_row && cell.row <= viewport.end_row);

        let unknown =
            |row: u32, col: u32| matches!(self.cell_state(row, col), CellState::Pending | CellState::Error);
        let mut ranges = compute_partial_spillovers(rows, &self.column_widths, config, unknown);
        ranges.retain(|range| range.end_col >= viewport.start_col && range.source_col <= viewport.end_col);
        ranges
    }

    fn plan(&mut self, tile: TileKey, region: ChunkRegion, retried: bool) -> PlannedRequest {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(
            id,
            Outstanding {
                tile,
                region,
                retried,
            },
        );
        PlannedRequest { id, region }
    }

    /// Drop tiles outside `keep` (inclusive tile bounds), or all of them
    fn retain_tiles(&mut self, keep: Option<(u32, u32, u32, u32)>) {
        let inside = |tile: &TileKey| {
            keep.is_some_and(|(r0, r1, c0, c1)| {
                tile.0 >= r0 && tile.0 <= r1 && tile.1 >= c0 && tile.1 <= c1
            })
        };

        let before = self.tiles.len();
        self.tiles.retain(|tile| inside(tile));
        if self.tiles.len() == before {
            return;
        }

        let (tile_rows, tile_cols) = (self.settings.tile_rows, self.settings.tile_cols);
        self.cells
            .retain(|(row, col), _| inside(&((row - 1) / tile_rows, (col - 1) / tile_cols)));
        self.failed.retain(|(tile, _)| inside(tile));
        let kept_row = |row: u32| {
            let tile_row = row.saturating_sub(1) / tile_rows;
            keep.is_some_and(|(r0, r1, _, _)| tile_row >= r0 && tile_row <= r1)
        };
        let kept_col = |col: u32| {
            let tile_col = col.saturating_sub(1) / tile_cols;
            keep.is_some_and(|(_, _, c0, c1)| tile_col >= c0 && tile_col <= c1)
        };
        self.row_heights.retain(|row, _| kept_row(*row));
        self.column_widths.retain(|col, _| kept_col(*col));

        let stale: Vec<PlanId> = self
            .outstanding
            .iter()
            .filter(|(_, outstanding)| !inside(&outstanding.tile))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.outstanding.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "viewport dropped in-flight requests");
        }
        self.stale.extend(stale);
    }

    /// Inclusive tile bounds covering the viewport clipped to the sheet
    fn tile_span(&self, viewport: &Viewport) -> Option<((u32, u32), (u32, u32))> {
        let start_row = viewport.start_row.max(1);
        let start_col = viewport.start_col.max(1);
        let end_row = viewport.end_row.min(self.last_row);
        let end_col = viewport.end_col.min(self.last_col);
        if start_row > end_row || start_col > end_col {
            return None;
        }
        let (first_row, first_col) = self.tile_of(start_row, start_col);
        let (last_row, last_col) = self.tile_of(end_row, end_col);
        Some(((first_row, last_row), (first_col, last_col)))
    }

    fn tile_of(&self, row: u32, col: u32) -> TileKey {
        (
            row.saturating_sub(1) / self.settings.tile_rows,
            col.saturating_sub(1) / self.settings.tile_cols,
        )
    }

    fn tile_region(&self, (tile_row, tile_col): TileKey) -> ChunkRegion {
        let start_row = tile_row * self.settings.tile_rows + 1;
        let start_col = tile_col * self.settings.tile_cols + 1;
        ChunkRegion::new(
            self.sheet_index,
            start_row,
            (start_row + self.settings.tile_rows - 1).min(self.last_row),
            start_col,
            (start_col + self.settings.tile_cols - 1).min(self.last_col),
        )
    }
}

/// Halve by rows, or by columns for single-row regions. Single cells are
/// retried whole.
fn split_region(region: &ChunkRegion) -> Vec<ChunkRegion> {
    if region.height() > 1 {
        let mid = region.start_row + region.height() / 2 - 1;
        vec![
            ChunkRegion {
                end_row: mid,
                ..*region
            },
            ChunkRegion {
                start_row: mid + 1,
                ..*region
            },
        ]
    } else if region.width() > 1 {
        let mid = region.start_col + region.width() / 2 - 1;
        vec![
            ChunkRegion {
                end_col: mid,
                ..*region
            },
            ChunkRegion {
                start_col: mid + 1,
                ..*region
            },
        ]
    } else {
        vec![*region]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CellKind, CellValue};
    use assert_matches::assert_matches;

    fn sheet(last_row: u32, last_col: u32) -> SheetSummary {
        SheetSummary {
            id: "1".into(),
            name: "Sheet1".into(),
            index: 0,
            is_hidden: false,
            last_row,
            last_col,
            default_viewport: Viewport::new(1, last_row.min(50), 1, last_col.min(20)),
        }
    }

    fn chunk_for(region: ChunkRegion, cells: Vec<CellRecord>) -> Chunk {
        Chunk {
            chunk_id: region.chunk_id(),
            region,
            cells,
            column_widths: BTreeMap::new(),
            row_heights: BTreeMap::new(),
            truncated: false,
            resume_row: None,
        }
    }

    fn text_cell(row: u32, col: u32, text: &str) -> CellRecord {
        CellRecord {
            row,
            col,
            value: CellValue::Text(text.into()),
            kind: CellKind::String,
            align: None,
            style: None,
        }
    }

    #[test]
    fn plans_each_tile_once() {
        let mut manager = ViewportManager::new(&sheet(500, 60), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 60, 1, 25));
        let regions: Vec<_> = planned.iter().map(|p| p.region).collect();

        assert_eq!(planned.len(), 4);
        assert!(regions.contains(&ChunkRegion::new(0, 1, 50, 1, 20)));
        assert!(regions.contains(&ChunkRegion::new(0, 51, 100, 21, 40)));
        assert!(manager.set_viewport(Viewport::new(5, 55, 3, 22)).is_empty());
    }

    #[test]
    fn tiles_are_clipped_to_the_sheet() {
        let mut manager = ViewportManager::new(&sheet(30, 5), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 50, 1, 20));
        assert_eq!(planned, vec![PlannedRequest {
            id: 1,
            region: ChunkRegion::new(0, 1, 30, 1, 5),
        }]);
        assert_matches!(manager.cell_state(40, 3), CellState::Empty);
    }

    #[test]
    fn cells_are_pending_until_their_chunk_arrives() {
        let mut manager = ViewportManager::new(&sheet(100, 20), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 50, 1, 20));
        assert_matches!(manager.cell_state(1, 1), CellState::Pending);

        let region = planned[0].region;
        manager.apply_chunk(planned[0].id, chunk_for(region, vec![text_cell(1, 1, "a")]));
        assert_matches!(manager.cell_state(1, 1), CellState::Value(cell) if cell.value == CellValue::Text("a".into()));
        assert_matches!(manager.cell_state(2, 2), CellState::Empty);
        assert_eq!(manager.pending_requests(), 0);
    }

    #[test]
    fn out_of_order_and_unknown_responses() {
        let mut manager = ViewportManager::new(&sheet(100, 20), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 100, 1, 20));
        assert_eq!(planned.len(), 2);

        manager.apply_chunk(planned[1].id, chunk_for(planned[1].region, vec![text_cell(60, 1, "late")]));
        manager.apply_chunk(planned[0].id, chunk_for(planned[0].region, vec![text_cell(1, 1, "early")]));
        assert!(manager.apply_chunk(999, chunk_for(planned[0].region, vec![text_cell(2, 2, "ghost")])).is_empty());

        assert_matches!(manager.cell_state(60, 1), CellState::Value(_));
        assert_matches!(manager.cell_state(1, 1), CellState::Value(_));
        assert_matches!(manager.cell_state(2, 2), CellState::Empty);
    }

    #[test]
    fn truncated_chunk_requests_the_remainder() {
        let mut manager = ViewportManager::new(&sheet(50, 20), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 50, 1, 20));
        let region = planned[0].region;

        let mut chunk = chunk_for(region, vec![text_cell(3, 1, "x")]);
        chunk.truncated = true;
        chunk.resume_row = Some(21);
        let follow_up = manager.apply_chunk(planned[0].id, chunk);

        assert_eq!(follow_up.len(), 1);
        assert_eq!(follow_up[0].region, ChunkRegion::new(0, 21, 50, 1, 20));
        assert_matches!(manager.cell_state(10, 1), CellState::Empty);
        assert_matches!(manager.cell_state(30, 1), CellState::Pending);
    }

    #[test]
    fn failures_retry_once_in_halves_then_error() {
        let mut manager = ViewportManager::new(&sheet(50, 20), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 50, 1, 20));

        let halves = manager.apply_failure(planned[0].id);
        assert_eq!(halves.len(), 2);
        assert_eq!(halves[0].region, ChunkRegion::new(0, 1, 25, 1, 20));
        assert_eq!(halves[1].region, ChunkRegion::new(0, 26, 50, 1, 20));

        manager.apply_chunk(halves[0].id, chunk_for(halves[0].region, vec![]));
        assert!(manager.apply_failure(halves[1].id).is_empty());

        assert_matches!(manager.cell_state(10, 1), CellState::Empty);
        assert_matches!(manager.cell_state(40, 1), CellState::Error);
    }

    #[test]
    fn scrolling_away_drops_cells_and_marks_requests_stale() {
        let settings = ViewportSettings {
            retention_margin: 0,
            ..ViewportSettings::default()
        };
        let mut manager = ViewportManager::new(&sheet(1000, 20), settings);
        let first = manager.set_viewport(Viewport::new(1, 50, 1, 20));
        let second = manager.set_viewport(Viewport::new(51, 100, 1, 20));
        manager.apply_chunk(second[0].id, chunk_for(second[0].region, vec![text_cell(60, 1, "kept")]));

        let _ = manager.set_viewport(Viewport::new(501, 550, 1, 20));
        let stale = manager.take_stale();
        assert!(stale.contains(&first[0].id));
        assert!(manager.apply_chunk(first[0].id, chunk_for(first[0].region, vec![text_cell(1, 1, "old")])).is_empty());
        assert_eq!(manager.loaded_cells().count(), 0);
    }

    #[test]
    fn split_single_row_by_columns() {
        let halves = split_region(&ChunkRegion::new(0, 7, 7, 1, 9));
        assert_eq!(halves[0], ChunkRegion::new(0, 7, 7, 1, 4));
        assert_eq!(halves[1], ChunkRegion::new(0, 7, 7, 5, 9));
        assert_eq!(split_region(&ChunkRegion::new(0, 2, 2, 3, 3)).len(), 1);
    }

    #[test]
    fn spillovers_cover_visible_rows() {
        let mut manager = ViewportManager::new(&sheet(50, 20), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 10, 1, 10));
        let long = "s".repeat(40);
        manager.apply_chunk(
            planned[0].id,
            chunk_for(planned[0].region, vec![text_cell(2, 1, &long), text_cell(30, 1, &long)]),
        );

        let ranges = manager.spillovers_for_viewport(&SpilloverConfig::default());
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].source_row, 2);
        assert_eq!(ranges[0].start_col, 2);
    }

    #[test]
    fn spillovers_stop_at_pending_tiles() {
        let mut manager = ViewportManager::new(&sheet(50, 40), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 10, 1, 25));
        assert_eq!(planned.len(), 2);
        let left = planned
            .iter()
            .find(|p| p.region.start_col == 1)
            .expect("left tile");
        manager.apply_chunk(left.id, chunk_for(left.region, vec![text_cell(2, 20, &"p".repeat(60))]));

        assert_matches!(manager.cell_state(2, 21), CellState::Pending);
        assert!(manager.spillovers_for_viewport(&SpilloverConfig::default()).is_empty());

        let right = planned
            .iter()
            .find(|p| p.region.start_col == 21)
            .expect("right tile");
        manager.apply_chunk(right.id, chunk_for(right.region, vec![]));
        let ranges = manager.spillovers_for_viewport(&SpilloverConfig::default());
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].source_col, ranges[0].start_col), (20, 21));
        assert!(ranges[0].end_col > 21);
    }

    #[test]
    fn spillovers_stop_at_failed_regions() {
        let mut manager = ViewportManager::new(&sheet(50, 40), ViewportSettings::default());
        let planned = manager.set_viewport(Viewport::new(1, 10, 1, 25));
        let (left, right) = if planned[0].region.start_col == 1 {
            (planned[0], planned[1])
        } else {
            (planned[1], planned[0])
        };
        manager.apply_chunk(left.id, chunk_for(left.region, vec![text_cell(2, 20, &"f".repeat(60))]));
        for half in manager.apply_failure(right.id) {
            manager.apply_failure(half.id);
        }

        assert_matches!(manager.cell_state(2, 21), CellState::Error);
        assert!(manager.spillovers_for_viewport(&SpilloverConfig::default()).is_empty());
    }

    #[test]
    fn scrolling_away_prunes_dimensions() {
        let settings = ViewportSettings {
            retention_margin: 0,
            ..ViewportSettings::default()
        };
        let mut manager = ViewportManager::new(&sheet(1000, 20), settings);
        let planned = manager.set_viewport(Viewport::new(1, 50, 1, 20));
        let mut chunk = chunk_for(planned[0].region, vec![]);
        chunk.row_heights = BTreeMap::from([(2, 30.0), (40, 18.0)]);
        chunk.column_widths = BTreeMap::from([(3, 25.0)]);
        manager.apply_chunk(planned[0].id, chunk);

        let next = manager.set_viewport(Viewport::new(501, 550, 1, 20));
        let mut chunk = chunk_for(next[0].region, vec![]);
        chunk.row_heights = BTreeMap::from([(510, 40.0)]);
        manager.apply_chunk(next[0].id, chunk);

        assert_eq!(manager.row_heights().keys().copied().collect::<Vec<_>>(), vec![510]);
        // Same tile column, so the width survives
        assert_eq!(manager.column_widths().get(&3), Some(&25.0));
    }
}
