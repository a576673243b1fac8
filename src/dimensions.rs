use crate::adapter::SheetSource;
use crate::model::ChunkRegion;
use std::collections::BTreeMap;

/// Rows past `start_row` whose heights are reported with a chunk
pub const DEFAULT_ROW_LOOKAHEAD: u32 = 100;

/// Column widths and row heights for a region, keyed by 1-based index.
///
/// Widths cover every column of the region. Heights cover the region's rows,
/// capped at `lookahead` rows past `start_row`. Entries the sheet does not
/// define are omitted so the renderer falls back to its defaults.
pub fn extract_dimensions(
    source: &dyn SheetSource,
    region: &ChunkRegion,
    lookahead: u32,
) -> (BTreeMap<u32, f64>, BTreeMap<u32, f64>) {
    let column_widths = (region.start_col..=region.end_col)
        .filter_map(|col| source.column_width(col).map(|width| (col, width)))
        .collect();

    let last_row = region.end_row.min(region.start_row.saturating_add(lookahead));
    let row_heights = (region.start_row..=last_row)
        .filter_map(|row| source.row_height(row).map(|height| (row, height)))
        .collect();

    (column_widths, row_heights)
}
