//! Text overflow layout.
//!
//! Left-flowing text wider than its column is drawn across empty neighbours to
//! the right, the way spreadsheet applications render it. Everything here is
//! pure; rows never influence each other.

use crate::model::{CellRecord, CellValue, HorizontalAlign, SpilloverRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Width of a column with no explicit width, in characters
pub const DEFAULT_COLUMN_WIDTH_CHARS: f64 = 8.43;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpilloverConfig {
    /// Approximate pixel width of one character
    pub char_width_px: f64,
    /// Horizontal padding added to the text estimate
    pub cell_padding_px: f64,
    /// Most neighbour columns one cell may spill into
    pub max_spill_columns: u32,
    pub default_column_width: f64,
}

impl Default for SpilloverConfig {
    fn default() -> Self {
        Self {
            char_width_px: 7.0,
            cell_padding_px: 6.0,
            max_spill_columns: 16,
            default_column_width: DEFAULT_COLUMN_WIDTH_CHARS,
        }
    }
}

impl SpilloverConfig {
    /// Estimated rendered width of `text`
    pub fn text_width_px(&self, text: &str) -> f64 {
        text.chars().count() as f64 * self.char_width_px + self.cell_padding_px
    }

    /// Pixel width of a column given its width in characters
    pub fn column_width_px(&self, width_chars: Option<f64>) -> f64 {
        let chars = width_chars.unwrap_or(self.default_column_width);
        (chars * self.char_width_px + 5.0).trunc()
    }
}

/// Spill ranges for the cells of one row.
///
/// `cells` maps column to value, `alignments` column to horizontal alignment
/// (absent means general), `column_widths` column to width in characters.
pub fn compute_spillovers(
    row: u32,
    cells: &BTreeMap<u32, CellValue>,
    alignments: &BTreeMap<u32, HorizontalAlign>,
    column_widths: &BTreeMap<u32, f64>,
    config: &SpilloverConfig,
) -> Vec<SpilloverRange> {
    spill_row(row, cells, alignments, column_widths, config, &|_: u32| false)
}

/// `unknown` marks columns whose content has not been loaded; text never
/// spills across them.
fn spill_row(
    row: u32,
    cells: &BTreeMap<u32, CellValue>,
    alignments: &BTreeMap<u32, HorizontalAlign>,
    column_widths: &BTreeMap<u32, f64>,
    config: &SpilloverConfig,
    unknown: &dyn Fn(u32) -> bool,
) -> Vec<SpilloverRange> {
    let width_px = |col: u32| config.column_width_px(column_widths.get(&col).copied());
    let occupied =
        |col: u32| unknown(col) || cells.get(&col).is_some_and(|value| !value.is_blank());

    let mut ranges = Vec::new();
    for (&source_col, value) in cells {
        let Some(text) = value.as_text().filter(|text| !text.is_empty()) else {
            continue;
        };
        if alignments
            .get(&source_col)
            .is_some_and(|align| !align.allows_spill())
        {
            continue;
        }

        let needed = config.text_width_px(text);
        let mut covered = width_px(source_col);
        let mut end_col = None;
        let mut consumed = 0;
        let mut col = source_col;

        while covered < needed && consumed < config.max_spill_columns {
            let Some(next) = col.checked_add(1) else {
                break;
            };
            if occupied(next) {
                break;
            }
            covered += width_px(next);
            end_col = Some(next);
            consumed += 1;
            col = next;
        }

        if let Some(end_col) = end_col {
            ranges.push(SpilloverRange {
                source_row: row,
                source_col,
                start_col: source_col + 1,
                end_col,
            });
        }
    }
    ranges
}

/// Spill ranges for a set of cells spanning any number of rows
pub fn compute_sheet_spillovers<'a>(
    cells: impl IntoIterator<Item = &'a CellRecord>,
    column_widths: &BTreeMap<u32, f64>,
    config: &SpilloverConfig,
) -> Vec<SpilloverRange> {
    compute_partial_spillovers(cells, column_widths, config, |_, _| false)
}

/// Like [`compute_sheet_spillovers`] for a partially loaded sheet:
/// `unknown(row, col)` is true where content is not known yet.
pub fn compute_partial_spillovers<'a>(
    cells: impl IntoIterator<Item = &'a CellRecord>,
    column_widths: &BTreeMap<u32, f64>,
    config: &SpilloverConfig,
    unknown: impl Fn(u32, u32) -> bool,
) -> Vec<SpilloverRange> {
    let mut rows: BTreeMap<u32, (BTreeMap<u32, CellValue>, BTreeMap<u32, HorizontalAlign>)> =
        BTreeMap::new();
    for cell in cells {
        let (values, alignments) = rows.entry(cell.row).or_default();
        values.insert(cell.col, cell.value.clone());
        let align = cell
            .align
            .or_else(|| cell.style.as_ref().and_then(|style| style.horizontal()));
        if let Some(align) = align {
            alignments.insert(cell.col, align);
        }
    }

    rows.iter()
        .flat_map(|(&row, (values, alignments))| {
            spill_row(row, values, alignments, column_widths, config, &|col: u32| {
                unknown(row, col)
            })
        })
        .collect()
}
