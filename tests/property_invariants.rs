//! Property-based invariant tests
//!
//! - Bounded caches never exceed capacity and keep the most recent key
//! - Spill ranges stay inside the row, never cross occupied cells and are
//!   a pure function of their input
//! - Viewport tiles cover every visible cell exactly once

use proptest::prelude::*;
use spreadsheet_worker::cache::BoundedCache;
use spreadsheet_worker::model::HorizontalAlign;
use spreadsheet_worker::viewport::{ViewportManager, ViewportSettings};
use spreadsheet_worker::{CellValue, SheetSummary, SpilloverConfig, Viewport, compute_spillovers};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Cache invariants
// =============================================================================

#[derive(Debug, Clone)]
enum CacheOp {
    Insert(u8),
    Get(u8),
    Clear,
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        6 => any::<u8>().prop_map(|k| CacheOp::Insert(k % 16)),
        3 => any::<u8>().prop_map(|k| CacheOp::Get(k % 16)),
        1 => Just(CacheOp::Clear),
    ]
}

proptest! {
    #[test]
    fn cache_never_exceeds_capacity(
        capacity in 1usize..8,
        ops in prop::collection::vec(cache_op(), 0..200),
    ) {
        let mut cache: BoundedCache<u8, u32> = BoundedCache::new("prop", capacity);
        let mut last_insert = None;

        for op in ops {
            match op {
                CacheOp::Insert(key) => {
                    cache.insert(key, u32::from(key) * 10, usize::from(key));
                    last_insert = Some(key);
                }
                CacheOp::Get(key) => {
                    if let Some(value) = cache.get(&key) {
                        prop_assert_eq!(value, u32::from(key) * 10);
                    }
                }
                CacheOp::Clear => {
                    cache.clear();
                    last_insert = None;
                }
            }
            prop_assert!(cache.len() <= capacity);
        }

        if let Some(key) = last_insert {
            prop_assert!(cache.contains(&key));
        }
        let stats = cache.stats();
        prop_assert_eq!(stats.size, cache.len());
        prop_assert_eq!(stats.capacity, capacity);
        if cache.is_empty() {
            prop_assert_eq!(stats.approx_bytes, 0);
        }
    }
}

// =============================================================================
// Spillover invariants
// =============================================================================

fn row_cells() -> impl Strategy<Value = BTreeMap<u32, CellValue>> {
    let value = prop_oneof![
        3 => "[a-z ]{0,60}".prop_map(CellValue::Text),
        1 => any::<i32>().prop_map(|n| CellValue::Number(f64::from(n))),
        1 => Just(CellValue::Empty),
    ];
    prop::collection::btree_map(1u32..30, value, 0..12)
}

fn widths() -> impl Strategy<Value = BTreeMap<u32, f64>> {
    prop::collection::btree_map(1u32..40, 1.0f64..30.0, 0..20)
}

fn alignments() -> impl Strategy<Value = BTreeMap<u32, HorizontalAlign>> {
    let align = prop_oneof![
        Just(HorizontalAlign::General),
        Just(HorizontalAlign::Left),
        Just(HorizontalAlign::Center),
        Just(HorizontalAlign::Right),
    ];
    prop::collection::btree_map(1u32..30, align, 0..6)
}

proptest! {
    #[test]
    fn spill_ranges_respect_neighbours(
        cells in row_cells(),
        aligns in alignments(),
        column_widths in widths(),
    ) {
        let config = SpilloverConfig::default();
        let ranges = compute_spillovers(7, &cells, &aligns, &column_widths, &config);

        for range in &ranges {
            prop_assert_eq!(range.source_row, 7);
            prop_assert_eq!(range.start_col, range.source_col + 1);
            prop_assert!(range.end_col >= range.start_col);
            prop_assert!(range.end_col - range.source_col <= config.max_spill_columns);

            let source = &cells[&range.source_col];
            prop_assert!(source.as_text().is_some_and(|t| !t.is_empty()));
            prop_assert!(aligns.get(&range.source_col).is_none_or(|a| a.allows_spill()));

            for col in range.start_col..=range.end_col {
                prop_assert!(cells.get(&col).is_none_or(|v| v.is_blank()));
            }
        }

        let sources: BTreeSet<u32> = ranges.iter().map(|r| r.source_col).collect();
        prop_assert_eq!(sources.len(), ranges.len());

        let again = compute_spillovers(7, &cells, &aligns, &column_widths, &config);
        prop_assert_eq!(ranges, again);
    }
}

// =============================================================================
// Viewport tiling
// =============================================================================

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

proptest! {
    #[test]
    fn planned_tiles_cover_the_viewport_once(
        last_row in 1u32..400,
        last_col in 1u32..80,
        start_row in 1u32..400,
        start_col in 1u32..80,
        height in 0u32..120,
        width in 0u32..40,
    ) {
        let mut manager = ViewportManager::new(&sheet(last_row, last_col), ViewportSettings::default());
        let viewport = Viewport::new(start_row, start_row + height, start_col, start_col + width);
        let planned = manager.set_viewport(viewport);

        let mut covered = BTreeSet::new();
        for request in &planned {
            let region = request.region;
            prop_assert!(region.end_row <= last_row && region.end_col <= last_col);
            for row in region.start_row..=region.end_row {
                for col in region.start_col..=region.end_col {
                    prop_assert!(covered.insert((row, col)), "cell planned twice");
                }
            }
        }

        for row in viewport.start_row..=viewport.end_row.min(last_row) {
            for col in viewport.start_col..=viewport.end_col.min(last_col) {
                prop_assert!(covered.contains(&(row, col)));
            }
        }

        // The same viewport again plans nothing new
        prop_assert!(manager.set_viewport(viewport).is_empty());
    }
}
