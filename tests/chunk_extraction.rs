mod support;

use chrono::NaiveDate;
use spreadsheet_worker::adapter::{DecodedWorkbook, SheetSource};
use spreadsheet_worker::chunk::{ChunkOptions, process_chunk};
use spreadsheet_worker::error::{ErrorCode, LoadError};
use spreadsheet_worker::model::CellKind;
use spreadsheet_worker::structure::StructureOptions;
use spreadsheet_worker::{CellValue, ChunkRegion, WorkbookRef, load_structure};
use support::{grid_workbook, workbook_ref};
use umya_spreadsheet::structs::HorizontalAlignmentValues;

fn mixed_workbook() -> WorkbookRef {
    workbook_ref(|book| {
        let sheet = book.get_sheet_mut(&0).unwrap();
        sheet.get_cell_mut("A1").set_value_string("Region");
        sheet.get_cell_mut("B1").set_value_number(42.5);
        sheet.get_cell_mut("C1").set_value_bool(true);
        {
            let cell = sheet.get_cell_mut("D1");
            cell.set_formula("B1*2");
            cell.set_formula_result_default("85");
        }
        {
            let cell = sheet.get_cell_mut("A2");
            cell.set_value_number(45366);
            cell.get_style_mut()
                .get_number_format_mut()
                .set_format_code("yyyy-mm-dd");
        }
        {
            let cell = sheet.get_cell_mut("B2");
            cell.set_value_string("Total");
            cell.get_style_mut().get_font_mut().set_bold(true);
            cell.get_style_mut()
                .get_alignment_mut()
                .set_horizontal(HorizontalAlignmentValues::Center);
        }
        sheet.get_column_dimension_mut("B").set_width(25.0);
        sheet.get_row_dimension_mut(&2).set_height(30.0);

        book.new_sheet("Archive").unwrap();
    })
}

fn full_region(sheet_index: usize, rows: u32, cols: u32) -> ChunkRegion {
    ChunkRegion::new(sheet_index, 1, rows, 1, cols)
}

#[test]
fn structure_lists_sheets_in_order_with_bounds() {
    let workbook = mixed_workbook();
    let sheets = load_structure(&workbook.bytes, &StructureOptions::default()).unwrap();

    assert_eq!(sheets.len(), 2);
    assert_eq!(sheets[0].name, "Sheet1");
    assert_eq!(sheets[0].index, 0);
    assert_eq!((sheets[0].last_row, sheets[0].last_col), (2, 4));
    assert_eq!(sheets[0].default_viewport.end_row, 2);
    assert_eq!(sheets[0].default_viewport.end_col, 4);
    assert_eq!(sheets[1].name, "Archive");
    assert_eq!(sheets[1].index, 1);
    assert!(!sheets[0].is_hidden);
}

#[test]
fn structure_is_idempotent() {
    let workbook = grid_workbook(3, 3);
    let options = StructureOptions::default();
    let first = load_structure(&workbook.bytes, &options).unwrap();
    let second = load_structure(&workbook.bytes, &options).unwrap();
    assert_eq!(first, second);
}

#[test]
fn default_viewport_is_clamped_to_configured_size() {
    let workbook = grid_workbook(80, 30);
    let options = StructureOptions {
        default_rows: 50,
        default_cols: 20,
    };
    let sheets = load_structure(&workbook.bytes, &options).unwrap();
    let viewport = sheets[0].default_viewport;
    assert_eq!((viewport.start_row, viewport.end_row), (1, 50));
    assert_eq!((viewport.start_col, viewport.end_col), (1, 20));
    assert_eq!((sheets[0].last_row, sheets[0].last_col), (80, 30));
}

#[test]
fn corrupt_bytes_fail_the_whole_load() {
    let mut bytes = grid_workbook(2, 2).bytes.to_vec();
    bytes.truncate(bytes.len() / 2);

    let err = load_structure(&bytes, &StructureOptions::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LoadFailed);
    assert!(!err.code().is_retryable());

    let err = DecodedWorkbook::decode(&WorkbookRef::new(bytes)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LoadFailed);
}

#[test]
fn legacy_binary_format_is_unsupported() {
    let bytes = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
    let err = load_structure(&bytes, &StructureOptions::default()).unwrap_err();
    assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    assert_eq!(err.code(), ErrorCode::UnsupportedFormat);
}

#[test]
fn values_are_normalized_per_kind() {
    let workbook = DecodedWorkbook::decode(&mixed_workbook()).unwrap();
    let sheet = workbook.sheet(0).unwrap();
    let output = process_chunk(&sheet, full_region(0, 2, 4), ChunkOptions::default()).unwrap();
    let chunk = output.chunk;

    let cell = |row: u32, col: u32| {
        chunk
            .cells
            .iter()
            .find(|c| c.row == row && c.col == col)
            .unwrap_or_else(|| panic!("missing cell R{row}C{col}"))
    };

    assert_eq!(cell(1, 1).value, CellValue::Text("Region".into()));
    assert_eq!(cell(1, 1).kind, CellKind::String);
    assert_eq!(cell(1, 2).value, CellValue::Number(42.5));
    assert_eq!(cell(1, 3).value, CellValue::Text("TRUE".into()));
    assert_eq!(cell(1, 3).kind, CellKind::Boolean);

    let formula = cell(1, 4);
    assert_eq!(formula.kind, CellKind::Formula);
    assert!(matches!(
        &formula.value,
        CellValue::Number(n) if (*n - 85.0).abs() < f64::EPSILON
    ) || formula.value == CellValue::Text("85".into()));

    let expected = NaiveDate::from_ymd_opt(2024, 3, 15)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    assert_eq!(cell(2, 1).value, CellValue::Date(expected));
    assert_eq!(cell(2, 1).kind, CellKind::Date);

    // C2 and D2 are empty and never reported
    assert!(chunk.cells.iter().all(|c| !(c.row == 2 && c.col > 2)));
    assert!(chunk.cells.iter().all(|c| c.style.is_none()));
    assert!(!chunk.truncated);
    assert_eq!(chunk.chunk_id, full_region(0, 2, 4).chunk_id());
}

#[test]
fn styles_are_projected_only_when_requested() {
    let workbook = DecodedWorkbook::decode(&mixed_workbook()).unwrap();
    let sheet = workbook.sheet(0).unwrap();
    let options = ChunkOptions {
        extract_styles: true,
        ..ChunkOptions::default()
    };
    let chunk = process_chunk(&sheet, full_region(0, 2, 4), options).unwrap().chunk;

    let total = chunk
        .cells
        .iter()
        .find(|c| c.row == 2 && c.col == 2)
        .expect("B2");
    let style = total.style.as_ref().expect("style");
    assert!(style.font.as_ref().is_some_and(|font| font.bold));
    assert_eq!(
        style.horizontal(),
        Some(spreadsheet_worker::model::HorizontalAlign::Center)
    );
}

#[test]
fn dimensions_are_reported_for_the_region() {
    let workbook = DecodedWorkbook::decode(&mixed_workbook()).unwrap();
    let sheet = workbook.sheet(0).unwrap();
    let chunk = process_chunk(&sheet, full_region(0, 2, 4), ChunkOptions::default())
        .unwrap()
        .chunk;

    assert_eq!(chunk.column_widths.get(&2).copied(), Some(25.0));
    assert_eq!(chunk.row_heights.get(&2).copied(), Some(30.0));
    assert!(!chunk.column_widths.contains_key(&5));
}

#[test]
fn regions_past_the_data_are_empty_not_errors() {
    let workbook = DecodedWorkbook::decode(&grid_workbook(2, 2)).unwrap();
    let sheet = workbook.sheet(0).unwrap();
    assert_eq!(sheet.bounds(), (2, 2));

    let region = ChunkRegion::new(0, 100, 120, 10, 12);
    let output = process_chunk(&sheet, region, ChunkOptions::default()).unwrap();
    assert!(output.chunk.cells.is_empty());
    assert_eq!(output.cells_skipped, 0);
}

#[test]
fn second_sheet_is_addressed_by_index() {
    let workbook = workbook_ref(|book| {
        book.get_sheet_mut(&0)
            .unwrap()
            .get_cell_mut("A1")
            .set_value_string("first");
        book.new_sheet("Second")
            .unwrap()
            .get_cell_mut("B3")
            .set_value_string("second");
    });
    let decoded = DecodedWorkbook::decode(&workbook).unwrap();
    assert_eq!(decoded.sheet_count(), 2);
    assert!(decoded.sheet(2).is_none());

    let sheet = decoded.sheet(1).unwrap();
    assert_eq!(sheet.name(), "Second");
    let chunk = process_chunk(&sheet, full_region(1, 5, 5), ChunkOptions::default())
        .unwrap()
        .chunk;
    assert_eq!(chunk.cells.len(), 1);
    assert_eq!((chunk.cells[0].row, chunk.cells[0].col), (3, 2));
    assert_eq!(chunk.cells[0].value, CellValue::Text("second".into()));
}
