//! Binary parser adapter.
//!
//! Wraps `umya_spreadsheet` so the rest of the crate sees a workbook as a list
//! of [`SheetSource`]s yielding [`RawValue`]s. The decoder is the only place
//! that knows about umya types.

use crate::error::{CellError, LoadError};
use crate::model::{HorizontalAlign, MinimalStyle, WorkbookRef};
use crate::structure::{read_workbook_part, sniff_format};
use crate::styles::{horizontal_alignment, minimal_style};
use crate::values::{RawValue, is_builtin_date_format, is_date_format, serial_to_datetime};
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use umya_spreadsheet::structs::CellRawValue;
use umya_spreadsheet::{Cell, Spreadsheet, Worksheet};
use zip::ZipArchive;

/// A cell as read from the decoder, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCell {
    pub raw: RawValue,
    /// Horizontal alignment other than general, read even without styles
    pub align: Option<HorizontalAlign>,
    pub style: Option<MinimalStyle>,
}

/// Read access to one worksheet
pub trait SheetSource {
    fn name(&self) -> &str;

    /// Last used (row, col)
    fn bounds(&self) -> (u32, u32);

    /// `Ok(None)` for cells with no underlying value
    fn read_cell(&self, row: u32, col: u32, with_style: bool) -> Result<Option<SourceCell>, CellError>;

    /// Width in character units, if the sheet defines one
    fn column_width(&self, col: u32) -> Option<f64>;

    /// Height in points, if the sheet defines one
    fn row_height(&self, row: u32) -> Option<f64>;
}

/// A fully decoded workbook; immutable once built
pub struct DecodedWorkbook {
    spreadsheet: Spreadsheet,
    date1904: bool,
}

impl std::fmt::Debug for DecodedWorkbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedWorkbook")
            .field("sheets", &self.sheet_count())
            .field("date1904", &self.date1904)
            .finish()
    }
}

impl DecodedWorkbook {
    /// Full decode of the workbook bytes
    pub fn decode(workbook: &WorkbookRef) -> Result<Self, LoadError> {
        let bytes: &[u8] = &workbook.bytes;
        sniff_format(bytes)?;

        let date1904 = {
            let mut archive = ZipArchive::new(Cursor::new(bytes))?;
            read_workbook_part(&mut archive)?.date1904
        };

        let spreadsheet = umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes), true)
            .map_err(|err| LoadError::Decode(err.to_string()))?;

        Ok(Self {
            spreadsheet,
            date1904,
        })
    }

    pub fn sheet_count(&self) -> usize {
        self.spreadsheet.get_sheet_collection().len()
    }

    pub fn sheet(&self, index: usize) -> Option<UmyaSheet<'_>> {
        self.spreadsheet
            .get_sheet_collection()
            .get(index)
            .map(|sheet| UmyaSheet {
                sheet,
                date1904: self.date1904,
            })
    }
}

/// [`SheetSource`] over a decoded umya worksheet
pub struct UmyaSheet<'a> {
    sheet: &'a Worksheet,
    date1904: bool,
}

impl SheetSource for UmyaSheet<'_> {
    fn name(&self) -> &str {
        self.sheet.get_name()
    }

    fn bounds(&self) -> (u32, u32) {
        let (max_col, max_row) = self.sheet.get_highest_column_and_row();
        (max_row, max_col)
    }

    fn read_cell(&self, row: u32, col: u32, with_style: bool) -> Result<Option<SourceCell>, CellError> {
        let Some(cell) = self.sheet.get_cell((col, row)) else {
            return Ok(None);
        };
        let date1904 = self.date1904;

        panic::catch_unwind(AssertUnwindSafe(|| {
            let raw = raw_value(cell, date1904);
            if raw.is_null() {
                return None;
            }
            let align = horizontal_alignment(cell.get_style());
            let style = if with_style {
                Some(minimal_style(cell.get_style())).filter(|s| !s.is_empty())
            } else {
                None
            };
            Some(SourceCell { raw, align, style })
        }))
        .map_err(|payload| CellError::DecoderPanic {
            row,
            col,
            message: panic_message(payload.as_ref()),
        })
    }

    fn column_width(&self, col: u32) -> Option<f64> {
        self.sheet
            .get_column_dimension_by_number(&col)
            .map(|column| *column.get_width())
            .filter(|width| *width > 0.0)
    }

    fn row_height(&self, row: u32) -> Option<f64> {
        self.sheet
            .get_row_dimension(&row)
            .map(|dimension| *dimension.get_height())
            .filter(|height| *height > 0.0)
    }
}

/// Describe a umya cell as a [`RawValue`]
fn raw_value(cell: &Cell, date1904: bool) -> RawValue {
    let value = match cell.get_cell_value().get_raw_value() {
        CellRawValue::Empty => RawValue::Null,
        CellRawValue::String(text) => RawValue::Text(text.to_string()),
        CellRawValue::Numeric(number) => numeric_value(cell, *number, date1904),
        CellRawValue::Bool(flag) => RawValue::Boolean(*flag),
        CellRawValue::RichText(rich) => RawValue::RichText(
            rich.get_rich_text_elements()
                .iter()
                .map(|element| element.get_text().to_string())
                .collect(),
        ),
        CellRawValue::Error(_) => RawValue::Error(cell.get_value().to_string()),
        #[allow(unreachable_patterns)]
        _ => RawValue::Text(cell.get_value().to_string()),
    };

    if cell.is_formula() {
        return match value {
            RawValue::Null => RawValue::Formula(None),
            cached => RawValue::Formula(Some(Box::new(cached))),
        };
    }

    match (cell.get_hyperlink(), value) {
        (Some(link), RawValue::Text(text)) => RawValue::Hyperlink {
            text,
            target: Some(link.get_url().to_string()).filter(|url| !url.is_empty()),
        },
        (_, value) => value,
    }
}

fn numeric_value(cell: &Cell, number: f64, date1904: bool) -> RawValue {
    let is_date = cell
        .get_style()
        .get_number_format()
        .is_some_and(|format| {
            is_builtin_date_format(*format.get_number_format_id())
                || is_date_format(format.get_format_code())
        });
    if is_date {
        RawValue::Date(serial_to_datetime(number, date1904))
    } else {
        RawValue::Number(number)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
