//! Cell value normalization.
//!
//! The adapter describes what a cell holds as a [`RawValue`]; [`normalize`]
//! folds that into the closed [`CellValue`] set exactly once, at chunk
//! extraction time.

use crate::model::{CellKind, CellValue};
use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Largest serial Excel can display (9999-12-31)
const MAX_DATE_SERIAL: f64 = 2_958_465.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Cell content as the decoder exposes it, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    /// `None` when the serial does not map to a calendar date
    Date(Option<NaiveDateTime>),
    /// Cached result of a formula, if the file carried one
    Formula(Option<Box<RawValue>>),
    /// Runs of a rich text value, in order
    RichText(Vec<String>),
    Hyperlink { text: String, target: Option<String> },
    /// Error literal such as `#DIV/0!`
    Error(String),
}

impl RawValue {
    pub fn kind(&self) -> CellKind {
        match self {
            RawValue::Null => CellKind::Null,
            RawValue::Text(_) => CellKind::String,
            RawValue::Number(_) => CellKind::Number,
            RawValue::Boolean(_) => CellKind::Boolean,
            RawValue::Date(_) => CellKind::Date,
            RawValue::Formula(_) => CellKind::Formula,
            RawValue::RichText(_) => CellKind::RichText,
            RawValue::Hyperlink { .. } => CellKind::Hyperlink,
            RawValue::Error(_) => CellKind::Error,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

/// Fold a raw value into the normalized value set.
///
/// Formula results are taken from the cached value only; a formula whose cached
/// result is missing or not a scalar yields [`CellValue::Empty`].
pub fn normalize(raw: &RawValue) -> CellValue {
    match raw {
        RawValue::Null => CellValue::Empty,
        RawValue::Text(text) => CellValue::Text(text.clone()),
        RawValue::Number(number) => CellValue::Number(*number),
        RawValue::Boolean(flag) => CellValue::Text(if *flag { "TRUE" } else { "FALSE" }.to_string()),
        RawValue::Date(Some(date)) => CellValue::Date(*date),
        RawValue::Date(None) => CellValue::Empty,
        RawValue::Formula(Some(result)) => match result.as_ref() {
            scalar @ (RawValue::Text(_)
            | RawValue::Number(_)
            | RawValue::Boolean(_)
            | RawValue::Date(_)) => normalize(scalar),
            _ => CellValue::Empty,
        },
        RawValue::Formula(None) => CellValue::Empty,
        RawValue::RichText(runs) => CellValue::Text(runs.concat()),
        RawValue::Hyperlink { text, .. } => CellValue::Text(text.clone()),
        RawValue::Error(_) => CellValue::Empty,
    }
}

/// Convert a spreadsheet date serial into a timestamp.
///
/// The 1900 system keeps Excel's phantom 1900-02-29 (serial 60), so serials
/// below 61 are offset by one day.
pub fn serial_to_datetime(serial: f64, date1904: bool) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 || serial > MAX_DATE_SERIAL {
        return None;
    }
    let epoch = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)?
    } else if serial < 61.0 {
        NaiveDate::from_ymd_opt(1899, 12, 31)?
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };
    let millis = (serial * MILLIS_PER_DAY).round() as i64;
    epoch
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(Duration::milliseconds(millis))
}

/// Built-in number format ids that render as dates or times
pub fn is_builtin_date_format(id: u32) -> bool {
    matches!(id, 14..=22 | 45..=47)
}

/// Check if a number format code renders its value as a date or time
pub fn is_date_format(format_code: &str) -> bool {
    let lower = format_code.to_ascii_lowercase();
    if lower.is_empty() || lower == "general" || lower == "@" {
        return false;
    }

    // Only the first (positive) section decides
    let section = lower.split(';').next().unwrap_or("");

    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;
    let mut cleaned = String::with_capacity(section.len());
    for c in section.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            _ if !in_quotes && !in_brackets => cleaned.push(c),
            _ => {}
        }
    }

    // Elapsed-time brackets like [h]:mm are still times
    let elapsed = section.contains("[h") || section.contains("[m") || section.contains("[s");

    elapsed
        || cleaned.contains('y')
        || cleaned.contains('d')
        || cleaned.contains('h')
        || (cleaned.contains('m') && !cleaned.contains('#') && !cleaned.contains('0'))
        || (cleaned.contains('s') && cleaned.contains(':'))
}
