use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// Content identity of a workbook: xxh64 of the bytes plus the byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkbookKey {
    pub hash: u64,
    pub len: u64,
}

impl WorkbookKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            hash: xxh64(bytes, 0),
            len: bytes.len() as u64,
        }
    }
}

impl std::fmt::Display for WorkbookKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wb-{:016x}-{}", self.hash, self.len)
    }
}

/// Shared handle to the raw bytes of a workbook plus their identity.
///
/// Cloning is cheap; the bytes are reference counted, never copied.
#[derive(Debug, Clone)]
pub struct WorkbookRef {
    pub key: WorkbookKey,
    pub bytes: Arc<[u8]>,
}

impl WorkbookRef {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            key: WorkbookKey::from_bytes(&bytes),
            bytes,
        }
    }
}

/// Visible row/column window, 1-based and inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub start_row: u32,
    pub end_row: u32,
    pub start_col: u32,
    pub end_col: u32,
}

impl Viewport {
    pub fn new(start_row: u32, end_row: u32, start_col: u32, end_col: u32) -> Self {
        Self {
            start_row,
            end_row,
            start_col,
            end_col,
        }
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        row >= self.start_row && row <= self.end_row && col >= self.start_col && col <= self.end_col
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSummary {
    pub id: String,
    pub name: String,
    pub index: usize,
    pub is_hidden: bool,
    pub last_row: u32,
    pub last_col: u32,
    pub default_viewport: Viewport,
}

/// Rectangle of a sheet requested as one unit, 1-based and inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRegion {
    pub sheet_index: usize,
    pub start_row: u32,
    pub end_row: u32,
    pub start_col: u32,
    pub end_col: u32,
}

impl ChunkRegion {
    pub fn new(sheet_index: usize, start_row: u32, end_row: u32, start_col: u32, end_col: u32) -> Self {
        Self {
            sheet_index,
            start_row,
            end_row,
            start_col,
            end_col,
        }
    }

    pub fn width(&self) -> u32 {
        self.end_col.saturating_sub(self.start_col) + 1
    }

    pub fn height(&self) -> u32 {
        self.end_row.saturating_sub(self.start_row) + 1
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        row >= self.start_row && row <= self.end_row && col >= self.start_col && col <= self.end_col
    }

    /// Stable identifier used in `Chunk::chunk_id`
    pub fn chunk_id(&self) -> String {
        format!(
            "s{}:r{}-{}:c{}-{}",
            self.sheet_index, self.start_row, self.end_row, self.start_col, self.end_col
        )
    }
}

/// Normalized cell value; every downstream consumer matches on this one type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Text(String),
    Number(f64),
    Date(NaiveDateTime),
    Empty,
}

impl CellValue {
    /// True when the value renders as nothing
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }
}

/// What kind of source content produced a [`CellValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    String,
    Number,
    Boolean,
    Date,
    Formula,
    RichText,
    Hyperlink,
    Error,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HorizontalAlign {
    General,
    Left,
    Center,
    Right,
    Fill,
    Justify,
    CenterContinuous,
    Distributed,
}

impl HorizontalAlign {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(HorizontalAlign::General),
            "left" => Some(HorizontalAlign::Left),
            "center" => Some(HorizontalAlign::Center),
            "right" => Some(HorizontalAlign::Right),
            "fill" => Some(HorizontalAlign::Fill),
            "justify" => Some(HorizontalAlign::Justify),
            "centerContinuous" => Some(HorizontalAlign::CenterContinuous),
            "distributed" => Some(HorizontalAlign::Distributed),
            _ => None,
        }
    }

    /// Only general and left-aligned text overflows into neighbours
    pub fn allows_spill(self) -> bool {
        matches!(self, HorizontalAlign::General | HorizontalAlign::Left)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FontStyle {
    pub bold: bool,
    pub size: Option<f64>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillStyle {
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentStyle {
    pub horizontal: Option<HorizontalAlign>,
    pub vertical: Option<String>,
}

/// Lossy projection of a cell's style
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinimalStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font: Option<FontStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<FillStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentStyle>,
}

impl MinimalStyle {
    pub fn is_empty(&self) -> bool {
        self.font.is_none() && self.fill.is_none() && self.alignment.is_none()
    }

    pub fn horizontal(&self) -> Option<HorizontalAlign> {
        self.alignment.as_ref().and_then(|a| a.horizontal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub row: u32,
    pub col: u32,
    pub value: CellValue,
    #[serde(rename = "type")]
    pub kind: CellKind,
    /// Horizontal alignment other than general; present with or without styles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align: Option<HorizontalAlign>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<MinimalStyle>,
}

/// Response payload of one processed chunk request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub region: ChunkRegion,
    pub cells: Vec<CellRecord>,
    pub column_widths: BTreeMap<u32, f64>,
    pub row_heights: BTreeMap<u32, f64>,
    /// Set when memory pressure cut the chunk short
    pub truncated: bool,
    /// First row not covered when `truncated` is set
    pub resume_row: Option<u32>,
}

impl Chunk {
    /// The part of the requested region still owed after a truncation
    pub fn remainder(&self) -> Option<ChunkRegion> {
        let resume = self.resume_row?;
        if !self.truncated || resume > self.region.end_row {
            return None;
        }
        Some(ChunkRegion {
            start_row: resume,
            ..self.region
        })
    }
}

/// Text owned by `(source_row, source_col)` drawn across `start_col..=end_col`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpilloverRange {
    pub source_row: u32,
    pub source_col: u32,
    pub start_col: u32,
    pub end_col: u32,
}
