//! Structure-only load.
//!
//! Reads the workbook part, its relationships and the `<dimension>` of each
//! worksheet straight out of the archive. Shared strings, styles and cell
//! values are never touched, so the summary is ready long before a full
//! decode would be.

use crate::error::LoadError;
use crate::model::{SheetSummary, Viewport};
use crate::utils::parse_cell_ref;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::io::{BufReader, Cursor, Read, Seek};
use zip::ZipArchive;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureOptions {
    /// Rows in the default viewport handed to the UI
    pub default_rows: u32,
    /// Columns in the default viewport handed to the UI
    pub default_cols: u32,
}

impl Default for StructureOptions {
    fn default() -> Self {
        Self {
            default_rows: 50,
            default_cols: 20,
        }
    }
}

/// One `<sheet>` entry of the workbook part
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SheetEntry {
    pub sheet_id: String,
    pub name: String,
    pub hidden: bool,
    pub part: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct WorkbookPart {
    pub sheets: Vec<SheetEntry>,
    pub date1904: bool,
}

/// Reject anything that is not an OOXML zip container before parsing
pub fn sniff_format(bytes: &[u8]) -> Result<(), LoadError> {
    if bytes.starts_with(ZIP_MAGIC) {
        return Ok(());
    }
    if bytes.starts_with(OLE_MAGIC) {
        return Err(LoadError::UnsupportedFormat(
            "legacy OLE2 workbook (.xls); only OOXML workbooks are supported".to_string(),
        ));
    }
    if bytes.is_empty() {
        return Err(LoadError::UnsupportedFormat("empty input".to_string()));
    }
    Err(LoadError::UnsupportedFormat(
        "input is not a zip container".to_string(),
    ))
}

/// Produce the sheet summaries for a workbook without decoding its cells.
///
/// Either every sheet is summarized or an error is returned.
pub fn load_structure(bytes: &[u8], options: &StructureOptions) -> Result<Vec<SheetSummary>, LoadError> {
    sniff_format(bytes)?;
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let workbook = read_workbook_part(&mut archive)?;

    let mut summaries = Vec::with_capacity(workbook.sheets.len());
    for (index, entry) in workbook.sheets.into_iter().enumerate() {
        let (last_row, last_col) = read_sheet_bounds(&mut archive, &entry.part)?;
        summaries.push(SheetSummary {
            id: entry.sheet_id,
            name: entry.name,
            index,
            is_hidden: entry.hidden,
            last_row,
            last_col,
            default_viewport: default_viewport(last_row, last_col, options),
        });
    }
    Ok(summaries)
}

pub(crate) fn default_viewport(last_row: u32, last_col: u32, options: &StructureOptions) -> Viewport {
    Viewport {
        start_row: 1,
        end_row: last_row.clamp(1, options.default_rows.max(1)),
        start_col: 1,
        end_col: last_col.clamp(1, options.default_cols.max(1)),
    }
}

/// Read sheet entries and workbook properties, resolving each sheet's part path
pub(crate) fn read_workbook_part<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<WorkbookPart, LoadError> {
    let relationships = read_relationships(archive)?;

    let file = match archive.by_name(WORKBOOK_PART) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(LoadError::MissingPart(WORKBOOK_PART.to_string()));
        }
        Err(err) => return Err(err.into()),
    };

    let mut xml = Reader::from_reader(BufReader::new(file));
    xml.trim_text(true);

    let mut part = WorkbookPart::default();
    let mut buf = Vec::new();
    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e) | Event::Start(ref e)) => match e.local_name().as_ref() {
                b"workbookPr" => {
                    part.date1904 = attr(e, b"date1904")
                        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
                }
                b"sheet" => {
                    // Nameless entries are skipped
                    if let Some(name) = attr(e, b"name").filter(|n| !n.is_empty()) {
                        part.sheets.push(sheet_entry(e, name, part.sheets.len() + 1, &relationships));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(source) => {
                return Err(LoadError::Xml {
                    part: WORKBOOK_PART.to_string(),
                    source,
                });
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(part)
}

fn sheet_entry(
    e: &BytesStart,
    name: String,
    position: usize,
    relationships: &HashMap<String, String>,
) -> SheetEntry {
    let sheet_id = attr(e, b"sheetId").unwrap_or_else(|| position.to_string());
    let hidden =
        attr(e, b"state").is_some_and(|state| state == "hidden" || state == "veryHidden");
    let part = relationship_id(e)
        .and_then(|rid| relationships.get(&rid).cloned())
        .unwrap_or_else(|| format!("xl/worksheets/sheet{position}.xml"));
    SheetEntry {
        sheet_id,
        name,
        hidden,
        part,
    }
}

/// Worksheet relationship ids mapped to archive paths
fn read_relationships<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<HashMap<String, String>, LoadError> {
    let mut worksheets = HashMap::new();
    let file = match archive.by_name(WORKBOOK_RELS_PART) {
        Ok(file) => file,
        // Relationships are optional; sheets fall back to positional paths
        Err(zip::result::ZipError::FileNotFound) => return Ok(worksheets),
        Err(err) => return Err(err.into()),
    };

    let mut xml = Reader::from_reader(BufReader::new(file));
    xml.trim_text(true);
    let mut buf = Vec::new();
    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e) | Event::Start(ref e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let id = attr(e, b"Id").unwrap_or_default();
                let target = attr(e, b"Target").unwrap_or_default();
                let kind = attr(e, b"Type").unwrap_or_default();
                if kind.ends_with("/worksheet") && !id.is_empty() && !target.is_empty() {
                    let path = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{target}"),
                    };
                    worksheets.insert(id, path);
                }
            }
            Ok(Event::Eof) => break,
            Err(source) => {
                return Err(LoadError::Xml {
                    part: WORKBOOK_RELS_PART.to_string(),
                    source,
                });
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(worksheets)
}

/// Last used (row, col) of a worksheet part.
///
/// Uses the `<dimension ref>` when present and otherwise scans the row and
/// cell references. A sheet part missing from the archive counts as empty.
fn read_sheet_bounds<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    part: &str,
) -> Result<(u32, u32), LoadError> {
    let file = match archive.by_name(part) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => {
            tracing::warn!(part, "worksheet part missing; treating sheet as empty");
            return Ok((0, 0));
        }
        Err(err) => return Err(err.into()),
    };

    let mut xml = Reader::from_reader(BufReader::new(file));
    xml.trim_text(true);
    let mut buf = Vec::new();
    let mut max_row = 0u32;
    let mut max_col = 0u32;
    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e) | Event::Start(ref e)) => match e.local_name().as_ref() {
                b"dimension" => {
                    if let Some(bounds) = attr(e, b"ref").as_deref().and_then(parse_dimension) {
                        return Ok(bounds);
                    }
                }
                b"row" => {
                    if let Some(row) = attr(e, b"r").and_then(|r| r.parse::<u32>().ok()) {
                        max_row = max_row.max(row);
                    }
                }
                b"c" => {
                    if let Some((row, col)) = attr(e, b"r").as_deref().and_then(parse_cell_ref) {
                        max_row = max_row.max(row);
                        max_col = max_col.max(col);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(source) => {
                return Err(LoadError::Xml {
                    part: part.to_string(),
                    source,
                });
            }
            _ => {}
        }
        buf.clear();
    }
    Ok((max_row, max_col))
}

/// Parse `A1:D10` (or a single `A1`) into the bottom-right (row, col)
fn parse_dimension(reference: &str) -> Option<(u32, u32)> {
    let end = reference.rsplit(':').next()?;
    parse_cell_ref(end)
}

fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// The namespaced `r:id` attribute of a `<sheet>` element
fn relationship_id(e: &BytesStart) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref().ends_with(b":id"))
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}
