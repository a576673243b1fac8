#![allow(dead_code)]

use std::time::Duration;

use spreadsheet_worker::memory::ManualProbe;
use spreadsheet_worker::{WorkbookRef, WorkerClient, WorkerConfig};
use tempfile::tempdir;
use umya_spreadsheet::{self, Spreadsheet};

/// Forty-eight characters of left-aligned text
pub const LONG_TEXT: &str = "Quarterly revenue summary for the eastern region";

/// Build a workbook with umya, write it to a scratch directory and hand back
/// its bytes
pub fn workbook_ref<F>(f: F) -> WorkbookRef
where
    F: FnOnce(&mut Spreadsheet),
{
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("fixture.xlsx");
    let mut book = umya_spreadsheet::new_file();
    f(&mut book);
    umya_spreadsheet::writer::xlsx::write(&book, &path).expect("write workbook");
    WorkbookRef::new(std::fs::read(&path).expect("read workbook"))
}

/// `rows` x `cols` grid where every cell holds `R{row}C{col}`
pub fn grid_workbook(rows: u32, cols: u32) -> WorkbookRef {
    workbook_ref(|book| {
        let sheet = book.get_sheet_mut(&0).unwrap();
        for row in 1..=rows {
            for col in 1..=cols {
                sheet
                    .get_cell_mut((col, row))
                    .set_value(format!("R{row}C{col}"));
            }
        }
    })
}

/// A1 holds [`LONG_TEXT`], A..D are ten characters wide and D1 is occupied
pub fn long_text_workbook() -> WorkbookRef {
    workbook_ref(|book| {
        let sheet = book.get_sheet_mut(&0).unwrap();
        sheet.get_cell_mut("A1").set_value_string(LONG_TEXT);
        sheet.get_cell_mut("D1").set_value_string("X");
        for column in ["A", "B", "C", "D"] {
            sheet.get_column_dimension_mut(column).set_width(10.0);
        }
    })
}

pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        request_timeout: Duration::from_secs(10),
        memory_sample_interval: Duration::from_secs(3600),
        ..WorkerConfig::default()
    }
}

/// Worker whose memory reading is whatever the returned probe says
pub fn spawn_client(config: WorkerConfig, memory_mb: f64) -> (WorkerClient, ManualProbe) {
    let probe = ManualProbe::new(memory_mb);
    let handle = probe.clone();
    let client = WorkerClient::spawn_with_probe(config, move || Box::new(handle.clone()))
        .expect("spawn worker");
    (client, probe)
}
