use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use calamine::{DataType, Reader, Xlsx};
use rust_xlsxwriter::{Workbook, XlsxError};
use tokio::{sync::Mutex, task};
use tracing::debug;

use crate::store::{CellValue, RATING_COLUMNS, RatingStore, SheetRow, StoreError};

const WORKSHEET_NAME: &str = "Ratings";

/// Local xlsx workbook used as the ratings table.
///
/// Each append rewrites the whole file through a temp file and a rename, so a
/// failed write leaves the previous rows intact. Only single-sheet workbooks
/// holding plain text, number and boolean cells are accepted; anything else is
/// refused untouched rather than rewritten lossily.
pub struct WorkbookStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkbookStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RatingStore for WorkbookStore {
    fn describe(&self) -> String {
        format!("workbook {}", self.path.display())
    }

    async fn append_rows(&self, rows: &[SheetRow]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let rows = rows.to_vec();

        let total = task::spawn_blocking(move || append_blocking(&path, rows))
            .await
            .map_err(|err| StoreError::Workbook(format!("append task failed: {err}")))??;

        debug!(path = %self.path.display(), total_rows = total, "appended rows to workbook");
        Ok(())
    }
}

fn append_blocking(path: &Path, new_rows: Vec<SheetRow>) -> Result<usize, StoreError> {
    let mut rows = if path.exists() {
        read_rows(path)?
    } else {
        Vec::new()
    };

    if rows.is_empty() {
        rows.push(
            RATING_COLUMNS
                .iter()
                .map(|name| CellValue::Text(name.to_string()))
                .collect(),
        );
    }
    rows.extend(new_rows);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("xlsx.tmp");
    write_rows(&staging, &rows).map_err(|err| StoreError::Workbook(err.to_string()))?;
    fs::rename(&staging, path)?;

    Ok(rows.len())
}

fn read_rows(path: &Path) -> Result<Vec<SheetRow>, StoreError> {
    let bytes = fs::read(path)?;
    let mut workbook = Xlsx::new(Cursor::new(bytes))
        .map_err(|err| StoreError::Workbook(format!("cannot open {}: {err}", path.display())))?;
    let sheets = workbook.sheet_names().to_vec();
    if sheets.len() > 1 {
        return Err(StoreError::Workbook(format!(
            "{} has {} worksheets ({}); refusing to rewrite it",
            path.display(),
            sheets.len(),
            sheets.join(", ")
        )));
    }
    let Some(range) = workbook.worksheet_range_at(0) else {
        return Ok(Vec::new());
    };
    let range = range.map_err(|err| StoreError::Workbook(err.to_string()))?;

    let mut rows = Vec::with_capacity(range.height());
    for (row_idx, row) in range.rows().enumerate() {
        let mut cells = Vec::with_capacity(row.len());
        for (col_idx, cell) in row.iter().enumerate() {
            let value = cell_from_data(cell).ok_or_else(|| {
                StoreError::Workbook(format!(
                    "{} row {} column {} holds a {} cell that cannot be rewritten",
                    path.display(),
                    row_idx + 1,
                    col_idx + 1,
                    cell_kind(cell)
                ))
            })?;
            cells.push(value);
        }
        rows.push(cells);
    }
    Ok(rows)
}

/// Cells this store can write back unchanged. Dates, durations and error
/// values carry formatting the rewrite would drop.
fn cell_from_data(cell: &DataType) -> Option<CellValue> {
    let value = match cell {
        DataType::String(s) => CellValue::Text(s.clone()),
        DataType::Int(i) => CellValue::Integer(*i),
        DataType::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => CellValue::Integer(*f as i64),
        DataType::Float(f) => CellValue::Float(*f),
        DataType::Bool(b) => CellValue::Bool(*b),
        DataType::Empty => CellValue::Empty,
        _ => return None,
    };
    Some(value)
}

fn cell_kind(cell: &DataType) -> &'static str {
    match cell {
        DataType::DateTime(_) => "date",
        DataType::Error(_) => "error",
        _ => "formatted",
    }
}

fn write_rows(path: &Path, rows: &[SheetRow]) -> Result<(), XlsxError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(WORKSHEET_NAME)?;

    for (row_idx, row) in rows.iter().enumerate() {
        let row_num = row_idx as u32;
        for (col_idx, cell) in row.iter().enumerate() {
            let col = col_idx as u16;
            match cell {
                CellValue::Text(text) => {
                    worksheet.write_string(row_num, col, text)?;
                }
                CellValue::Integer(value) => {
                    worksheet.write_number(row_num, col, *value as f64)?;
                }
                CellValue::Float(value) => {
                    worksheet.write_number(row_num, col, *value)?;
                }
                CellValue::Bool(value) => {
                    worksheet.write_boolean(row_num, col, *value)?;
                }
                CellValue::Empty => {}
            }
        }
    }

    workbook.save(path)
}
