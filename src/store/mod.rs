use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::config::StoreSettings;

pub mod sheets;
pub mod workbook;

/// Column order of every appended row. The target table's header row matches it.
pub const RATING_COLUMNS: [&str; 7] = [
    "timestamp",
    "user_id",
    "participant_id",
    "post_id",
    "rank",
    "rating",
    "ai_insight_clicked",
];

/// A scalar cell written to the store.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Empty,
}

impl CellValue {
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Text(text) => Value::String(text.clone()),
            CellValue::Integer(value) => Value::from(*value),
            CellValue::Float(value) => Value::from(*value),
            CellValue::Bool(value) => Value::Bool(*value),
            CellValue::Empty => Value::String(String::new()),
        }
    }
}

pub type SheetRow = Vec<CellValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store credentials rejected: {0}")]
    Auth(String),
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store responded with {status}: {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("spreadsheet `{0}` not found or not shared with the service account")]
    SpreadsheetNotFound(String),
    #[error("workbook error: {0}")]
    Workbook(String),
    #[error("workbook io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store misconfigured: {0}")]
    Config(String),
}

/// Append-only table the collected ratings are written to.
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Human readable target, used in logs.
    fn describe(&self) -> String;

    /// Append `rows` after the existing rows in one operation, never overwriting.
    async fn append_rows(&self, rows: &[SheetRow]) -> Result<(), StoreError>;
}

pub fn build_store(settings: &StoreSettings) -> Result<Arc<dyn RatingStore>> {
    let store: Arc<dyn RatingStore> = match settings {
        StoreSettings::GoogleSheets(sheets) => Arc::new(sheets::SheetsStore::from_settings(sheets)?),
        StoreSettings::Workbook { path } => Arc::new(workbook::WorkbookStore::new(path)),
    };
    Ok(store)
}
