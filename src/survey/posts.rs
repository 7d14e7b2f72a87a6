use std::{
    cmp::Ordering,
    collections::HashSet,
    path::{Path, PathBuf},
};

use calamine::{DataType, Reader, open_workbook_auto};
use csv::ReaderBuilder;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    survey::insight::{InsightEntry, parse_insight},
    utils::html::escape_html,
};

const REQUIRED_COLUMNS: [&str; 8] = [
    "post_id",
    "username",
    "text",
    "likes",
    "retweets",
    "followers",
    "following",
    "model_score",
];
const INSIGHT_COLUMN: &str = "ai_insight";

#[derive(Debug, Error)]
pub enum PostLoadError {
    #[error("failed to open post source {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error("post source {path} has no worksheet")]
    NoWorksheet { path: PathBuf },
    #[error("post source is missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("row {row}: {message}")]
    Malformed { row: usize, message: String },
    #[error("row {row}: duplicate post_id `{post_id}`")]
    DuplicatePostId { row: usize, post_id: String },
    #[error("post source contains no posts")]
    Empty,
}

/// One row as read from the post source, before ordering.
#[derive(Clone, Debug, PartialEq)]
pub struct PostRecord {
    /// Row number in the source file, header being row 1.
    pub row: usize,
    pub post_id: String,
    pub username: String,
    pub text: String,
    pub likes: u64,
    pub retweets: u64,
    pub followers: u64,
    pub following: u64,
    pub model_score: f64,
    pub ai_insight: String,
}

/// A post ready for display, with its rank fixed at load time.
#[derive(Clone, Debug, PartialEq)]
pub struct Post {
    pub rank: usize,
    pub post_id: String,
    pub username: String,
    /// Post text, HTML-escaped with `$` turned into an entity so no renderer treats it as markup.
    pub display_text: String,
    pub likes: u64,
    pub retweets: u64,
    pub followers: u64,
    pub following: u64,
    pub model_score: f64,
    pub insight: Vec<InsightEntry>,
}

/// The ordered post set shared by every session.
#[derive(Clone, Debug, Default)]
pub struct PostSet {
    posts: Vec<Post>,
}

impl PostSet {
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }
}

pub trait PostSource {
    fn describe(&self) -> String;
    fn read_records(&self) -> Result<Vec<PostRecord>, PostLoadError>;
}

/// Read records from `source`, then escape, order and rank them.
pub fn load_posts(source: &dyn PostSource) -> Result<PostSet, PostLoadError> {
    let records = source.read_records()?;
    let set = order_posts(records)?;
    info!(source = %source.describe(), posts = set.len(), "loaded survey posts");
    Ok(set)
}

pub fn order_posts(records: Vec<PostRecord>) -> Result<PostSet, PostLoadError> {
    if records.is_empty() {
        return Err(PostLoadError::Empty);
    }

    let mut seen = HashSet::new();
    for record in &records {
        if !seen.insert(record.post_id.as_str()) {
            return Err(PostLoadError::DuplicatePostId {
                row: record.row,
                post_id: record.post_id.clone(),
            });
        }
    }

    let mut records = records;
    // `sort_by` is stable, so equal scores (0.0 and -0.0 included) keep their
    // source order. Scores are finite, see `cell_number`.
    records.sort_by(|a, b| {
        b.model_score
            .partial_cmp(&a.model_score)
            .unwrap_or(Ordering::Equal)
    });

    let posts = records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| {
            let insight = parse_insight(&record.ai_insight).unwrap_or_else(|err| {
                warn!(post_id = %record.post_id, %err, "unreadable ai_insight, showing none");
                Vec::new()
            });
            Post {
                rank: idx + 1,
                display_text: escape_post_text(&record.text),
                post_id: record.post_id,
                username: record.username,
                likes: record.likes,
                retweets: record.retweets,
                followers: record.followers,
                following: record.following,
                model_score: record.model_score,
                insight,
            }
        })
        .collect();

    Ok(PostSet { posts })
}

pub fn escape_post_text(text: &str) -> String {
    escape_html(text).replace('$', "&#36;")
}

/// Pick the reader for `path` by extension: `.csv` files go through the CSV
/// reader, everything else is opened as a spreadsheet.
pub fn post_source_for(path: &Path) -> Box<dyn PostSource> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        Box::new(CsvPostSource::new(path))
    } else {
        Box::new(WorkbookPostSource::new(path))
    }
}

/// Post source backed by a comma separated file with a header row.
pub struct CsvPostSource {
    path: PathBuf,
}

impl CsvPostSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PostSource for CsvPostSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read_records(&self) -> Result<Vec<PostRecord>, PostLoadError> {
        let unreadable = |err: csv::Error| PostLoadError::Unreadable {
            path: self.path.clone(),
            message: err.to_string(),
        };
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(unreadable)?;

        let header: Vec<DataType> = reader
            .headers()
            .map_err(unreadable)?
            .iter()
            .map(csv_cell)
            .collect();

        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|err| PostLoadError::Malformed {
                row: err.position().map_or(idx + 2, |pos| pos.line() as usize),
                message: err.to_string(),
            })?;
            let row = record.position().map_or(idx + 2, |pos| pos.line() as usize);
            rows.push((row, record.iter().map(csv_cell).collect::<Vec<_>>()));
        }

        records_from_rows(&header, rows)
    }
}

/// CSV fields are untyped; blank ones read like empty spreadsheet cells.
fn csv_cell(field: &str) -> DataType {
    if field.trim().is_empty() {
        DataType::Empty
    } else {
        DataType::String(field.to_string())
    }
}

/// Post source backed by a spreadsheet file (xlsx, xls, xlsb or ods). The first
/// worksheet must start with a header row naming the columns.
pub struct WorkbookPostSource {
    path: PathBuf,
}

impl WorkbookPostSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PostSource for WorkbookPostSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read_records(&self) -> Result<Vec<PostRecord>, PostLoadError> {
        let mut workbook =
            open_workbook_auto(&self.path).map_err(|err| PostLoadError::Unreadable {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| PostLoadError::NoWorksheet {
                path: self.path.clone(),
            })?
            .map_err(|err| PostLoadError::Unreadable {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        let mut rows = range.rows();
        let header = rows.next().ok_or(PostLoadError::Empty)?;
        // Row numbers as a spreadsheet user sees them: header is row 1.
        records_from_rows(header, rows.enumerate().map(|(idx, row)| (idx + 2, row)))
    }
}

struct ColumnMap {
    required: [usize; REQUIRED_COLUMNS.len()],
    insight: Option<usize>,
}

impl ColumnMap {
    fn from_header(header: &[DataType]) -> Result<Self, PostLoadError> {
        let position = |name: &str| {
            header
                .iter()
                .position(|cell| matches!(cell, DataType::String(s) if s.trim() == name))
        };

        let mut required = [0; REQUIRED_COLUMNS.len()];
        for (slot, name) in required.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = position(name).ok_or(PostLoadError::MissingColumn(name))?;
        }

        Ok(Self {
            required,
            insight: position(INSIGHT_COLUMN),
        })
    }
}

/// Validate and convert data rows, each paired with its source row number.
fn records_from_rows<R>(
    header: &[DataType],
    rows: impl IntoIterator<Item = (usize, R)>,
) -> Result<Vec<PostRecord>, PostLoadError>
where
    R: AsRef<[DataType]>,
{
    let columns = ColumnMap::from_header(header)?;

    let mut records = Vec::new();
    for (row_number, row) in rows {
        let row = row.as_ref();
        if row.iter().all(|cell| matches!(cell, DataType::Empty)) {
            continue;
        }

        let cell = |slot: usize| row.get(columns.required[slot]).unwrap_or(&DataType::Empty);
        let malformed = |message: String| PostLoadError::Malformed {
            row: row_number,
            message,
        };

        let post_id = cell_text(cell(0));
        if post_id.is_empty() {
            return Err(malformed("post_id is empty".into()));
        }

        let count = |slot: usize| {
            cell_count(cell(slot)).ok_or_else(|| {
                malformed(format!(
                    "{} must be a non-negative integer",
                    REQUIRED_COLUMNS[slot]
                ))
            })
        };

        let model_score =
            cell_number(cell(7)).ok_or_else(|| malformed("model_score must be numeric".into()))?;

        records.push(PostRecord {
            row: row_number,
            username: cell_text(cell(1)),
            text: cell_text(cell(2)),
            likes: count(3)?,
            retweets: count(4)?,
            followers: count(5)?,
            following: count(6)?,
            model_score,
            ai_insight: columns
                .insight
                .and_then(|col| row.get(col))
                .map(cell_text)
                .unwrap_or_default(),
            post_id,
        });
    }

    Ok(records)
}

fn cell_text(cell: &DataType) -> String {
    match cell {
        DataType::String(s) => s.trim().to_string(),
        DataType::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        DataType::Float(f) => f.to_string(),
        DataType::Int(i) => i.to_string(),
        DataType::Bool(b) => b.to_string(),
        DataType::Empty => String::new(),
        other => other.to_string(),
    }
}

fn cell_number(cell: &DataType) -> Option<f64> {
    let value = match cell {
        DataType::Float(f) => *f,
        DataType::Int(i) => *i as f64,
        DataType::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn cell_count(cell: &DataType) -> Option<u64> {
    match cell {
        DataType::Int(i) => u64::try_from(*i).ok(),
        DataType::Float(f) => whole_count(*f),
        // Exported counts sometimes carry a trailing `.0`.
        DataType::String(s) => {
            let s = s.trim();
            s.parse()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole_count))
        }
        _ => None,
    }
}

fn whole_count(value: f64) -> Option<u64> {
    (value >= 0.0 && value.fract() == 0.0 && value < u64::MAX as f64).then_some(value as u64)
}
