//! Sheet reader contracts, CSV readers and the row decoder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use kef_core::{DecodeError, RawRow, ResponseRecord, Score, HEADER_ROW};
use kef_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kef-adapters";

/// Timestamp layouts seen in form exports, day-first before ISO.
const DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];
const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VocabularyEntry {
    pub phrase: String,
    pub score: Score,
}

/// Finite phrase → score table. Lookups are exact and case-sensitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreVocabulary {
    pub entries: Vec<VocabularyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct VocabularyFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    entries: Vec<VocabularyEntry>,
}

impl Default for ScoreVocabulary {
    fn default() -> Self {
        Self::from_pairs([
            ("not achieved", Score::NotAchieved),
            ("partially achieved", Score::Partial),
            ("achieved", Score::Achieved),
            ("nicht erreicht", Score::NotAchieved),
            ("teilweise erreicht", Score::Partial),
            ("erreicht", Score::Achieved),
        ])
    }
}

impl ScoreVocabulary {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Score)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(phrase, score)| VocabularyEntry {
                    phrase: phrase.to_string(),
                    score,
                })
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: VocabularyFile = serde_yaml::from_str(text).context("parsing vocabulary yaml")?;
        Ok(Self {
            entries: file.entries,
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `None` when the phrase is unknown or maps to conflicting scores.
    pub fn lookup(&self, text: &str) -> Option<Score> {
        let mut found: Option<Score> = None;
        for entry in self.entries.iter().filter(|e| e.phrase == text) {
            match found {
                Some(score) if score != entry.score => return None,
                _ => found = Some(entry.score),
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Zero-based column positions of the fields the decoder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub timestamp: usize,
    pub student: usize,
    pub response: usize,
    pub question_index: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            timestamp: 0,
            student: 1,
            response: 2,
            question_index: 3,
        }
    }
}

fn required<'a>(row: &'a RawRow, index: usize, field: &str) -> Result<&'a str, DecodeError> {
    match row.cell(index).map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(DecodeError::MissingField {
            field: field.to_string(),
        }),
    }
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, DecodeError> {
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(ts);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            if let Some(ts) = date.and_hms_opt(0, 0, 0) {
                return Ok(ts);
            }
        }
    }
    Err(DecodeError::MalformedDate {
        value: value.to_string(),
    })
}

/// Decode one sheet row. Pure: the same row and vocabulary always give the same result.
pub fn decode_row(
    row: &RawRow,
    layout: &ColumnLayout,
    vocabulary: &ScoreVocabulary,
) -> Result<ResponseRecord, DecodeError> {
    let timestamp = required(row, layout.timestamp, "timestamp")?;
    let student = required(row, layout.student, "student")?;
    let response = required(row, layout.response, "response")?;
    let question = required(row, layout.question_index, "question_index")?;

    let recorded_at = parse_timestamp(timestamp)?;
    let question_index = question
        .parse::<u32>()
        .map_err(|_| DecodeError::MalformedQuestionIndex {
            value: question.to_string(),
        })?;
    let score = vocabulary
        .lookup(response)
        .ok_or_else(|| DecodeError::UnknownResponseText {
            text: response.to_string(),
        })?;

    Ok(ResponseRecord {
        student: student.to_string(),
        question_index,
        score,
        recorded_at,
        source_row: row.row_number,
    })
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("sheet unreachable: {0}")]
    Unreachable(String),
    #[error("sheet fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("sheet content malformed: {0}")]
    Malformed(String),
}

impl SheetError {
    /// Client-side timeouts keep their cause; everything else is unreachable.
    pub fn from_fetch(err: FetchError, timeout: Duration) -> Self {
        if err.is_timeout() {
            SheetError::Timeout(timeout)
        } else {
            SheetError::Unreachable(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
        }
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of spreadsheet rows.
///
/// Implementations return an owned snapshot in ascending row order and must
/// surface network trouble as an error, never as an empty result.
#[async_trait]
pub trait SheetReader: Send + Sync {
    async fn fetch_rows_after(
        &self,
        ctx: &FetchContext,
        after: u32,
    ) -> Result<Vec<RawRow>, SheetError>;
}

/// Parse a CSV export into numbered rows matching sheet positions.
///
/// The csv reader drops empty lines, so line positions are used to put them
/// back as blank rows. Line breaks inside quoted cells stay within one row.
pub fn parse_csv_rows(text: &str) -> Result<Vec<RawRow>, SheetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    let mut record = csv::StringRecord::new();
    let mut row_number = 0u32;
    loop {
        let line_before = reader.position().line();
        let more = reader
            .read_record(&mut record)
            .map_err(|err| SheetError::Malformed(err.to_string()))?;
        if !more {
            break;
        }
        let position = reader.position();
        let embedded_breaks = record
            .iter()
            .map(|cell| cell.matches('\n').count() as u64)
            .sum::<u64>();
        let unterminated = position.byte() as usize == text.len() && !text.ends_with('\n');
        let terminator = if unterminated { 0 } else { 1 };
        let skipped_lines =
            (position.line() - line_before).saturating_sub(embedded_breaks + terminator);

        for _ in 0..skipped_lines {
            row_number += 1;
            rows.push(RawRow::new(row_number, Vec::new()));
        }
        row_number += 1;
        rows.push(RawRow::new(row_number, record.iter().map(str::to_string).collect()));
    }
    Ok(rows)
}

/// Keep rows past the cursor, never the header.
pub fn rows_after(rows: Vec<RawRow>, after: u32) -> Vec<RawRow> {
    let floor = after.max(HEADER_ROW);
    rows.into_iter().filter(|r| r.row_number > floor).collect()
}

/// Turn a Google Sheets view/edit link into its CSV export link.
pub fn sheet_url_to_csv_export(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.contains("/export?") || trimmed.contains("output=csv") {
        return trimmed.to_string();
    }
    let Some((_, rest)) = trimmed.split_once("docs.google.com/spreadsheets/d/") else {
        return trimmed.to_string();
    };
    let sheet_id = rest
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    if sheet_id.is_empty() {
        return trimmed.to_string();
    }
    let gid = trimmed
        .split_once("gid=")
        .map(|(_, g)| g.chars().take_while(char::is_ascii_digit).collect::<String>())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| "0".to_string());
    format!("https://docs.google.com/spreadsheets/d/{sheet_id}/export?format=csv&gid={gid}")
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetProbe {
    pub csv_url: String,
    pub total_rows: usize,
    pub sample: Vec<RawRow>,
}

/// Reads a published Google Sheet through its CSV export endpoint.
#[derive(Debug, Clone)]
pub struct CsvHttpSheetReader {
    http: HttpFetcher,
    csv_url: String,
}

impl CsvHttpSheetReader {
    pub fn new(http: HttpFetcher, sheet_url: &str) -> Self {
        Self {
            http,
            csv_url: sheet_url_to_csv_export(sheet_url),
        }
    }

    pub fn csv_url(&self) -> &str {
        &self.csv_url
    }

    async fn fetch_all(&self, ctx: &FetchContext) -> Result<Vec<RawRow>, SheetError> {
        let text = self
            .http
            .fetch_text(ctx.run_id, self.csv_url())
            .await
            .map_err(|err| SheetError::from_fetch(err, self.http.timeout()))?;
        parse_csv_rows(&text)
    }

    /// Fetch once and report size plus the first few rows.
    pub async fn probe(&self, ctx: &FetchContext) -> Result<SheetProbe, SheetError> {
        let rows = self.fetch_all(ctx).await?;
        Ok(SheetProbe {
            csv_url: self.csv_url().to_string(),
            total_rows: rows.len(),
            sample: rows.into_iter().take(3).collect(),
        })
    }
}

#[async_trait]
impl SheetReader for CsvHttpSheetReader {
    async fn fetch_rows_after(
        &self,
        ctx: &FetchContext,
        after: u32,
    ) -> Result<Vec<RawRow>, SheetError> {
        let rows = self.fetch_all(ctx).await?;
        let total = rows.len();
        let rows = rows_after(rows, after);
        debug!(run_id = %ctx.run_id, total, new_rows = rows.len(), after, "fetched sheet export");
        Ok(rows)
    }
}

/// Reads a CSV file on disk; used for manual exports and fixtures.
#[derive(Debug, Clone)]
pub struct CsvFileSheetReader {
    path: PathBuf,
}

impl CsvFileSheetReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SheetReader for CsvFileSheetReader {
    async fn fetch_rows_after(
        &self,
        ctx: &FetchContext,
        after: u32,
    ) -> Result<Vec<RawRow>, SheetError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| SheetError::Unreachable(format!("{}: {err}", self.path.display())))?;
        let rows = rows_after(parse_csv_rows(&text)?, after);
        debug!(run_id = %ctx.run_id, path = %self.path.display(), new_rows = rows.len(), "read sheet file");
        Ok(rows)
    }
}
