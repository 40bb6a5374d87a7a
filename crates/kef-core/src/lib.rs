//! Core domain model for the KEF assessment importer.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "kef-core";

/// Row 1 of every source sheet holds column headers and is never imported.
pub const HEADER_ROW: u32 = 1;

/// One spreadsheet row as fetched, addressed by its 1-based sheet position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub row_number: u32,
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn new(row_number: u32, cells: Vec<String>) -> Self {
        Self { row_number, cells }
    }

    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(String::as_str)
    }

    /// True when every cell is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }
}

/// Bounded score set an assessment response can decode to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Score {
    NotAchieved,
    Partial,
    Achieved,
    /// Recognised response that deliberately carries no numeric value.
    Unscored,
}

impl Score {
    pub fn value(self) -> Option<f64> {
        match self {
            Score::NotAchieved => Some(0.0),
            Score::Partial => Some(0.5),
            Score::Achieved => Some(1.0),
            Score::Unscored => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Score::NotAchieved => "not_achieved",
            Score::Partial => "partial",
            Score::Achieved => "achieved",
            Score::Unscored => "unscored",
        }
    }
}

/// Idempotency key for response records; replays of the same row collide here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub student: String,
    pub question_index: u32,
    pub source_row: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub student: String,
    pub question_index: u32,
    pub score: Score,
    pub recorded_at: NaiveDateTime,
    pub source_row: u32,
}

impl ResponseRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            student: self.student.clone(),
            question_index: self.question_index,
            source_row: self.source_row,
        }
    }
}

/// Reasons a single row cannot be turned into a [`ResponseRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeError {
    #[error("missing field `{field}`")]
    MissingField { field: String },
    #[error("unrecognised response text `{text}`")]
    UnknownResponseText { text: String },
    #[error("malformed date `{value}`")]
    MalformedDate { value: String },
    #[error("malformed question index `{value}`")]
    MalformedQuestionIndex { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("decode failed: {error}")]
    Decode { error: DecodeError },
    #[error("response store write failed: {message}")]
    Persistence { message: String },
}

impl From<DecodeError> for FailureReason {
    fn from(error: DecodeError) -> Self {
        FailureReason::Decode { error }
    }
}

/// Ledger entry for a row that was seen but could not be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedImport {
    pub row_number: u32,
    pub raw: RawRow,
    pub reason: FailureReason,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// Counts for one completed import cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_cursor: u32,
    pub fetched: usize,
    pub imported: usize,
    pub failed: usize,
    pub skipped: usize,
    pub new_cursor: u32,
}
