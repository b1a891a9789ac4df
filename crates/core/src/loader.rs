//! Question Bank Loading
//!
//! The question bank is authored as a spreadsheet and exported to JSON as an
//! array of row objects. This module turns such an export into a validated
//! [`QuestionBank`]. Loading sits behind a trait so that the flow can run
//! against fixed banks in tests and demos.

use crate::error::LoadError;
use crate::question::QuestionBank;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Column names accepted for the question text, in priority order.
const TEXT_FIELDS: [&str; 2] = ["Final_Question", "question"];
/// Column names accepted for the cluster id, in priority order.
const CLUSTER_FIELDS: [&str; 2] = ["question_id", "cluster_id"];

/// Defines the contract for any source of questions.
#[async_trait]
pub trait QuestionBankLoader: Send + Sync {
    /// Loads the ordered question bank from `source`.
    ///
    /// Fails with [`LoadError`] when the source is unreadable, a row lacks a
    /// required column, or no usable question remains.
    async fn load(&self, source: &str) -> Result<QuestionBank, LoadError>;
}

/// Reads a JSON spreadsheet export from the filesystem.
pub struct JsonQuestionBankLoader;

#[async_trait]
impl QuestionBankLoader for JsonQuestionBankLoader {
    async fn load(&self, source: &str) -> Result<QuestionBank, LoadError> {
        let raw = tokio::fs::read_to_string(source)
            .await
            .map_err(|error| LoadError::Io {
                source_name: source.to_string(),
                error,
            })?;
        let bank = parse_rows(source, &raw)?;
        info!(source, questions = bank.len(), "Question bank loaded");
        Ok(bank)
    }
}

/// Parses the JSON row export into a bank.
///
/// Rows whose text or cluster cell is empty are skipped, mirroring how blank
/// spreadsheet cells are treated. A row that lacks the column entirely is an
/// error.
pub fn parse_rows(source: &str, raw: &str) -> Result<QuestionBank, LoadError> {
    let rows: Vec<Map<String, Value>> =
        serde_json::from_str(raw).map_err(|error| LoadError::Parse {
            source_name: source.to_string(),
            error,
        })?;

    let mut entries = Vec::with_capacity(rows.len());
    for (row_index, row) in rows.iter().enumerate() {
        let text = first_present(row, &TEXT_FIELDS).ok_or(LoadError::MissingField {
            row: row_index,
            field: TEXT_FIELDS[0],
        })?;
        let cluster = first_present(row, &CLUSTER_FIELDS).ok_or(LoadError::MissingField {
            row: row_index,
            field: CLUSTER_FIELDS[0],
        })?;

        let Some(text) = cell_text(text) else {
            debug!(row = row_index, "Skipping row with empty question text");
            continue;
        };
        let Some(cluster_id) = cluster_id(cluster, row_index) else {
            debug!(row = row_index, "Skipping row with empty cluster id");
            continue;
        };
        entries.push((text, cluster_id));
    }

    QuestionBank::new(entries)
}

fn first_present<'a>(row: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| row.get(*key))
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-negative integer ids are taken as-is; anything else non-empty falls
/// back to the row position.
fn cluster_id(value: &Value, row_index: usize) -> Option<i64> {
    let digits = match value {
        Value::Null => return None,
        Value::Number(n) => n.as_u64(),
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    Some(
        digits
            .and_then(|id| i64::try_from(id).ok())
            .unwrap_or(row_index as i64),
    )
}

/// Serves a fixed, in-memory bank regardless of the requested source.
///
/// Useful for development and integration testing without a data file.
pub struct StaticQuestionBankLoader {
    entries: Vec<(String, i64)>,
}

impl StaticQuestionBankLoader {
    pub fn new(entries: Vec<(String, i64)>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl QuestionBankLoader for StaticQuestionBankLoader {
    async fn load(&self, _source: &str) -> Result<QuestionBank, LoadError> {
        QuestionBank::new(self.entries.clone())
    }
}
