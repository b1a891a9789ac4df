//! Conversation Transcript
//!
//! Every answered question produces one [`TranscriptEntry`]. The controller
//! keeps them in order for the session and hands them to a [`TranscriptSink`]
//! on demand.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

/// One answered question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Bank index of the answered question.
    pub index: usize,
    pub question_text: String,
    pub user_response: String,
    /// The text that bridged to the following question.
    pub transition_text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(
        index: usize,
        question_text: impl Into<String>,
        user_response: impl Into<String>,
        transition_text: impl Into<String>,
    ) -> Self {
        Self {
            index,
            question_text: question_text.into(),
            user_response: user_response.into(),
            transition_text: transition_text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// An external, append-only store for transcript entries.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn append(&self, entry: TranscriptEntry) -> Result<()>;

    /// Persists everything appended so far to `destination`.
    async fn flush(&self, destination: &str) -> bool;
}

/// Buffers entries in memory and writes them as a JSON array on flush.
#[derive(Default)]
pub struct JsonFileTranscriptSink {
    entries: Mutex<Vec<TranscriptEntry>>,
}

impl JsonFileTranscriptSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl TranscriptSink for JsonFileTranscriptSink {
    async fn append(&self, entry: TranscriptEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn flush(&self, destination: &str) -> bool {
        let entries = self.entries.lock().await;
        if entries.is_empty() {
            return false;
        }
        let json = match serde_json::to_string_pretty(&*entries) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize transcript");
                return false;
            }
        };
        match tokio::fs::write(destination, json).await {
            Ok(()) => {
                info!(destination, entries = entries.len(), "Transcript written");
                true
            }
            Err(e) => {
                error!(destination, error = %e, "Failed to write transcript");
                false
            }
        }
    }
}
