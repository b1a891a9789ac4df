use crate::error::LoadError;
use serde::{Deserialize, Serialize};

/// Marker emitted by the question generation pipeline at the end of its
/// output. It must never reach the user.
pub const TERMINATION_SENTINEL: &str = "TERMINATE";

/// Removes every occurrence of the termination sentinel and trims the result.
pub fn strip_sentinel(text: &str) -> String {
    text.replace(TERMINATION_SENTINEL, "").trim().to_string()
}

/// A single assessable question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRecord {
    /// Position in the bank, stable for the lifetime of the bank.
    pub index: usize,
    pub text: String,
    /// Grouping tag consumed by downstream scoring.
    pub cluster_id: i64,
}

/// The ordered, immutable set of questions a conversation draws from.
///
/// A bank is never empty: construction fails with [`LoadError::Empty`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionBank {
    questions: Vec<QuestionRecord>,
}

impl QuestionBank {
    /// Builds a bank from `(text, cluster_id)` pairs, assigning indices in order.
    ///
    /// Text is cleaned of the termination sentinel; pairs whose text is blank
    /// after cleaning are dropped.
    pub fn new<I, S>(entries: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        let questions: Vec<QuestionRecord> = entries
            .into_iter()
            .map(|(text, cluster_id)| (strip_sentinel(text.as_ref()), cluster_id))
            .filter(|(text, _)| !text.is_empty())
            .enumerate()
            .map(|(index, (text, cluster_id))| QuestionRecord {
                index,
                text,
                cluster_id,
            })
            .collect();

        if questions.is_empty() {
            return Err(LoadError::Empty);
        }
        Ok(Self { questions })
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Always false for a constructed bank; provided for API completeness.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&QuestionRecord> {
        self.questions.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuestionRecord> {
        self.questions.iter()
    }
}
