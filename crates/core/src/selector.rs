//! AI Question Selection
//!
//! The selector is an oracle over a small, closed candidate set: it is asked
//! which unused question should come next and answers with an index and a
//! rationale. Nothing here validates the index against the conversation; that
//! is the job of [`crate::policy::SelectionPolicy`].

use crate::llm_client::LLMClient;
use crate::prompts::{PromptTemplates, SELECT_NEXT_QUESTION};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// One unused question offered to the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub text: String,
}

impl Candidate {
    /// The `"{index}: {text}"` line shown to the model.
    pub fn render(&self) -> String {
        format!("{}: {}", self.index, self.text)
    }
}

/// What a selector proposes. The index is unchecked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorReply {
    pub index: usize,
    pub rationale: String,
}

/// Defines the contract for picking the next question.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuestionSelector: Send + Sync {
    /// Proposes the next question among `candidates`.
    ///
    /// `previous_question` is empty when no question has been asked yet.
    async fn select(
        &self,
        previous_question: &str,
        user_answer: &str,
        candidates: &[Candidate],
    ) -> Result<SelectorReply>;
}

/// The JSON object the model is instructed to return.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelectionPayload {
    /// The index number of the selected question.
    pub selected_question_index: IndexValue,
    /// Brief explanation of why this question was selected based on the response.
    pub reasoning: String,
}

/// Models return the index either as a number or as a numeric string.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum IndexValue {
    Number(u64),
    Text(String),
}

impl IndexValue {
    fn to_index(&self) -> Result<usize> {
        match self {
            IndexValue::Number(n) => usize::try_from(*n).context("Index does not fit usize"),
            IndexValue::Text(s) => s
                .trim()
                .parse()
                .with_context(|| format!("Index '{s}' is not a number")),
        }
    }
}

/// Extracts a [`SelectorReply`] from raw model output.
///
/// Markdown code fences and text around the JSON object are tolerated.
pub fn parse_selection_reply(raw: &str) -> Result<SelectorReply> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed);

    let start = unfenced.find('{').ok_or_else(|| anyhow!("No JSON object in reply"))?;
    let end = unfenced.rfind('}').ok_or_else(|| anyhow!("Unterminated JSON object in reply"))?;
    if end < start {
        return Err(anyhow!("Malformed JSON object in reply"));
    }

    let payload: SelectionPayload = serde_json::from_str(&unfenced[start..=end])
        .context("Selection reply does not match the expected schema")?;
    Ok(SelectorReply {
        index: payload.selected_question_index.to_index()?,
        rationale: payload.reasoning,
    })
}

/// A `QuestionSelector` backed by a chat completion model.
pub struct LLMQuestionSelector {
    llm: Arc<dyn LLMClient>,
    prompts: Arc<PromptTemplates>,
}

impl LLMQuestionSelector {
    pub fn new(llm: Arc<dyn LLMClient>, prompts: Arc<PromptTemplates>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl QuestionSelector for LLMQuestionSelector {
    async fn select(
        &self,
        previous_question: &str,
        user_answer: &str,
        candidates: &[Candidate],
    ) -> Result<SelectorReply> {
        let schema = serde_json::to_string_pretty(&schemars::schema_for!(SelectionPayload))?;
        let system_prompt = self
            .prompts
            .render(SELECT_NEXT_QUESTION, &[("reply_schema", &schema)])?;

        let available = candidates
            .iter()
            .map(Candidate::render)
            .collect::<Vec<_>>()
            .join("\n");
        let user_message = format!(
            "Previous question: {previous_question}\n\n\
             User's response: {user_answer}\n\n\
             Available questions to choose from:\n{available}\n\n\
             Please select the most appropriate next question based on the user's response."
        );

        let raw = self.llm.complete(system_prompt, user_message).await?;
        debug!(reply = %raw, "Selector replied");
        parse_selection_reply(&raw)
    }
}
