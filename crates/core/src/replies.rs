//! Conversational Replies
//!
//! Transition and closing text come from a language model when it is
//! available and from fixed sentences otherwise. The traits here are the AI
//! side of that split; the canned side lives in [`canned_transition`] and
//! [`canned_closing`].

use crate::llm_client::LLMClient;
use crate::prompts::{CLOSING, PromptTemplates, TRANSITION};
use crate::question::strip_sentinel;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::sync::Arc;

/// Bridges used when the AI transition fails and another question follows.
pub const BRIDGING_FALLBACKS: [&str; 3] = [
    "Thank you for sharing that insight. Let me ask you about another situation.",
    "I appreciate your perspective on that. Here's another question I'm curious about.",
    "That's helpful to understand. Let me explore another dimension with you.",
];

/// Acknowledgements used when the AI transition fails and nothing follows.
pub const ACKNOWLEDGEMENT_FALLBACKS: [&str; 3] = [
    "Thank you for sharing that with me.",
    "I appreciate your thoughtful response.",
    "That gives me good insight into your approach.",
];

pub const CLOSING_ALL_ANSWERED: &str = "Thank you so much for taking the time to answer all the questions! Your thoughtful responses provide valuable insights into your personality and work style. I really appreciate your participation and openness throughout our conversation.";

pub const CLOSING_PARTIAL: &str = "Thank you for participating in our conversation! You've shared valuable insights through your responses. I appreciate your time and thoughtfulness.";

/// Picks a canned transition at random.
pub fn canned_transition(has_next_question: bool) -> &'static str {
    let pool = if has_next_question {
        &BRIDGING_FALLBACKS
    } else {
        &ACKNOWLEDGEMENT_FALLBACKS
    };
    pool.choose(&mut rand::rng()).copied().unwrap_or(pool[0])
}

/// The canned closing for a session that answered `used` of `total` questions.
pub fn canned_closing(used: usize, total: usize) -> &'static str {
    if used >= total {
        CLOSING_ALL_ANSWERED
    } else {
        CLOSING_PARTIAL
    }
}

/// Generates the short bridge spoken between two questions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransitionWriter: Send + Sync {
    /// `next_question` is `None` when the reply only acknowledges the answer.
    async fn generate(&self, user_answer: &str, next_question: Option<String>) -> Result<String>;
}

/// Generates the message that ends a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClosingWriter: Send + Sync {
    async fn generate(&self, used_count: usize, total_count: usize) -> Result<String>;
}

/// Rejects blank model output so the caller falls back to canned text.
fn clean_reply(raw: &str) -> Result<String> {
    let cleaned = strip_sentinel(raw);
    if cleaned.is_empty() {
        return Err(anyhow!("LLM returned an empty reply"));
    }
    Ok(cleaned)
}

/// A `TransitionWriter` backed by a chat completion model.
pub struct LLMTransitionWriter {
    llm: Arc<dyn LLMClient>,
    prompts: Arc<PromptTemplates>,
}

impl LLMTransitionWriter {
    pub fn new(llm: Arc<dyn LLMClient>, prompts: Arc<PromptTemplates>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl TransitionWriter for LLMTransitionWriter {
    async fn generate(&self, user_answer: &str, next_question: Option<String>) -> Result<String> {
        let (prompt_type, context) = match &next_question {
            Some(question) => (
                "transition to next question",
                format!("The next question is: {question}"),
            ),
            None => (
                "acknowledgment",
                "This is an acknowledgment without a follow-up question.".to_string(),
            ),
        };
        let system_prompt = self.prompts.render(
            TRANSITION,
            &[("prompt_type", prompt_type), ("context", &context)],
        )?;
        let user_message =
            format!("User just responded: {user_answer}\n\nGenerate an appropriate {prompt_type}.");

        clean_reply(&self.llm.complete(system_prompt, user_message).await?)
    }
}

/// A `ClosingWriter` backed by a chat completion model.
pub struct LLMClosingWriter {
    llm: Arc<dyn LLMClient>,
    prompts: Arc<PromptTemplates>,
}

impl LLMClosingWriter {
    pub fn new(llm: Arc<dyn LLMClient>, prompts: Arc<PromptTemplates>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl ClosingWriter for LLMClosingWriter {
    async fn generate(&self, used_count: usize, total_count: usize) -> Result<String> {
        let system_prompt = self.prompts.render(CLOSING, &[])?;
        let user_message = format!(
            "Generate a closing message for someone who just completed {used_count} out of \
             {total_count} personality assessment questions. They provided thoughtful responses \
             throughout the conversation."
        );
        clean_reply(&self.llm.complete(system_prompt, user_message).await?)
    }
}
