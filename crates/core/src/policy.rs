//! Next-Question Selection Policy
//!
//! The policy asks the AI selector first and never trusts it: the proposed
//! index must be one of the unused questions. Any failure (call error,
//! timeout, unparsable payload, index outside the unused set) degrades to a
//! uniform random choice among the unused questions, so a valid index is
//! always produced while any question remains.

use crate::outcome::Outcome;
use crate::question::QuestionBank;
use crate::selector::{Candidate, QuestionSelector};
use crate::state::ConversationState;
use rand::seq::IteratorRandom;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why the AI proposal was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The selector answered with an index that is not unused.
    InvalidIndex(usize),
    /// The call failed or its payload could not be parsed.
    CallFailed(String),
    /// The call did not resolve within the configured timeout.
    TimedOut(Duration),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::InvalidIndex(index) => {
                write!(f, "AI selection error: index {index} is not an unused question")
            }
            FallbackReason::CallFailed(message) => write!(f, "API error: {message}"),
            FallbackReason::TimedOut(timeout) => {
                write!(f, "API timeout after {}ms", timeout.as_millis())
            }
        }
    }
}

/// A validated choice of next question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub rationale: String,
}

/// The answer of [`SelectionPolicy::select_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextQuestion {
    /// No unused question remains.
    Finished,
    Selected(Outcome<Selection>),
}

/// Chooses the next question, AI first with a random fallback.
#[derive(Clone)]
pub struct SelectionPolicy {
    selector: Arc<dyn QuestionSelector>,
    timeout: Duration,
}

impl SelectionPolicy {
    pub fn new(selector: Arc<dyn QuestionSelector>, timeout: Duration) -> Self {
        Self { selector, timeout }
    }

    /// Selects the next question for `state`.
    ///
    /// Never fails: returns [`NextQuestion::Finished`] only when the unused set
    /// is empty, and otherwise an index that is a member of it.
    pub async fn select_next(
        &self,
        state: &ConversationState,
        bank: &QuestionBank,
        previous_question: &str,
        user_answer: &str,
    ) -> NextQuestion {
        if state.unused().is_empty() {
            return NextQuestion::Finished;
        }

        let candidates: Vec<Candidate> = state
            .unused()
            .iter()
            .filter_map(|&index| bank.get(index))
            .map(|q| Candidate {
                index: q.index,
                text: q.text.clone(),
            })
            .collect();

        let attempt = tokio::time::timeout(
            self.timeout,
            self.selector
                .select(previous_question, user_answer, &candidates),
        )
        .await;

        let reason = match attempt {
            Ok(Ok(reply)) if state.unused().contains(&reply.index) => {
                debug!(index = reply.index, rationale = %reply.rationale, "AI selected next question");
                return NextQuestion::Selected(Outcome::Success(Selection {
                    index: reply.index,
                    rationale: reply.rationale,
                }));
            }
            Ok(Ok(reply)) => FallbackReason::InvalidIndex(reply.index),
            Ok(Err(e)) => FallbackReason::CallFailed(format!("{e:#}")),
            Err(_) => FallbackReason::TimedOut(self.timeout),
        };

        warn!(%reason, "AI question selection failed; choosing at random");
        let fallback = random_unused(state);
        match fallback {
            Some(index) => NextQuestion::Selected(Outcome::degraded(
                Selection {
                    index,
                    rationale: format!("Fallback selection due to {reason}"),
                },
                reason.to_string(),
            )),
            None => NextQuestion::Finished,
        }
    }
}

/// A uniformly random member of the unused set.
pub fn random_unused(state: &ConversationState) -> Option<usize> {
    state.unused().iter().copied().choose(&mut rand::rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{MockQuestionSelector, SelectorReply};
    use anyhow::anyhow;

    fn bank(n: usize) -> QuestionBank {
        QuestionBank::new((0..n).map(|i| (format!("Question {i}?"), i as i64))).unwrap()
    }

    fn policy(selector: MockQuestionSelector) -> SelectionPolicy {
        SelectionPolicy::new(Arc::new(selector), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_finished_when_nothing_unused() {
        let mut selector = MockQuestionSelector::new();
        selector.expect_select().never();
        let state = ConversationState::restore([0, 1], None, 2).unwrap();

        let next = policy(selector).select_next(&state, &bank(2), "", "hi").await;
        assert_eq!(next, NextQuestion::Finished);
    }

    #[tokio::test]
    async fn test_valid_ai_choice_is_used() {
        let mut selector = MockQuestionSelector::new();
        selector
            .expect_select()
            .withf(|previous, answer, candidates| {
                previous == "Question 0?"
                    && answer == "an answer"
                    && candidates.iter().map(|c| c.index).collect::<Vec<_>>() == vec![1, 2]
            })
            .returning(|_, _, _| {
                Ok(SelectorReply {
                    index: 2,
                    rationale: "deeper".into(),
                })
            });
        let state = ConversationState::restore([0], None, 3).unwrap();

        let next = policy(selector)
            .select_next(&state, &bank(3), "Question 0?", "an answer")
            .await;
        assert_eq!(
            next,
            NextQuestion::Selected(Outcome::Success(Selection {
                index: 2,
                rationale: "deeper".into()
            }))
        );
    }

    #[tokio::test]
    async fn test_used_index_from_ai_falls_back() {
        let mut selector = MockQuestionSelector::new();
        selector.expect_select().returning(|_, _, _| {
            Ok(SelectorReply {
                index: 0,
                rationale: "repeat".into(),
            })
        });
        let state = ConversationState::restore([0], None, 3).unwrap();

        let NextQuestion::Selected(outcome) =
            policy(selector).select_next(&state, &bank(3), "", "x").await
        else {
            panic!("expected a selection");
        };
        assert!(outcome.is_degraded());
        assert!(outcome.reason().unwrap().contains("index 0"));
        assert!([1, 2].contains(&outcome.value().index));
    }

    #[tokio::test]
    async fn test_out_of_range_index_falls_back() {
        let mut selector = MockQuestionSelector::new();
        selector.expect_select().returning(|_, _, _| {
            Ok(SelectorReply {
                index: 99,
                rationale: String::new(),
            })
        });
        let state = ConversationState::initialize(2);

        let NextQuestion::Selected(outcome) =
            policy(selector).select_next(&state, &bank(2), "", "x").await
        else {
            panic!("expected a selection");
        };
        assert!(outcome.is_degraded());
        assert!(outcome.value().index < 2);
    }

    #[tokio::test]
    async fn test_call_error_falls_back() {
        let mut selector = MockQuestionSelector::new();
        selector
            .expect_select()
            .returning(|_, _, _| Err(anyhow!("503 Service Unavailable")));
        let state = ConversationState::restore([1], None, 2).unwrap();

        let NextQuestion::Selected(outcome) =
            policy(selector).select_next(&state, &bank(2), "", "x").await
        else {
            panic!("expected a selection");
        };
        assert_eq!(outcome.value().index, 0);
        assert!(outcome.reason().unwrap().starts_with("API error"));
        assert!(outcome.value().rationale.starts_with("Fallback selection due to"));
    }

    /// A selector that never answers.
    struct StalledSelector;

    #[async_trait::async_trait]
    impl QuestionSelector for StalledSelector {
        async fn select(&self, _: &str, _: &str, _: &[Candidate]) -> anyhow::Result<SelectorReply> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back() {
        let policy = SelectionPolicy::new(Arc::new(StalledSelector), Duration::from_secs(10));
        let state = ConversationState::initialize(3);

        let NextQuestion::Selected(outcome) = policy.select_next(&state, &bank(3), "", "x").await
        else {
            panic!("expected a selection");
        };
        assert_eq!(
            outcome.reason(),
            Some(FallbackReason::TimedOut(Duration::from_secs(10)).to_string().as_str())
        );
    }

    #[test]
    fn test_random_unused_only_returns_unused() {
        let state = ConversationState::restore([0, 2, 3], None, 5).unwrap();
        for _ in 0..20 {
            assert!([1, 4].contains(&random_unused(&state).unwrap()));
        }
        let done = ConversationState::restore([0], None, 1).unwrap();
        assert_eq!(random_unused(&done), None);
    }
}
