//! Question Flow Controller
//!
//! The controller drives one assessment conversation through
//! `NotStarted -> AwaitingReadiness -> InProgress -> Finished`.
//!
//! It owns the session's [`ConversationState`] and transcript, shares an
//! immutable [`QuestionBank`], and reaches the language model only through the
//! capabilities in [`FlowServices`]. Capability failures never abort a turn:
//! they degrade to random selection or canned text. Only contract violations
//! are returned as [`FlowError`].
//!
//! Each step that awaits an external call works on a copy of the state and
//! commits it after every call has resolved, so a step cancelled mid-call
//! leaves the controller exactly as it was.

use crate::error::FlowError;
use crate::llm_client::LLMClient;
use crate::outcome::Outcome;
use crate::policy::{NextQuestion, Selection, SelectionPolicy, random_unused};
use crate::prompts::PromptTemplates;
use crate::question::QuestionBank;
use crate::replies::{
    ClosingWriter, LLMClosingWriter, LLMTransitionWriter, TransitionWriter, canned_closing,
    canned_transition,
};
use crate::selector::{LLMQuestionSelector, QuestionSelector};
use crate::state::{ConversationState, Progress};
use crate::transcript::{TranscriptEntry, TranscriptSink};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const GREETING: &str = "Hello! I'd like to ask you some questions to better understand your personality and work style. Are you ready to begin (yes/no)?";
pub const CLARIFY_MESSAGE: &str = "I didn't quite catch that. Could you please respond with 'yes' if you're ready to begin, or 'no' if you'd prefer to stop here?";
pub const DECLINE_MESSAGE: &str =
    "No problem! Feel free to come back when you're ready. Have a great day!";
pub const NO_QUESTIONS_MESSAGE: &str = "No questions available.";

const AFFIRMATIVE: [&str; 10] = [
    "yes", "y", "yeah", "yep", "sure", "ok", "okay", "ready", "let's go", "let's start",
];
const NEGATIVE: [&str; 6] = ["no", "n", "nope", "not ready", "maybe later", "not now"];

/// Default bound on every external capability call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    NotStarted,
    AwaitingReadiness,
    InProgress,
    Finished,
}

/// How a reply to the greeting reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessVerdict {
    Affirmative,
    Negative,
    Unclear,
}

fn tokenize(reply: &str) -> Vec<String> {
    reply
        .to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let words: Vec<&str> = phrase.split_whitespace().collect();
    tokens
        .windows(words.len())
        .any(|window| window.iter().zip(&words).all(|(t, w)| t == w))
}

/// Matches a reply against the readiness vocabularies on word boundaries.
///
/// Multi-word phrases are checked first, negative before affirmative, so that
/// "not ready" declines even though it contains "ready". Single words follow,
/// affirmative first.
pub fn classify_reply(reply: &str) -> ReadinessVerdict {
    let tokens = tokenize(reply);
    let matches = |vocab: &[&str], phrases: bool| {
        vocab
            .iter()
            .filter(|entry| entry.contains(' ') == phrases)
            .any(|entry| contains_phrase(&tokens, entry))
    };

    if matches(&NEGATIVE, true) {
        ReadinessVerdict::Negative
    } else if matches(&AFFIRMATIVE, true) || matches(&AFFIRMATIVE, false) {
        ReadinessVerdict::Affirmative
    } else if matches(&NEGATIVE, false) {
        ReadinessVerdict::Negative
    } else {
        ReadinessVerdict::Unclear
    }
}

/// The external capabilities a controller calls, shared across sessions.
#[derive(Clone)]
pub struct FlowServices {
    pub policy: SelectionPolicy,
    pub transition: Arc<dyn TransitionWriter>,
    pub closer: Arc<dyn ClosingWriter>,
    pub call_timeout: Duration,
}

impl FlowServices {
    pub fn new(
        selector: Arc<dyn QuestionSelector>,
        transition: Arc<dyn TransitionWriter>,
        closer: Arc<dyn ClosingWriter>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            policy: SelectionPolicy::new(selector, call_timeout),
            transition,
            closer,
            call_timeout,
        }
    }

    /// Wires every capability to the same language model.
    pub fn from_llm(
        llm: Arc<dyn LLMClient>,
        prompts: Arc<PromptTemplates>,
        call_timeout: Duration,
    ) -> Self {
        Self::new(
            Arc::new(LLMQuestionSelector::new(llm.clone(), prompts.clone())),
            Arc::new(LLMTransitionWriter::new(llm.clone(), prompts.clone())),
            Arc::new(LLMClosingWriter::new(llm, prompts)),
            call_timeout,
        )
    }
}

/// The result of [`FlowController::detect_readiness`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Readiness {
    Start {
        question: String,
        index: usize,
        cluster_id: i64,
    },
    End {
        message: String,
    },
    Clarify {
        message: String,
    },
}

/// A turn that moved on to another question.
#[derive(Debug, Clone, PartialEq)]
pub struct NextTurn {
    pub question: String,
    pub index: usize,
    pub cluster_id: i64,
    pub progress: Progress,
    pub transition: Outcome<String>,
    pub selection: Outcome<Selection>,
}

/// Statistics reported when the last question has been answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub used: usize,
    pub total: usize,
    /// Cluster of the question answered on the final turn.
    pub last_cluster_id: Option<i64>,
}

/// The result of [`FlowController::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Next(NextTurn),
    Completed(Completion),
}

/// Progress as reported to request/response callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnProgress {
    pub used: usize,
    pub total: usize,
    pub used_indices: Vec<usize>,
}

/// The structured record produced by every turn.
///
/// `progress.used_indices` and `question_index` are exactly what a stateless
/// caller persists and passes back on the next turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutput {
    pub message: String,
    pub progress: TurnProgress,
    pub cluster_id: Option<i64>,
    pub question_index: Option<usize>,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_answer_cluster_id: Option<i64>,
}

/// Runs `call` under `timeout`, substituting `fallback` on error or timeout.
async fn with_fallback<F, Fb>(
    timeout: Duration,
    what: &'static str,
    call: F,
    fallback: Fb,
) -> Outcome<String>
where
    F: Future<Output = anyhow::Result<String>>,
    Fb: FnOnce() -> String,
{
    let reason = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(text)) => return Outcome::Success(text),
        Ok(Err(e)) => format!("{e:#}"),
        Err(_) => format!("timed out after {}ms", timeout.as_millis()),
    };
    warn!(capability = what, %reason, "Using canned text");
    Outcome::degraded(fallback(), reason)
}

/// Drives one conversation over a shared question bank.
pub struct FlowController {
    bank: Arc<QuestionBank>,
    services: FlowServices,
    state: ConversationState,
    phase: FlowPhase,
    transcript: Vec<TranscriptEntry>,
    /// Number of transcript entries already handed to a sink.
    flushed: usize,
}

impl FlowController {
    /// A fresh session in [`FlowPhase::NotStarted`].
    pub fn new(bank: Arc<QuestionBank>, services: FlowServices) -> Self {
        let state = ConversationState::initialize(bank.len());
        Self {
            bank,
            services,
            state,
            phase: FlowPhase::NotStarted,
            transcript: Vec::new(),
            flushed: 0,
        }
    }

    /// Rebuilds a session from the values a stateless caller kept from the
    /// previous turn.
    ///
    /// With a current question the session is in progress. Without one it is
    /// finished if nothing is left, and otherwise awaits readiness, so that an
    /// affirmative reply resumes with a random unused question.
    pub fn rehydrate(
        bank: Arc<QuestionBank>,
        services: FlowServices,
        used_indices: impl IntoIterator<Item = usize>,
        current_index: Option<usize>,
    ) -> Result<Self, FlowError> {
        let state = ConversationState::restore(used_indices, current_index, bank.len())?;
        let phase = if state.current().is_some() {
            FlowPhase::InProgress
        } else if state.unused().is_empty() {
            FlowPhase::Finished
        } else {
            FlowPhase::AwaitingReadiness
        };
        debug!(?phase, used = state.used().len(), current = ?state.current(), "Session rehydrated");
        Ok(Self {
            bank,
            services,
            state,
            phase,
            transcript: Vec::new(),
            flushed: 0,
        })
    }

    pub fn phase(&self) -> FlowPhase {
        self.phase
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn bank(&self) -> &QuestionBank {
        &self.bank
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn progress(&self) -> Progress {
        self.state.progress()
    }

    fn require(&self, operation: &'static str, allowed: &[FlowPhase]) -> Result<(), FlowError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(FlowError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    /// Opens the conversation and asks whether the user is ready.
    pub fn greet(&mut self) -> Result<&'static str, FlowError> {
        self.require(
            "greet",
            &[FlowPhase::NotStarted, FlowPhase::AwaitingReadiness],
        )?;
        self.phase = FlowPhase::AwaitingReadiness;
        Ok(GREETING)
    }

    /// Interprets the reply to the greeting.
    ///
    /// An unclear reply leaves the session waiting and consumes nothing.
    pub fn detect_readiness(&mut self, reply: &str) -> Result<Readiness, FlowError> {
        self.require("detect_readiness", &[FlowPhase::AwaitingReadiness])?;

        match classify_reply(reply) {
            ReadinessVerdict::Affirmative => {
                let Some(index) = random_unused(&self.state) else {
                    info!("User is ready but no questions remain");
                    self.phase = FlowPhase::Finished;
                    return Ok(Readiness::End {
                        message: NO_QUESTIONS_MESSAGE.to_string(),
                    });
                };
                let question = self
                    .bank
                    .get(index)
                    .cloned()
                    .ok_or(FlowError::InvalidSelection { index })?;
                self.state.set_current(index)?;
                self.state.mark_started();
                self.phase = FlowPhase::InProgress;
                info!(index, "Conversation started");
                Ok(Readiness::Start {
                    question: question.text,
                    index,
                    cluster_id: question.cluster_id,
                })
            }
            ReadinessVerdict::Negative => {
                self.state.mark_ended();
                self.phase = FlowPhase::Finished;
                info!("User declined to start");
                Ok(Readiness::End {
                    message: DECLINE_MESSAGE.to_string(),
                })
            }
            ReadinessVerdict::Unclear => Ok(Readiness::Clarify {
                message: CLARIFY_MESSAGE.to_string(),
            }),
        }
    }

    /// Records the answer to the current question and moves to the next one.
    pub async fn advance(&mut self, user_answer: &str) -> Result<Advance, FlowError> {
        self.require("advance", &[FlowPhase::InProgress])?;

        let mut next_state = self.state.clone();
        let answered = next_state.current().and_then(|i| self.bank.get(i)).cloned();
        let newly_answered = next_state.mark_current_answered();
        if !newly_answered {
            debug!(current = ?next_state.current(), "Current question was already answered");
        }
        let previous_text = answered.as_ref().map(|q| q.text.as_str()).unwrap_or("");

        let next = self
            .services
            .policy
            .select_next(&next_state, &self.bank, previous_text, user_answer)
            .await;

        match next {
            NextQuestion::Finished => {
                let transition = self.transition_text(user_answer, None).await;
                next_state.clear_current();
                let progress = next_state.progress();
                let completion = Completion {
                    used: progress.used,
                    total: progress.total,
                    last_cluster_id: answered.as_ref().map(|q| q.cluster_id),
                };

                self.commit(next_state, FlowPhase::Finished);
                if newly_answered {
                    self.record(answered.as_ref(), user_answer, transition.value());
                }
                info!(used = completion.used, total = completion.total, "All questions answered");
                Ok(Advance::Completed(completion))
            }
            NextQuestion::Selected(selection) => {
                let index = selection.value().index;
                let question = self
                    .bank
                    .get(index)
                    .cloned()
                    .ok_or(FlowError::InvalidSelection { index })?;
                next_state.set_current(index)?;
                let transition = self
                    .transition_text(user_answer, Some(&question.text))
                    .await;
                let progress = next_state.progress();

                self.commit(next_state, FlowPhase::InProgress);
                if newly_answered {
                    self.record(answered.as_ref(), user_answer, transition.value());
                }
                info!(
                    index,
                    degraded = selection.is_degraded(),
                    used = progress.used,
                    "Advanced to next question"
                );
                Ok(Advance::Next(NextTurn {
                    question: question.text,
                    index,
                    cluster_id: question.cluster_id,
                    progress,
                    transition,
                    selection,
                }))
            }
        }
    }

    /// Produces the closing message of a finished session.
    pub async fn close(&mut self) -> Result<Outcome<String>, FlowError> {
        self.require("close", &[FlowPhase::Finished])?;

        let progress = self.state.progress();
        let closer = self.services.closer.clone();
        let message = with_fallback(
            self.services.call_timeout,
            "closing",
            closer.generate(progress.used, progress.total),
            || canned_closing(progress.used, progress.total).to_string(),
        )
        .await;

        self.state.clear_current();
        self.state.mark_ended();
        info!(used = progress.used, total = progress.total, "Conversation closed");
        Ok(message)
    }

    /// Forgets the session, keeping the question bank.
    pub fn reset(&mut self) {
        self.state = ConversationState::initialize(self.bank.len());
        self.phase = FlowPhase::NotStarted;
        self.transcript.clear();
        self.flushed = 0;
        info!("Conversation reset");
    }

    /// Runs one request/response turn for `reply`, whatever the phase calls
    /// for: readiness detection or advancing, closing when the bank runs out.
    pub async fn respond(&mut self, reply: &str) -> Result<TurnOutput, FlowError> {
        match self.phase {
            FlowPhase::AwaitingReadiness => {
                let readiness = self.detect_readiness(reply)?;
                Ok(match readiness {
                    Readiness::Start {
                        question,
                        index,
                        cluster_id,
                    } => {
                        let answered = self.state.used().len();
                        let opening = if answered == 0 {
                            "Great! Let's begin with the first question."
                        } else {
                            "Welcome back! Let's pick up where we left off."
                        };
                        self.turn_output(
                            format!(
                                "{opening}\n\nQuestion {} of {}:\n{question}",
                                answered + 1,
                                self.bank.len()
                            ),
                            Some(cluster_id),
                            Some(index),
                            None,
                        )
                    }
                    Readiness::End { message } => self.turn_output(message, None, None, None),
                    Readiness::Clarify { message } => self.turn_output(message, None, None, None),
                })
            }
            FlowPhase::InProgress => match self.advance(reply).await? {
                Advance::Next(next) => {
                    let message = format!(
                        "{}\n\nQuestion {} of {}:\n{}",
                        next.transition.value(),
                        next.progress.used + 1,
                        next.progress.total,
                        next.question
                    );
                    Ok(self.turn_output(
                        message,
                        Some(next.cluster_id),
                        Some(next.index),
                        None,
                    ))
                }
                Advance::Completed(completion) => {
                    let closing = self.close().await?;
                    Ok(self.turn_output(
                        closing.into_value(),
                        None,
                        None,
                        completion.last_cluster_id,
                    ))
                }
            },
            phase => Err(FlowError::InvalidPhase {
                operation: "respond",
                phase,
            }),
        }
    }

    /// Appends the entries not yet flushed to `sink` and flushes it to
    /// `destination`. Entries count as flushed only once the sink reports
    /// success.
    pub async fn flush_transcript(&mut self, sink: &dyn TranscriptSink, destination: &str) -> bool {
        let pending = &self.transcript[self.flushed..];
        for entry in pending {
            if let Err(e) = sink.append(entry.clone()).await {
                warn!(error = %e, "Failed to append transcript entry");
                return false;
            }
        }
        if !sink.flush(destination).await {
            return false;
        }
        self.flushed = self.transcript.len();
        true
    }

    async fn transition_text(&self, user_answer: &str, next_question: Option<&str>) -> Outcome<String> {
        let has_next = next_question.is_some();
        with_fallback(
            self.services.call_timeout,
            "transition",
            self.services
                .transition
                .generate(user_answer, next_question.map(str::to_string)),
            || canned_transition(has_next).to_string(),
        )
        .await
    }

    fn commit(&mut self, state: ConversationState, phase: FlowPhase) {
        debug_assert!(state.is_consistent());
        self.state = state;
        self.phase = phase;
    }

    fn record(
        &mut self,
        question: Option<&crate::question::QuestionRecord>,
        user_answer: &str,
        transition: &str,
    ) {
        if let Some(question) = question {
            self.transcript.push(TranscriptEntry::new(
                question.index,
                question.text.clone(),
                user_answer,
                transition,
            ));
        }
    }

    fn turn_output(
        &self,
        message: String,
        cluster_id: Option<i64>,
        question_index: Option<usize>,
        last_answer_cluster_id: Option<i64>,
    ) -> TurnOutput {
        TurnOutput {
            message,
            progress: TurnProgress {
                used: self.state.used().len(),
                total: self.bank.len(),
                used_indices: self.state.used().iter().copied().collect(),
            },
            cluster_id,
            question_index,
            finished: self.phase == FlowPhase::Finished,
            last_answer_cluster_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replies::{
        ACKNOWLEDGEMENT_FALLBACKS, BRIDGING_FALLBACKS, CLOSING_ALL_ANSWERED, MockClosingWriter,
        MockTransitionWriter,
    };
    use crate::selector::{MockQuestionSelector, SelectorReply};
    use anyhow::anyhow;
    use std::collections::HashSet;

    fn bank(n: usize) -> Arc<QuestionBank> {
        Arc::new(
            QuestionBank::new((0..n).map(|i| (format!("Question {i}?"), 100 + i as i64))).unwrap(),
        )
    }

    /// Every capability succeeds; the selector picks the first candidate.
    fn cooperative_services() -> FlowServices {
        let mut selector = MockQuestionSelector::new();
        selector.expect_select().returning(|_, _, candidates| {
            Ok(SelectorReply {
                index: candidates[0].index,
                rationale: "first".into(),
            })
        });
        let mut transition = MockTransitionWriter::new();
        transition
            .expect_generate()
            .returning(|_, _| Ok("Nice answer.".to_string()));
        let mut closer = MockClosingWriter::new();
        closer
            .expect_generate()
            .returning(|used, total| Ok(format!("Done {used}/{total}.")));
        FlowServices::new(
            Arc::new(selector),
            Arc::new(transition),
            Arc::new(closer),
            Duration::from_secs(1),
        )
    }

    /// Every capability fails.
    fn failing_services() -> FlowServices {
        let mut selector = MockQuestionSelector::new();
        selector
            .expect_select()
            .returning(|_, _, _| Err(anyhow!("network down")));
        let mut transition = MockTransitionWriter::new();
        transition
            .expect_generate()
            .returning(|_, _| Err(anyhow!("network down")));
        let mut closer = MockClosingWriter::new();
        closer
            .expect_generate()
            .returning(|_, _| Err(anyhow!("network down")));
        FlowServices::new(
            Arc::new(selector),
            Arc::new(transition),
            Arc::new(closer),
            Duration::from_secs(1),
        )
    }

    fn started(bank: Arc<QuestionBank>, services: FlowServices) -> (FlowController, usize) {
        let mut flow = FlowController::new(bank, services);
        flow.greet().unwrap();
        let Readiness::Start { index, .. } = flow.detect_readiness("yes").unwrap() else {
            panic!("expected start");
        };
        (flow, index)
    }

    #[test]
    fn test_classify_reply() {
        use ReadinessVerdict::*;
        for reply in ["yes", "Y", "Sure!", "ok, let's go", "I'm ready", "Let’s start"] {
            assert_eq!(classify_reply(reply), Affirmative, "{reply}");
        }
        for reply in ["no", "Nope.", "not ready yet", "maybe later", "not now please"] {
            assert_eq!(classify_reply(reply), Negative, "{reply}");
        }
        for reply in ["maybe", "hmm", "", "I don't know", "any"] {
            assert_eq!(classify_reply(reply), Unclear, "{reply}");
        }
    }

    #[test]
    fn test_greet_moves_to_awaiting_readiness() {
        let mut flow = FlowController::new(bank(2), cooperative_services());
        assert_eq!(flow.phase(), FlowPhase::NotStarted);
        assert_eq!(flow.greet().unwrap(), GREETING);
        assert_eq!(flow.phase(), FlowPhase::AwaitingReadiness);
    }

    #[test]
    fn test_unclear_reply_consumes_nothing() {
        let mut flow = FlowController::new(bank(3), cooperative_services());
        flow.greet().unwrap();

        let readiness = flow.detect_readiness("maybe").unwrap();
        assert_eq!(
            readiness,
            Readiness::Clarify {
                message: CLARIFY_MESSAGE.to_string()
            }
        );
        assert_eq!(flow.phase(), FlowPhase::AwaitingReadiness);
        assert_eq!(flow.state().current(), None);
        assert_eq!(flow.state().unused().len(), 3);
    }

    #[test]
    fn test_negative_reply_finishes() {
        let mut flow = FlowController::new(bank(3), cooperative_services());
        flow.greet().unwrap();
        assert_eq!(
            flow.detect_readiness("no thanks").unwrap(),
            Readiness::End {
                message: DECLINE_MESSAGE.to_string()
            }
        );
        assert_eq!(flow.phase(), FlowPhase::Finished);
    }

    #[test]
    fn test_detect_readiness_requires_greeting() {
        let mut flow = FlowController::new(bank(3), cooperative_services());
        assert_eq!(
            flow.detect_readiness("yes"),
            Err(FlowError::InvalidPhase {
                operation: "detect_readiness",
                phase: FlowPhase::NotStarted
            })
        );
    }

    #[test]
    fn test_affirmative_reply_picks_unused_start() {
        let (flow, index) = started(bank(3), cooperative_services());
        assert!(index < 3);
        assert_eq!(flow.phase(), FlowPhase::InProgress);
        assert_eq!(flow.state().current(), Some(index));
        assert!(flow.state().unused().contains(&index));
        assert!(flow.state().started());
    }

    #[tokio::test]
    async fn test_advance_requires_in_progress() {
        let mut flow = FlowController::new(bank(3), cooperative_services());
        let err = flow.advance("answer").await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidPhase { operation: "advance", .. }));
    }

    #[tokio::test]
    async fn test_three_question_scenario() {
        let (mut flow, first) = started(bank(3), cooperative_services());
        let mut seen = HashSet::from([first]);

        for expected_used in 1..3 {
            let Advance::Next(next) = flow.advance("an answer").await.unwrap() else {
                panic!("expected another question");
            };
            assert!(seen.insert(next.index), "question {} repeated", next.index);
            assert_eq!(next.progress.used, expected_used);
            assert_eq!(next.transition, Outcome::Success("Nice answer.".to_string()));
            assert!(!next.selection.is_degraded());
            assert_eq!(next.cluster_id, 100 + next.index as i64);
        }

        let last = flow.state().current().unwrap();
        let Advance::Completed(completion) = flow.advance("final answer").await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(completion.used, 3);
        assert_eq!(completion.total, 3);
        assert_eq!(completion.last_cluster_id, Some(100 + last as i64));
        assert_eq!(flow.phase(), FlowPhase::Finished);
        assert!(flow.state().unused().is_empty());
        assert_eq!(flow.state().used().len(), 3);
        assert_eq!(flow.transcript().len(), 3);
    }

    #[tokio::test]
    async fn test_failing_capabilities_still_cover_every_question() {
        let n = 6;
        let (mut flow, first) = started(bank(n), failing_services());
        let mut seen = vec![first];

        loop {
            match flow.advance("whatever").await.unwrap() {
                Advance::Next(next) => {
                    assert!(next.selection.is_degraded());
                    assert!(next.transition.is_degraded());
                    assert!(BRIDGING_FALLBACKS.contains(&next.transition.value().as_str()));
                    seen.push(next.index);
                }
                Advance::Completed(completion) => {
                    assert_eq!(completion.used, n);
                    break;
                }
            }
            assert!(flow.state().is_consistent());
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
        assert!(ACKNOWLEDGEMENT_FALLBACKS.contains(&flow.transcript()[n - 1].transition_text.as_str()));

        let closing = flow.close().await.unwrap();
        assert!(closing.is_degraded());
        assert_eq!(closing.into_value(), CLOSING_ALL_ANSWERED);
    }

    #[tokio::test]
    async fn test_rehydration_marks_current_and_selects_remaining() {
        let mut flow =
            FlowController::rehydrate(bank(5), cooperative_services(), [0, 3], Some(3)).unwrap();
        assert_eq!(
            flow.state().unused().iter().copied().collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        assert_eq!(flow.phase(), FlowPhase::InProgress);

        let Advance::Next(next) = flow.advance("some answer").await.unwrap() else {
            panic!("expected another question");
        };
        assert!([1, 2, 4].contains(&next.index));
        assert!(flow.state().used().contains(&3));
        assert_eq!(flow.state().used().len(), 2);
    }

    #[test]
    fn test_rehydration_phases() {
        let flow = FlowController::rehydrate(bank(2), cooperative_services(), Vec::<usize>::new(), None).unwrap();
        assert_eq!(flow.phase(), FlowPhase::AwaitingReadiness);

        let flow = FlowController::rehydrate(bank(2), cooperative_services(), [0, 1], None).unwrap();
        assert_eq!(flow.phase(), FlowPhase::Finished);

        let err = FlowController::rehydrate(bank(2), cooperative_services(), [2], None).err();
        assert!(matches!(err, Some(FlowError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_respond_full_stateless_cycle() {
        let bank = bank(2);
        let services = cooperative_services();

        let mut flow = FlowController::rehydrate(bank.clone(), services.clone(), Vec::<usize>::new(), None).unwrap();
        let out = flow.respond("hmm").await.unwrap();
        assert_eq!(out.message, CLARIFY_MESSAGE);
        assert_eq!(out.question_index, None);
        assert!(!out.finished);

        let out = flow.respond("yes").await.unwrap();
        let first = out.question_index.unwrap();
        assert!(out.message.contains("Question 1 of 2:"));
        assert_eq!(out.cluster_id, Some(100 + first as i64));
        assert!(out.progress.used_indices.is_empty());

        let mut flow = FlowController::rehydrate(
            bank.clone(),
            services.clone(),
            out.progress.used_indices.clone(),
            out.question_index,
        )
        .unwrap();
        let out = flow.respond("my first answer").await.unwrap();
        let second = out.question_index.unwrap();
        assert_ne!(first, second);
        assert!(out.message.starts_with("Nice answer.\n\nQuestion 2 of 2:"));
        assert_eq!(out.progress.used_indices, vec![first]);

        let mut flow = FlowController::rehydrate(
            bank,
            services,
            out.progress.used_indices.clone(),
            out.question_index,
        )
        .unwrap();
        let out = flow.respond("my second answer").await.unwrap();
        assert!(out.finished);
        assert_eq!(out.message, "Done 2/2.");
        assert_eq!(out.question_index, None);
        assert_eq!(out.progress.used, 2);
        assert_eq!(out.last_answer_cluster_id, Some(100 + second as i64));

        assert!(matches!(
            flow.respond("more?").await,
            Err(FlowError::InvalidPhase { operation: "respond", .. })
        ));
    }

    #[tokio::test]
    async fn test_turn_output_wire_format() {
        let mut flow = FlowController::rehydrate(bank(2), cooperative_services(), Vec::<usize>::new(), None).unwrap();
        let out = flow.respond("no").await.unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["message"], DECLINE_MESSAGE);
        assert_eq!(json["finished"], true);
        assert_eq!(json["questionIndex"], serde_json::Value::Null);
        assert_eq!(json["progress"]["usedIndices"], serde_json::json!([]));
        assert!(json.get("lastAnswerClusterId").is_none());
    }

    #[test]
    fn test_reset_reopens_finished_session() {
        let mut flow = FlowController::rehydrate(bank(1), cooperative_services(), [0], None).unwrap();
        assert_eq!(flow.phase(), FlowPhase::Finished);
        flow.reset();
        flow.greet().unwrap();
        assert!(matches!(flow.detect_readiness("yes"), Ok(Readiness::Start { index: 0, .. })));
    }

    #[tokio::test]
    async fn test_reset_keeps_bank() {
        let (mut flow, _) = started(bank(3), cooperative_services());
        flow.advance("a").await.unwrap();
        flow.reset();
        assert_eq!(flow.phase(), FlowPhase::NotStarted);
        assert_eq!(flow.state().unused().len(), 3);
        assert!(flow.transcript().is_empty());
        assert_eq!(flow.bank().len(), 3);
    }

    /// A transition writer that never answers.
    struct StalledTransition;

    #[async_trait::async_trait]
    impl TransitionWriter for StalledTransition {
        async fn generate(&self, _: &str, _: Option<String>) -> anyhow::Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_timeout_uses_canned_text() {
        let mut services = cooperative_services();
        services.transition = Arc::new(StalledTransition);
        let (mut flow, _) = started(bank(3), services);

        let Advance::Next(next) = flow.advance("answer").await.unwrap() else {
            panic!("expected another question");
        };
        assert!(next.transition.reason().unwrap().starts_with("timed out"));
        assert!(BRIDGING_FALLBACKS.contains(&next.transition.value().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_advance_leaves_state_untouched() {
        let mut services = cooperative_services();
        services.transition = Arc::new(StalledTransition);
        services.call_timeout = Duration::from_secs(3600);
        let (mut flow, first) = started(bank(3), services);
        let before = flow.state().clone();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), flow.advance("answer")).await;
        assert!(cancelled.is_err());
        assert_eq!(flow.state(), &before);
        assert_eq!(flow.state().current(), Some(first));
        assert!(flow.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_flush_transcript_to_sink() {
        let (mut flow, _) = started(bank(2), cooperative_services());
        flow.advance("first").await.unwrap();
        flow.advance("second").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let sink = crate::transcript::JsonFileTranscriptSink::new();
        assert!(flow.flush_transcript(&sink, path.to_str().unwrap()).await);
        let entries = sink.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user_response, "first");
        assert_eq!(entries[1].user_response, "second");
    }

    #[tokio::test]
    async fn test_second_flush_appends_only_new_entries() {
        let (mut flow, _) = started(bank(3), cooperative_services());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let destination = path.to_str().unwrap();
        let sink = crate::transcript::JsonFileTranscriptSink::new();

        flow.advance("first").await.unwrap();
        assert!(flow.flush_transcript(&sink, destination).await);
        flow.advance("second").await.unwrap();
        assert!(flow.flush_transcript(&sink, destination).await);

        let entries = sink.entries().await;
        assert_eq!(flow.transcript().len(), 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user_response, "first");
        assert_eq!(entries[1].user_response, "second");

        let written: Vec<TranscriptEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_on_next_flush() {
        let (mut flow, _) = started(bank(2), cooperative_services());
        flow.advance("first").await.unwrap();

        let sink = crate::transcript::JsonFileTranscriptSink::new();
        assert!(!flow.flush_transcript(&sink, "/definitely/not/here/log.json").await);

        let retry = crate::transcript::JsonFileTranscriptSink::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        assert!(flow.flush_transcript(&retry, path.to_str().unwrap()).await);
        assert_eq!(retry.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resumed_session_numbers_the_next_question() {
        let mut flow =
            FlowController::rehydrate(bank(3), cooperative_services(), [0], None).unwrap();
        let out = flow.respond("yes").await.unwrap();
        let index = out.question_index.unwrap();
        assert_ne!(index, 0);
        assert!(out.message.starts_with("Welcome back!"));
        assert!(
            out.message.contains("Question 2 of 3:"),
            "unexpected message {:?}",
            out.message
        );
        assert_eq!(out.progress.used_indices, vec![0]);
    }
}
