pub mod error;
pub mod flow;
pub mod llm_client;
pub mod loader;
pub mod outcome;
pub mod policy;
pub mod prompts;
pub mod question;
pub mod replies;
pub mod selector;
pub mod state;
pub mod transcript;

pub use error::{FlowError, LoadError};
pub use flow::{
    Advance, FlowController, FlowPhase, FlowServices, Readiness, TurnOutput, TurnProgress,
};
pub use question::{QuestionBank, QuestionRecord};
pub use state::{ConversationState, Progress};

/// What a stateless caller sends for one turn.
///
/// `used_indices` and `current_index` are the values returned by the
/// previous turn; both are empty on the first.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub response: String,
    #[serde(default)]
    pub used_indices: Vec<usize>,
    #[serde(default)]
    pub current_index: Option<usize>,
}

/// Runs one request/response turn against a shared bank without any
/// server-side session.
pub async fn run_turn(
    bank: std::sync::Arc<QuestionBank>,
    services: FlowServices,
    request: &TurnRequest,
) -> Result<TurnOutput, FlowError> {
    let mut flow = FlowController::rehydrate(
        bank,
        services,
        request.used_indices.iter().copied(),
        request.current_index,
    )?;
    flow.respond(&request.response).await
}
