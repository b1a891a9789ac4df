//! Command-line front end for the question flow.
//!
//! `start` and `respond` are one-shot commands that print a turn as JSON, so a
//! caller can drive a whole session by passing back `usedIndices` and
//! `questionIndex`. `chat` runs an interactive session on stdin. Logs go to
//! stderr so stdout carries only the conversation.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use qflow_core::{
    FlowController, FlowServices, QuestionBank, TurnOutput, TurnProgress, TurnRequest,
    flow::GREETING,
    llm_client::{OpenAICompatibleClient, Provider},
    loader::{JsonQuestionBankLoader, QuestionBankLoader},
    prompts::PromptTemplates,
    run_turn,
    transcript::JsonFileTranscriptSink,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qflow", version, about = "Adaptive question flow for personality assessment")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Debug)]
struct Settings {
    /// JSON export of the question spreadsheet.
    #[arg(long, env = "QUESTION_BANK_PATH", default_value = "./data/questions.json", global = true)]
    questions: PathBuf,

    /// Directory of prompt templates; built-in prompts are used when absent.
    #[arg(long, env = "PROMPTS_PATH", default_value = "./prompts", global = true)]
    prompts: PathBuf,

    /// LLM provider: openai, gemini or anthropic.
    #[arg(long, env = "AI_PROVIDER", default_value = "openai", global = true)]
    provider: String,

    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-4o-mini", global = true)]
    model: String,

    /// Bound on each AI call, in seconds.
    #[arg(
        long,
        env = "AI_TIMEOUT_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=10),
        global = true
    )]
    timeout_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the greeting that opens a session.
    Start,
    /// Run one stateless turn and print it as JSON.
    Respond {
        /// The user's reply.
        #[arg(long)]
        response: String,
        /// JSON array of answered question indices from the previous turn.
        #[arg(long, default_value = "[]", value_parser = parse_indices)]
        used_indices: Indices,
        /// The question awaiting an answer, from the previous turn.
        #[arg(long)]
        current_question_index: Option<usize>,
    },
    /// Hold an interactive session on stdin.
    Chat {
        /// Write the answered questions to this JSON file at the end.
        #[arg(long)]
        transcript_out: Option<PathBuf>,
    },
}

/// Question indices given on the command line as a JSON array.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Indices(Vec<usize>);

fn parse_indices(raw: &str) -> Result<Indices, String> {
    if raw.trim().is_empty() {
        return Ok(Indices(Vec::new()));
    }
    serde_json::from_str(raw)
        .map(Indices)
        .map_err(|e| format!("expected a JSON array of indices: {e}"))
}

async fn load_bank(settings: &Settings) -> Result<Arc<QuestionBank>> {
    let source = settings.questions.to_string_lossy().into_owned();
    let bank = JsonQuestionBankLoader
        .load(&source)
        .await
        .with_context(|| format!("Failed to load question bank from {source}"))?;
    info!(questions = bank.len(), "Question bank loaded");
    Ok(Arc::new(bank))
}

fn build_services(settings: &Settings) -> Result<FlowServices> {
    let provider = Provider::from_name(&settings.provider);
    let api_key = std::env::var(provider.api_key_var())
        .with_context(|| format!("{} must be set for '{provider}' provider", provider.api_key_var()))?;

    let prompts = if settings.prompts.is_dir() {
        PromptTemplates::load(&settings.prompts)?
    } else {
        PromptTemplates::builtin()
    };

    let llm = OpenAICompatibleClient::for_provider(&provider, &api_key, settings.model.clone());
    Ok(FlowServices::from_llm(
        Arc::new(llm),
        Arc::new(prompts),
        Duration::from_secs(settings.timeout_secs),
    ))
}

/// The greeting as a turn with nothing answered yet.
fn greeting_turn(bank: &QuestionBank) -> TurnOutput {
    TurnOutput {
        message: GREETING.to_string(),
        progress: TurnProgress {
            used: 0,
            total: bank.len(),
            used_indices: Vec::new(),
        },
        cluster_id: None,
        question_index: None,
        finished: false,
        last_answer_cluster_id: None,
    }
}

async fn chat(
    bank: Arc<QuestionBank>,
    services: FlowServices,
    transcript_out: Option<PathBuf>,
) -> Result<()> {
    let mut flow = FlowController::new(bank, services);
    println!("{}\n", flow.greet()?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let reply = line.trim();
        if reply.is_empty() {
            continue;
        }

        let out = flow.respond(reply).await?;
        println!("\n{}\n", out.message);
        if out.finished {
            break;
        }
    }

    if let Some(path) = transcript_out {
        let destination = path.to_string_lossy();
        let sink = JsonFileTranscriptSink::new();
        if flow.flush_transcript(&sink, &destination).await {
            info!(%destination, "Transcript exported");
        } else {
            warn!(%destination, "No transcript was written");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let bank = load_bank(&cli.settings).await?;

    match cli.cmd {
        Commands::Start => {
            println!("{}", serde_json::to_string_pretty(&greeting_turn(&bank))?);
        }
        Commands::Respond {
            response,
            used_indices,
            current_question_index,
        } => {
            let services = build_services(&cli.settings)?;
            let request = TurnRequest {
                response,
                used_indices: used_indices.0,
                current_index: current_question_index,
            };
            let out = run_turn(bank, services, &request).await?;
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Chat { transcript_out } => {
            let services = build_services(&cli.settings)?;
            chat(bank, services, transcript_out).await?;
        }
    }
    Ok(())
}
