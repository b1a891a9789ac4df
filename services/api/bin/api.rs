//! Main Entrypoint for the Question Flow API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Loading the question bank and prompts, and wiring the LLM-backed flow services.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use qflow_api::{config::Config, db::Db, router::create_router, state::AppState};
use qflow_core::{
    FlowServices,
    llm_client::{LLMClient, OpenAICompatibleClient},
    loader::{JsonQuestionBankLoader, QuestionBankLoader},
    prompts::PromptTemplates,
};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Shared Services ---
    let bank_path = config.question_bank_path.to_string_lossy().into_owned();
    let bank = Arc::new(
        JsonQuestionBankLoader
            .load(&bank_path)
            .await
            .with_context(|| format!("Failed to load question bank from {bank_path}"))?,
    );

    let prompts = if config.prompts_path.is_dir() {
        PromptTemplates::load(&config.prompts_path)?
    } else {
        warn!(
            path = %config.prompts_path.display(),
            "Prompts directory not found; using built-in prompts"
        );
        PromptTemplates::builtin()
    };

    info!(provider = %config.provider, "Using LLM provider.");
    let llm_client: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::for_provider(
        &config.provider,
        &config.api_key,
        config.chat_model.clone(),
    ));
    let services = FlowServices::from_llm(llm_client, Arc::new(prompts), config.ai_timeout);

    let app_state = Arc::new(AppState {
        db,
        bank: bank.clone(),
        services,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = %config.provider,
        model = %config.chat_model,
        questions = bank.len(),
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
