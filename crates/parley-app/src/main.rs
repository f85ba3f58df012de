//! Parley application binary - composition root.
//!
//! 1. Parse the command line and load configuration from TOML
//! 2. Initialize logging
//! 3. Open the SQLite database and build the session actors
//! 4. Build the provider adapters (or mocks with `--offline`)
//! 5. Run the requested subcommand

mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;

use parley_chat::attachment::{encode_data_url, mime_for_name};
use parley_chat::{
    ContextProvider, EnrichmentCoordinator, GenerationService, MockContextProvider,
    MockGeneration, MockVision, Orchestrator, PromptAssembler, SessionDirectory, SessionLog,
    TurnInput, VisionService,
};
use parley_core::types::UserContext;
use parley_core::ParleyConfig;
use parley_providers::{HttpContextProvider, OpenAiCompatibleClient};
use parley_storage::{Database, RecordStore, SqliteRecordStore};

use cli::{ChatArgs, CliArgs, Command, ContextCommand, SessionsCommand};

const OFFLINE_REPLY: &str = "(offline) No generation service is configured.";
const OFFLINE_DESCRIPTION: &str = "(offline) Image descriptions are unavailable.";

type Services = (
    Arc<dyn GenerationService>,
    Arc<dyn VisionService>,
    Arc<dyn ContextProvider>,
);

/// Remote adapters, or mocks when running offline.
fn build_services(
    config: &ParleyConfig,
    offline: bool,
) -> Result<Services, Box<dyn std::error::Error>> {
    if offline {
        tracing::info!("Offline mode: using mock providers");
        let generation: Arc<dyn GenerationService> =
            Arc::new(MockGeneration::with_reply(OFFLINE_REPLY));
        let vision: Arc<dyn VisionService> = Arc::new(MockVision::with_text(OFFLINE_DESCRIPTION));
        let lookups: Arc<dyn ContextProvider> = Arc::new(MockContextProvider::new());
        return Ok((generation, vision, lookups));
    }

    let client = Arc::new(OpenAiCompatibleClient::from_config(&config.providers)?);
    let lookups: Arc<dyn ContextProvider> =
        Arc::new(HttpContextProvider::from_config(&config.providers)?);
    tracing::info!(
        endpoint = client.endpoint(),
        text_model = %config.providers.text_model,
        vision_model = %config.providers.vision_model,
        "Provider adapters ready"
    );
    let generation: Arc<dyn GenerationService> = client.clone();
    let vision: Arc<dyn VisionService> = client;
    Ok((generation, vision, lookups))
}

/// Read a local file into a data URL.
fn attach(path: &Path) -> Result<(String, String), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let data_url = encode_data_url(mime_for_name(&name), &bytes);
    Ok((name, data_url))
}

async fn run_chat(
    orchestrator: &Orchestrator,
    args: ChatArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let image = match &args.image {
        Some(path) => Some(attach(path)?.1),
        None => None,
    };
    let (file_name, file) = match &args.file {
        Some(path) => {
            let (name, data_url) = attach(path)?;
            (Some(name), Some(data_url))
        }
        None => (None, None),
    };

    let input = TurnInput {
        message: args.message.unwrap_or_default(),
        session_id: args.session,
        image,
        file_name,
        file,
    };

    match orchestrator.run_turn(input).await {
        Ok(reply) => {
            println!("{}", reply);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, "Turn failed");
            let report = e.report();
            eprintln!("{} ({})", report.message, report.code);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Parse a CLI value as JSON, falling back to a plain string.
fn context_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. Loaded before tracing so the configured level applies.
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = if config_file.exists() {
        match ParleyConfig::load(&config_file) {
            Ok(config) => (config, None),
            Err(e) => (ParleyConfig::default(), Some(e)),
        }
    } else {
        (ParleyConfig::default(), None)
    };
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }

    // Tracing.
    let filter = args.resolve_log_filter(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load config, using defaults"
        ),
        None => tracing::debug!(path = %config_file.display(), "Configuration resolved"),
    }

    // Storage.
    let db_path = config.database_path();
    let db = Arc::new(Database::new(&db_path)?);
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(db));
    tracing::debug!(path = %db_path.display(), "SQLite database opened");

    let session_log = Arc::new(
        SessionLog::new(Arc::clone(&store), config.chat.max_stored_messages)
            .with_idle_timeout(Duration::from_secs(config.chat.session_idle_secs)),
    );
    let directory = Arc::new(SessionDirectory::new(Arc::clone(&store)));

    match args.command {
        Command::Chat(chat) => {
            let (generation, vision, lookups) = build_services(&config, args.offline)?;
            let orchestrator = Orchestrator::new(
                session_log,
                directory,
                EnrichmentCoordinator::new(vision, lookups, &config.enrichment),
                PromptAssembler::new(config.chat.prompt_history),
                generation,
                &config.chat,
            );
            return run_chat(&orchestrator, chat).await;
        }
        Command::History(target) => {
            let messages = session_log.history(&target.session).await?;
            if messages.is_empty() {
                println!("No messages in '{}'.", target.session);
            }
            for message in messages {
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.role,
                    message.content
                );
            }
        }
        Command::Clear(target) => {
            session_log.clear(&target.session).await?;
            println!("Cleared messages in '{}'.", target.session);
        }
        Command::Context(ContextCommand::Set { session, pairs }) => {
            let partial: UserContext = pairs
                .into_iter()
                .map(|(key, raw)| (key, context_value(&raw)))
                .collect();
            let merged = session_log.merge_context(&session, partial).await?;
            println!("{}", serde_json::to_string_pretty(&merged)?);
        }
        Command::Context(ContextCommand::Show(target)) => {
            let snapshot = session_log.get_all(&target.session).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot.user_context)?);
        }
        Command::Sessions(SessionsCommand::List) => {
            let summaries = directory.list().await?;
            if summaries.is_empty() {
                println!("No conversations.");
            }
            for summary in summaries {
                println!(
                    "{}  {}  {}  {}",
                    summary.id,
                    summary.updated_at.format("%Y-%m-%d %H:%M"),
                    summary.name,
                    summary.last_message_preview
                );
            }
        }
        Command::Sessions(SessionsCommand::New { id, name }) => {
            let summary = directory.create(id, name).await?;
            println!("{}", summary.id);
        }
        Command::Sessions(SessionsCommand::Rename { id, name }) => {
            let summary = directory.rename(&id, &name).await?;
            println!("Renamed '{}' to '{}'.", summary.id, summary.name);
        }
        Command::Sessions(SessionsCommand::Remove { id }) => {
            directory.remove(&id).await?;
            println!("Removed '{}'.", id);
        }
    }

    Ok(ExitCode::SUCCESS)
}
