use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use tracing::info;

use guardstream::chat::template::Conversation;
use guardstream::chat::tokenizer::{ChatTokenizer, HfChatTokenizer};
use guardstream::config::{Config, GuardBackend};
use guardstream::guard::traits::GuardModel;
use guardstream::moderation::events::ModerationEvent;
use guardstream::moderation::service::ModerationService;

/// guardstream: incremental content moderation.
///
/// Moderates a user prompt as a whole and an assistant reply token by token,
/// carrying the guard model's stream state between calls.
#[derive(Parser)]
#[command(name = "guardstream", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP moderation server
    Serve {
        /// Port to listen on (default: GUARDSTREAM_PORT or 5000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: GUARDSTREAM_BIND or 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Moderate a conversation locally and print per-token verdicts
    Check {
        /// The user message
        #[arg(long)]
        user: String,

        /// The assistant reply to moderate token by token
        #[arg(long)]
        assistant: Option<String>,
    },

    /// Download the tokenizer and ONNX guard model
    DownloadModel,

    /// Show configuration and model file status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("guardstream=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, bind } => {
            let config = Config::load()?;
            let service = build_service(&config)?;
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let port = port.unwrap_or(config.port);
            guardstream::web::run_server(service, &bind, port).await?;
        }

        Commands::Check { user, assistant } => {
            let config = Config::load()?;
            let service = build_service(&config)?;
            let conversation = Conversation::new(user, assistant)?;

            let mut events = service.stream_conversation(&conversation)?;
            let mut header_shown = false;
            let mut failed = false;
            while let Some(event) = events.next().await {
                failed = matches!(event, ModerationEvent::Error(_));
                if !guardstream::output::terminal::display_event(&event, &mut header_shown) {
                    break;
                }
            }
            if failed {
                anyhow::bail!("Moderation failed");
            }
        }

        Commands::DownloadModel => {
            let config = Config::load()?;
            println!("Downloading models to: {}", config.model_dir.display());
            guardstream::guard::download::download_model(&config.model_dir, &config.hf_repo)
                .await?;
            println!("\n{}", "Models downloaded successfully.".green().bold());
        }

        Commands::Status => {
            let config = Config::load()?;
            let present = |ok: bool| if ok { "present".green() } else { "missing".red() };
            println!("Backend:      {:?}", config.backend);
            println!("Model dir:    {}", config.model_dir.display());
            println!(
                "  tokenizer:  {}",
                present(guardstream::guard::download::tokenizer_present(&config.model_dir))
            );
            println!(
                "  model:      {}",
                present(guardstream::guard::download::model_files_present(&config.model_dir))
            );
            println!("Source repo:  {}", config.hf_repo);
            println!("Listen:       {}:{}", config.bind, config.port);
            println!("Call timeout: {:?}", config.call_timeout);
            println!("Serialized:   {}", config.serialize_calls);
            if let Err(e) = config.require_backend() {
                println!("\n{}", e.to_string().yellow());
            }
        }
    }

    Ok(())
}

/// Load the tokenizer and the configured guard model into a service.
fn build_service(config: &Config) -> Result<Arc<ModerationService>> {
    config.require_backend()?;

    let tokenizer: Arc<dyn ChatTokenizer> = Arc::new(HfChatTokenizer::load(&config.model_dir)?);
    let model: Arc<dyn GuardModel> = match config.backend {
        GuardBackend::Onnx => {
            info!("Using local ONNX guard model");
            Arc::new(guardstream::guard::onnx::OnnxGuardModel::load(
                &config.model_dir,
                config.hf_repo.as_str(),
            )?)
        }
        GuardBackend::Lexicon => {
            info!("Using lexicon guard model");
            Arc::new(guardstream::guard::lexicon::LexiconGuardModel::new(
                Arc::clone(&tokenizer),
            )?)
        }
    };

    let service = ModerationService::new(model, tokenizer, config.service_options())?;
    Ok(Arc::new(service))
}
