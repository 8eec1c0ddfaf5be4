use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use futures::StreamExt;
use llama_cli::{EchoEngine, DEFAULT_CONTEXT_SIZE};
use llama_session::{InferenceSession, Role, SessionConfig};
use tracing_subscriber::EnvFilter;

/// llama-session driver backed by the echo demo engine
#[derive(Parser)]
#[command(name = "llama-cli", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Load a model, format one user turn, and stream the reply.
    Run {
        /// Model path handed to the engine.
        #[arg(short, long)]
        model: String,

        /// User message.
        #[arg(short, long)]
        prompt: String,

        /// System preamble (overrides the config file).
        #[arg(long)]
        system: Option<String>,

        /// Session config JSON file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Sampling temperature, clamped to [0, 1].
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Nucleus sampling threshold, clamped to [0, 1].
        #[arg(long)]
        top_p: Option<f32>,

        /// Token limit, clamped to [128, 4096].
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Context window of the demo engine, in tokens.
        #[arg(long, default_value_t = DEFAULT_CONTEXT_SIZE)]
        context_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            model,
            prompt,
            system,
            config,
            temperature,
            top_p,
            max_tokens,
            context_size,
        } => {
            let mut session_config = match config {
                Some(path) => SessionConfig::from_file(&path)?,
                None => SessionConfig::default(),
            };
            if let Some(system) = system {
                session_config.system_prompt = system;
            }

            let session =
                InferenceSession::new(session_config, move || EchoEngine::new(context_size))?;
            if let Some(value) = temperature {
                session.set_temperature(value).await?;
            }
            if let Some(value) = top_p {
                session.set_top_p(value).await?;
            }
            if let Some(value) = max_tokens {
                session.set_max_tokens(value).await?;
            }

            session.load(model).await?;
            let context_size = session.context_size().await?;
            tracing::info!(context_size, config = ?session.config(), "session ready");

            let text = session.format(Role::User, &prompt, None).await?;
            let mut stream = session.generate(text).await?;

            let cancel = stream.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let mut stdout = std::io::stdout();
            while let Some(fragment) = stream.next().await {
                write!(stdout, "{}", fragment?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
            drop(stream);

            if let Some(metrics) = session.last_metrics() {
                eprintln!("{}", serde_json::to_string_pretty(&metrics)?);
            }
            session.shutdown().await;
        }
    }
    Ok(())
}
