//! llmstream - stream a completion from a local GGUF model
//!
//! Settings are read from the data directory and can be overridden per run.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llmstream::inference::{GenerationWorker, StopSignal, StreamToken};
use llmstream::storage::init_storage;
use llmstream::storage::settings::{load_settings, save_settings};

/// Stream a greedy completion from a GGUF model
#[derive(Parser)]
#[command(name = "llmstream")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the GGUF model file (relative paths resolve against the models directory)
    #[arg(value_name = "MODEL")]
    model: PathBuf,

    /// Prompt text
    #[arg(value_name = "PROMPT")]
    prompt: String,

    /// Maximum tokens to generate
    #[arg(short = 'n', long)]
    max_tokens: Option<u32>,

    /// Context window size
    #[arg(short = 'c', long)]
    context_size: Option<u32>,

    /// Threads for generation
    #[arg(short = 't', long)]
    threads: Option<u32>,

    /// Layers to offload to GPU
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Role label that ends the response when it opens a new line (repeatable)
    #[arg(long = "role-marker")]
    role_markers: Vec<String>,

    /// Token id that ends the response (repeatable)
    #[arg(long = "stop-token")]
    stop_tokens: Vec<i32>,

    /// Persist the effective settings
    #[arg(long)]
    save: bool,
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only generated text
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llmstream=info")))
        .init();

    info!("Starting llmstream v{}", env!("CARGO_PKG_VERSION"));

    match run(Cli::parse()) {
        Ok(StopSignal::MaxLengthReached) => {
            info!("Max tokens limit reached");
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<StopSignal, Box<dyn std::error::Error>> {
    if let Err(e) = init_storage() {
        tracing::warn!("Storage unavailable, settings will not persist: {e}");
    }

    let mut settings = load_settings();
    if let Some(n) = cli.max_tokens {
        settings.max_tokens = n;
    }
    if let Some(n) = cli.context_size {
        settings.context_size = n;
    }
    if let Some(n) = cli.threads {
        settings.threads = n;
    }
    if let Some(n) = cli.gpu_layers {
        settings.gpu_layers = n;
    }
    if !cli.role_markers.is_empty() {
        settings.role_markers = cli.role_markers;
    }
    if !cli.stop_tokens.is_empty() {
        settings.stop_token_ids = cli.stop_tokens;
    }
    settings.validate();

    if cli.save {
        save_settings(&settings)?;
    }

    let model_path = if cli.model.is_relative() && !cli.model.exists() {
        settings.models_directory.join(&cli.model)
    } else {
        cli.model
    };

    let mut worker = GenerationWorker::new();
    worker.init()?;
    let model = worker.load_model(&model_path, settings.gpu_layers)?;
    info!(
        "Loaded {} (n_vocab={}, n_ctx_train={})",
        model.path.display(),
        model.vocab_size,
        model.train_context
    );

    let (tokens, _stop) = worker.generate_stream(&cli.prompt, settings.generation_params())?;

    let mut stdout = io::stdout().lock();
    for token in tokens {
        match token {
            StreamToken::Token(text) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            StreamToken::Done(signal) => {
                writeln!(stdout)?;
                info!("Generation finished: {signal}");
                return Ok(signal);
            }
            StreamToken::Error(message) => return Err(message.into()),
        }
    }

    Err("worker stopped before finishing the stream".into())
}
