// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use log::{info, warn, Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;
use std::path::{Path, PathBuf};

use chunkwise::app_config::{self, Config, TranslationProvider};
use chunkwise::app_controller::Controller;
use chunkwise::database::models::ChunkStatus;

/// CLI Wrapper for TranslationProvider to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliTranslationProvider {
    Ollama,
    Anthropic,
    Mock,
}

impl From<CliTranslationProvider> for TranslationProvider {
    fn from(cli_provider: CliTranslationProvider) -> Self {
        match cli_provider {
            CliTranslationProvider::Ollama => TranslationProvider::Ollama,
            CliTranslationProvider::Anthropic => TranslationProvider::Anthropic,
            CliTranslationProvider::Mock => TranslationProvider::Mock,
        }
    }
}

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

fn parse_chunk_status(value: &str) -> Result<ChunkStatus, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate a text file, resuming a previous session for the same text
    Translate(TranslateArgs),

    /// List sessions
    Sessions,

    /// Show the progress of a session
    Progress {
        /// Session ID
        id: String,
    },

    /// List the chunks of a session
    Chunks {
        /// Session ID
        id: String,

        /// Only show chunks in this status (pending, processing, completed, failed)
        #[arg(long, value_parser = parse_chunk_status)]
        status: Option<ChunkStatus>,

        /// Zero-based page number
        #[arg(long, default_value_t = 0)]
        page: usize,
    },

    /// Retry the failed chunks of a session
    Retry {
        /// Session ID
        id: String,
    },

    /// Resume a paused session
    Resume {
        /// Session ID
        id: String,
    },

    /// Write the translation of a session, partial if it is not complete
    Export {
        /// Session ID
        id: String,

        /// Output file; printed to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a session and its chunks
    Delete {
        /// Session ID
        id: String,
    },

    /// Generate shell completions for chunkwise
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug)]
struct TranslateArgs {
    /// Input text file
    #[arg(value_name = "FILE")]
    input_path: PathBuf,

    /// Output directory (defaults to the input file's directory)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Force overwrite of existing output files
    #[arg(short, long)]
    force_overwrite: bool,

    /// Translation provider to use
    #[arg(short, long, value_enum)]
    provider: Option<CliTranslationProvider>,

    /// Model name to use for translation
    #[arg(short, long)]
    model: Option<String>,

    /// Source language code (e.g., 'en', 'es', 'fr')
    #[arg(short, long)]
    source_language: Option<String>,

    /// Target language code (e.g., 'en', 'es', 'fr')
    #[arg(short, long)]
    target_language: Option<String>,

    /// Maximum characters per chunk
    #[arg(long)]
    chunk_size: Option<usize>,
}

/// chunkwise - chunked long-text translation
///
/// Splits long documents into chunks, translates them with a generation
/// provider and keeps every session resumable.
#[derive(Parser, Debug)]
#[command(name = "chunkwise")]
#[command(version)]
#[command(about = "Chunked long-text translation tool")]
#[command(long_about = "chunkwise splits long documents into chunks and translates them with AI providers.

EXAMPLES:
    chunkwise translate novel.txt                  # Translate using default config
    chunkwise translate -t es novel.txt            # Translate to Spanish
    chunkwise translate -p anthropic novel.txt     # Use a specific provider
    chunkwise sessions                             # List sessions
    chunkwise chunks <ID> --status failed          # Show failed chunks
    chunkwise retry <ID>                           # Retry failed chunks
    chunkwise export <ID> -o novel.fr.txt          # Export (partial) translation
    chunkwise completions bash > chunkwise.bash    # Generate bash completions

CONFIGURATION:
    Configuration is stored in conf.json by default. You can specify a different
    config file with --config-path. If the config file doesn't exist, a default one
    will be created automatically.

SUPPORTED PROVIDERS:
    ollama    - Local Ollama server (default: llama3.2:3b)
    anthropic - Anthropic Claude API (requires API key)
    mock      - Echoes the source text, for dry runs")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "conf.json")]
    config_path: String,

    /// Set logging level
    #[arg(short, long, global = true, value_enum)]
    log_level: Option<CliLogLevel>,
}

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @creates: New logger with specified level
    fn new(level: LevelFilter) -> Self {
        CustomLogger { level }
    }

    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        let logger = Box::new(CustomLogger::new(level));
        log::set_boxed_logger(logger)?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: ANSI color for log level
    fn color_for_level(level: Level) -> &'static str {
        match level {
            Level::Error => "\x1B[1;31m",
            Level::Warn => "\x1B[1;33m",
            Level::Info => "\x1B[1;32m",
            Level::Debug => "\x1B[1;36m",
            Level::Trace => "\x1B[1;35m",
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // The global max level is raised or lowered after config load
        metadata.level() <= self.level.max(log::max_level())
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let mut stderr = std::io::stderr();
            let _ = writeln!(
                stderr,
                "{}{} {:<5} {}\x1B[0m",
                Self::color_for_level(record.level()),
                now,
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Start at info; the configured level is applied once the config is loaded
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(*shell, &mut cmd, "chunkwise", &mut std::io::stdout());
        return Ok(());
    }

    if let Some(level) = &cli.log_level {
        let level: app_config::LogLevel = level.clone().into();
        log::set_max_level(level.to_level_filter());
    }

    let mut config = load_or_create_config(&cli.config_path)?;
    if let Commands::Translate(args) = &cli.command {
        apply_overrides(&mut config, args);
    }
    config.validate().context("Configuration validation failed")?;

    if cli.log_level.is_none() {
        log::set_max_level(config.log_level.to_level_filter());
    }

    let controller = Controller::open(config).await?;
    run_command(&controller, cli.command).await
}

fn load_or_create_config(config_path: &str) -> Result<Config> {
    if Path::new(config_path).exists() {
        return Config::from_file(config_path);
    }

    warn!("Config file not found at '{}', creating default config.", config_path);
    let config = Config::default();
    config.save(config_path)?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &TranslateArgs) {
    if let Some(provider) = &args.provider {
        config.translation.provider = provider.clone().into();
    }

    if let Some(model) = &args.model {
        // Find the provider config and update the model
        let provider_str = config.translation.provider.to_lowercase_string();
        if let Some(provider_config) = config
            .translation
            .available_providers
            .iter_mut()
            .find(|p| p.provider_type == provider_str)
        {
            provider_config.model = model.clone();
        }
    }

    if let Some(source_lang) = &args.source_language {
        config.source_language = source_lang.clone();
    }

    if let Some(target_lang) = &args.target_language {
        config.target_language = target_lang.clone();
    }

    if let Some(chunk_size) = args.chunk_size {
        config.engine.chunk_size = chunk_size;
    }
}

async fn run_command(controller: &Controller, command: Commands) -> Result<()> {
    match command {
        Commands::Translate(args) => {
            let output_dir = match args.output_dir {
                Some(dir) => dir,
                None => args
                    .input_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };
            let outcome = controller
                .translate_file(&args.input_path, &output_dir, args.force_overwrite)
                .await?;
            info!("Session {}: {}", outcome.session.id, outcome.session.status);
        }
        Commands::Sessions => {
            let sessions = controller.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for session in sessions {
                println!("{}", session);
            }
        }
        Commands::Progress { id } => {
            let info = controller.session_info(&id).await?;
            println!("{}", info);
        }
        Commands::Chunks { id, status, page } => {
            let chunks = controller.list_chunks(&id, page, status).await?;
            println!(
                "Page {}/{} ({} chunk(s))",
                chunks.page + 1,
                chunks.page_count().max(1),
                chunks.total
            );
            for chunk in &chunks.items {
                let preview: String = chunk.source_text.chars().take(40).collect();
                println!(
                    "#{:<5} {:<10} retries={} {:?}{}",
                    chunk.order,
                    chunk.status,
                    chunk.retry_count,
                    preview.replace('\n', " "),
                    chunk
                        .error_message
                        .as_deref()
                        .map(|e| format!(" error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Retry { id } => {
            let session = controller.retry(&id).await?;
            info!("Session {}: {}", session.id, session.status);
        }
        Commands::Resume { id } => {
            let session = controller.resume(&id).await?;
            info!("Session {}: {}", session.id, session.status);
        }
        Commands::Export { id, output } => {
            let text = controller.export(&id, output.as_deref()).await?;
            if output.is_none() {
                print!("{}", text);
            }
        }
        Commands::Delete { id } => {
            if controller.delete(&id).await? {
                info!("Deleted session {}", id);
            } else {
                return Err(anyhow!("Session not found: {}", id));
            }
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}
