use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the contextfit binary.
#[derive(Debug, Parser)]
#[command(
    name = "contextfit",
    version,
    about = "Learn working context windows for recurring prompts"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CONTEXTFIT_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the complexity score and per-resolution fingerprints of a text.
    Fingerprint(TextArgs),
    /// Print the best stored match for a text as JSON, or `null`.
    Match(TextArgs),
    /// Store a text as a template with its working window.
    Learn(LearnArgs),
    /// Fold an observed outcome into an existing template.
    Reinforce(ReinforceArgs),
    /// Match a text and reinforce the hit, or learn it on a miss.
    Observe(ObserveArgs),
    /// Create the storage schema and exit.
    Init,
    /// Run backend maintenance (statistics refresh, space reclaim).
    Maintain,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the storage backend (sqlite|postgres).
    #[arg(long = "backend", value_name = "BACKEND", global = true)]
    pub backend: Option<String>,

    /// Override the embedded database file.
    #[arg(
        long = "sqlite-path",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub sqlite_path: Option<PathBuf>,

    /// Override the PostgreSQL connection URL.
    #[arg(long = "postgres-url", value_name = "URL", global = true)]
    pub postgres_url: Option<String>,

    /// Override the storage connection pool size.
    #[arg(long = "pool-size", value_name = "COUNT", global = true)]
    pub pool_size: Option<u32>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct TextArgs {
    /// Prompt text, or `-` to read standard input.
    #[arg(value_name = "TEXT")]
    pub text: String,
}

#[derive(Debug, Args, Clone)]
pub struct LearnArgs {
    /// Prompt text, or `-` to read standard input.
    #[arg(value_name = "TEXT")]
    pub text: String,

    /// Context window in tokens that served this prompt.
    #[arg(long = "working-window", value_name = "TOKENS")]
    pub working_window: u32,

    /// Batch size; defaults to `learning.default_batch_size`.
    #[arg(long = "batch-size", value_name = "COUNT")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct ReinforceArgs {
    #[arg(long = "template-id", value_name = "ID")]
    pub template_id: i64,

    /// Hamming distance observed for this use of the template.
    #[arg(long = "distance", value_name = "BITS")]
    pub distance: u32,

    #[arg(long = "working-window", value_name = "TOKENS")]
    pub working_window: u32,

    #[arg(long = "batch-size", value_name = "COUNT")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct ObserveArgs {
    /// Prompt text, or `-` to read standard input.
    #[arg(value_name = "TEXT")]
    pub text: String,

    #[arg(long = "prompt-tokens", value_name = "TOKENS")]
    pub prompt_tokens: u32,

    #[arg(long = "completion-tokens", value_name = "TOKENS")]
    pub completion_tokens: u32,

    #[arg(long = "batch-size", value_name = "COUNT")]
    pub batch_size: Option<u32>,
}
