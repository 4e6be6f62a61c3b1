use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "specdex",
    version,
    about = "Specification manual ingestion into divisions, sections and retrieval chunks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Register(RegisterArgs),
    Ingest(IngestArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RegisterArgs {
    #[arg(long, default_value = ".cache/specdex")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Source specification file (PDF).
    #[arg(long)]
    pub file: PathBuf,

    /// Document identifier; derived from the payload hash when omitted.
    #[arg(long)]
    pub doc_id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = ".cache/specdex")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub ingest_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub doc_id: String,

    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Pre-staged extraction job on the primary backend, as `name=id` or `id`.
    #[arg(long = "job-handle")]
    pub job_handles: Vec<String>,

    #[arg(long, env = "SPECDEX_OCR_API_URL")]
    pub ocr_api_url: Option<String>,

    #[arg(long, env = "SPECDEX_OCR_API_KEY", hide_env_values = true)]
    pub ocr_api_key: Option<String>,

    #[arg(long, default_value_t = 120)]
    pub ocr_request_timeout_secs: u64,

    #[arg(long, default_value_t = false)]
    pub no_text_layer_fallback: bool,

    #[arg(long, default_value_t = 2000)]
    pub poll_interval_ms: u64,

    #[arg(long, default_value_t = 150)]
    pub poll_max_attempts: u32,

    #[arg(long, default_value_t = 512)]
    pub max_chunk_tokens: usize,

    #[arg(long, default_value_t = 30)]
    pub stale_lock_minutes: i64,

    /// JSON file overriding the header grammar for a specification dialect.
    #[arg(long)]
    pub grammar_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/specdex")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub doc_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}
