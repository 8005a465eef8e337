use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use review_correlator::acquire::{HttpFetcher, MediaCache};
use review_correlator::pipeline::{Collaborators, Deliver, Pipeline, PipelineConfig};
use review_correlator::protocol::RecordingSource;
use review_correlator::summarize::{ProviderId, ProviderRegistry};
use review_correlator::worker::{
    CommandDeliverer, CommandDetector, CommandSpec, CommandSummarizer, CommandTranscriber,
    JsonVersionSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "review-correlator")]
#[command(about = "Correlates review-session recordings with tracked version records")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Recording to process: local media path or http(s) URL
    pub source: String,

    /// JSON file with the tracked version records
    pub versions: PathBuf,

    /// Regex that extracts a version id from transcript or detection text
    #[arg(long, default_value = r"v\d{3,}")]
    pub version_pattern: String,

    /// Seconds within which an earlier mention counts as a reference
    #[arg(long, default_value = "30")]
    pub reference_threshold: f64,

    /// Model name for summaries; the prefix picks the provider
    #[arg(long, default_value = "llama3")]
    pub model: String,

    /// Concurrent summary calls
    #[arg(long, default_value = "4")]
    pub summary_concurrency: usize,

    /// Run audio and visual extraction concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Re-download the recording even when cached
    #[arg(long)]
    pub force_refresh: bool,

    /// Keep intermediate artifacts under the output directory
    #[arg(long)]
    pub keep_intermediate: bool,

    /// Abort a remote fetch after this many seconds
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

    /// Cache directory for downloaded recordings
    #[arg(long, default_value = "/tmp/review-correlator/cache")]
    pub cache_dir: PathBuf,

    /// Output directory for retained artifacts
    #[arg(long, default_value = "/tmp/review-correlator/output")]
    pub output_dir: PathBuf,

    /// Transcription command (receives the media path)
    #[arg(long, default_value = "uv run transcribe.py")]
    pub transcribe_cmd: String,

    /// Visual detection command (receives the media path)
    #[arg(long, default_value = "uv run detect.py")]
    pub detect_cmd: String,

    /// Summarization command (prompt on stdin, --model appended)
    #[arg(long, default_value = "uv run summarize.py")]
    pub summarize_cmd: String,

    /// Delivery command; delivery is skipped when unset
    #[arg(long)]
    pub deliver_cmd: Option<String>,

    /// Recipient handed to the delivery command
    #[arg(long)]
    pub recipient: Option<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn build_registry(summarize_cmd: &str) -> Result<Arc<ProviderRegistry>> {
    let mut registry = ProviderRegistry::new();
    let summarizer = Arc::new(CommandSummarizer::new(CommandSpec::parse(summarize_cmd)?));
    registry.register(ProviderId::Gemini, &["gemini"], summarizer.clone());
    registry.register(ProviderId::Ollama, &["llama", "gemma", "mistral", "qwen"], summarizer);
    Ok(Arc::new(registry))
}

fn build_pipeline(args: &Args) -> Result<Pipeline> {
    let source = RecordingSource::parse(&args.source);
    let config = PipelineConfig {
        source,
        version_pattern: args.version_pattern.clone(),
        reference_threshold: args.reference_threshold,
        model: args.model.clone(),
        summary_concurrency: args.summary_concurrency,
        parallel_extraction: args.parallel,
        force_refresh: args.force_refresh,
        retain_intermediates: args.keep_intermediate,
        output_dir: args.output_dir.clone(),
        recipient: args.recipient.clone(),
    };

    let deliverer: Option<Arc<dyn Deliver>> = match &args.deliver_cmd {
        Some(cmd) => Some(Arc::new(CommandDeliverer::new(CommandSpec::parse(cmd)?))),
        None => None,
    };

    let collaborators = Collaborators {
        fetcher: Arc::new(HttpFetcher::new()),
        transcriber: Arc::new(CommandTranscriber::new(CommandSpec::parse(
            &args.transcribe_cmd,
        )?)),
        detector: Arc::new(CommandDetector::new(CommandSpec::parse(&args.detect_cmd)?)),
        versions: Arc::new(JsonVersionSource::new(&args.versions)),
        registry: build_registry(&args.summarize_cmd)?,
        deliverer,
    };

    let mut cache = MediaCache::new(&args.cache_dir);
    if let Some(secs) = args.fetch_timeout {
        cache = cache.with_fetch_timeout(std::time::Duration::from_secs(secs));
    }
    Ok(Pipeline::new(config, collaborators, Arc::new(cache)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Review Correlator v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Source: {}", args.source);
    info!("  Versions: {}", args.versions.display());
    info!("  Pattern: {}", args.version_pattern);
    info!("  Reference threshold: {}s", args.reference_threshold);
    info!("  Model: {}", args.model);
    info!("  Parallel extraction: {}", args.parallel);

    let pipeline = build_pipeline(&args).context("Failed to assemble pipeline")?;

    // Ctrl-c drops the run future, which tears down the scratch workspace.
    tokio::select! {
        result = pipeline.run() => {
            let report = result.map_err(|e| {
                error!("Pipeline failed: {}", e);
                anyhow::anyhow!(e)
            })?;
            info!(
                "Completed run {}: {} rows ({} summary failures)",
                report.run_id,
                report.rows.len(),
                report.summarize_failed_rows
            );
            if let Some(path) = &report.artifact_path {
                info!("Artifact: {}", path.display());
            }
            info!("Timings: {}", report.timings);
        }
        _ = signal::ctrl_c() => {
            warn!("Interrupted; scratch workspace cleaned up");
        }
    }

    Ok(())
}
