//! Review Correlator - correlates recorded review sessions with tracked versions
//!
//! This crate ingests a recorded collaborative review session, extracts
//! timestamped mentions of production-asset version identifiers from the
//! audio transcript and the visual stream, merges them with authoritative
//! version records from a tracking system, and attaches AI-generated
//! summaries. It features:
//!
//! - Resumable caching of expensive media acquisition with atomic writes
//! - Sequential or concurrent transcription + visual detection with
//!   timing and speedup accounting
//! - A chronological correlation algorithm with threshold-based
//!   reference detection and leftover handling
//! - Partial-failure-tolerant batch summarization with bounded parallelism
//! - External-command collaborators for the heavy lifting (speech-to-text,
//!   detection, generation), managed as spawned subprocesses
//!
//! # Example
//!
//! ```rust
//! use review_correlator::{
//!     correlate::CorrelationEngine,
//!     protocol::{MentionPattern, TranscriptMention, VersionRecord},
//! };
//!
//! let pattern = MentionPattern::new(r"v\d{3}").unwrap();
//! let engine = CorrelationEngine::new(30.0).unwrap();
//!
//! let mentions = vec![
//!     TranscriptMention::new("v001", 10.0),
//!     TranscriptMention::new("v002", 25.0),
//! ];
//! let records = vec![
//!     VersionRecord::new("v001", "sh010", "needs lighting pass"),
//!     VersionRecord::new("v002", "sh020", ""),
//! ];
//!
//! let report = engine.correlate(&mentions, &records, &pattern);
//! assert_eq!(report.rows.len(), 2);
//! assert!(report.rows[1].reference_versions.contains("v001"));
//! ```

pub mod acquire;
pub mod correlate;
pub mod pipeline;
pub mod protocol;
pub mod stages;
pub mod summarize;
pub mod worker;

// Re-export commonly used types for convenience
pub use acquire::{Acquired, Fetch, HttpFetcher, MediaCache};
pub use correlate::{CorrelationEngine, CorrelationReport};
pub use pipeline::{
    Collaborators, Deliver, LoadVersions, Pipeline, PipelineConfig, PipelineReport, RunTimings,
};
pub use protocol::{
    CorrelationRow, MentionPattern, RecordingSource, TranscriptMention, VersionRecord,
};
pub use stages::{Detect, ExtractionOutput, StageScheduler, StageTiming, Transcribe};
pub use summarize::{DispatchConfig, Dispatcher, ProviderId, ProviderRegistry, Summarize};

// Error types
use thiserror::Error;

/// Errors that can occur in the review-correlator pipeline.
///
/// Only `Retrieval`, `Stage`, `Config`, and `Io` are fatal to a run; the
/// remaining variants describe non-fatal conditions that are accumulated as
/// counters or per-row markers and never halt forward progress.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Media acquisition failed (network or permission); fatal to the run
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// A mention's version id failed the extraction pattern; the mention is dropped
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Duplicate version ids resolved by last-write-wins
    #[error("correlation inconsistency: {0}")]
    Inconsistency(String),

    /// A summarization call failed; the row receives an error marker
    #[error("provider error: {0}")]
    Provider(String),

    /// Artifact delivery failed; logged only, the artifact stands
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Invalid caller-supplied configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A pipeline stage failed fatally; names the originating stage
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: &'static str,
        source: Box<PipelineError>,
    },

    /// Collaborator failure surfaced through a stage boundary
    #[error("collaborator error: {0:#}")]
    Collaborator(anyhow::Error),

    /// Invalid version-id extraction pattern
    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Collaborator(err)
    }
}

impl PipelineError {
    /// Wrap a fatal error with the name of the stage it unwound from.
    pub fn in_stage(self, stage: &'static str) -> Self {
        PipelineError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The originating stage name, if this error unwound from one.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            PipelineError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Result type alias for review-correlator operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Default reference-detection threshold in seconds
pub const DEFAULT_REFERENCE_THRESHOLD: f64 = 30.0;

/// Default bounded parallelism for summarization calls
pub const DEFAULT_SUMMARY_CONCURRENCY: usize = 4;

/// Utility functions for common operations
pub mod utils {
    /// Format seconds into a human-readable duration (Xh Ym Zs).
    pub fn format_duration(seconds: f64) -> String {
        let total = seconds.max(0.0) as u64;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let secs = total % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }
}
