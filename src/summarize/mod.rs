use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::protocol::CorrelationRow;
use crate::{PipelineError, Result};

/// Marker prefix substituted into a row's summary when its generation call
/// fails. The batch itself keeps going.
pub const SUMMARY_ERROR_MARKER: &str = "[summary failed]";

/// Generation collaborator: produces a summary for one row's prompt.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, prompt: &str, model: &str) -> anyhow::Result<String>;
}

/// Closed set of summary providers. Resolution happens through the registry
/// table built at startup, never by late string-driven dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    Gemini,
    Ollama,
}

impl ProviderId {
    pub fn label(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct RegisteredProvider {
    id: ProviderId,
    model_prefixes: Vec<String>,
    provider: Arc<dyn Summarize>,
}

/// Maps caller-supplied model names to registered provider implementations.
///
/// Each provider registers the model-name prefixes it serves; resolution
/// picks the longest matching prefix, so the caller never names the provider
/// directly.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: ProviderId,
        model_prefixes: &[&str],
        provider: Arc<dyn Summarize>,
    ) {
        self.entries.push(RegisteredProvider {
            id,
            model_prefixes: model_prefixes.iter().map(|p| p.to_string()).collect(),
            provider,
        });
    }

    /// Resolve a model name to its provider, longest matching prefix wins.
    pub fn resolve(&self, model: &str) -> Option<(ProviderId, Arc<dyn Summarize>)> {
        let mut best: Option<(usize, ProviderId, &Arc<dyn Summarize>)> = None;
        for entry in &self.entries {
            for prefix in &entry.model_prefixes {
                if model.starts_with(prefix.as_str())
                    && best.map_or(true, |(len, _, _)| prefix.len() > len)
                {
                    best = Some((prefix.len(), entry.id, &entry.provider));
                }
            }
        }
        best.map(|(_, id, provider)| (id, Arc::clone(provider)))
    }

    pub fn registered_ids(&self) -> Vec<ProviderId> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

/// Configuration for a summarization batch.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub model: String,
    /// Bounded parallelism for generation calls
    pub concurrency: usize,
    /// Per-call timeout; a fired timeout is a per-row failure
    pub call_timeout: Duration,
}

impl DispatchConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            concurrency: crate::DEFAULT_SUMMARY_CONCURRENCY,
            call_timeout: Duration::from_secs(90),
        }
    }
}

/// Outcome of a summarization batch.
#[derive(Debug)]
pub struct SummarizeOutcome {
    /// Rows in input order, each with `summary` attached (leftover rows
    /// are passed through without one)
    pub rows: Vec<CorrelationRow>,
    pub failed_rows: usize,
    pub summarized_rows: usize,
    /// Cumulative wall time across all generation calls
    pub total_call_secs: f64,
}

/// Issues one generation call per row with bounded parallelism.
///
/// Output order matches input order regardless of completion order. A single
/// row's failure substitutes [`SUMMARY_ERROR_MARKER`] and never aborts the
/// batch. Leftover rows (never mentioned in the session) are passed through
/// untouched; mentioned rows without captured dialogue are still summarized
/// from their tracked notes.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    pub async fn run(&self, rows: Vec<CorrelationRow>) -> Result<SummarizeOutcome> {
        let (provider_id, provider) = self.registry.resolve(&self.config.model).ok_or_else(|| {
            PipelineError::Config(format!(
                "model {:?} matches no registered provider (registered: {:?})",
                self.config.model,
                self.registry
                    .registered_ids()
                    .iter()
                    .map(|id| id.label())
                    .collect::<Vec<_>>()
            ))
        })?;

        info!(
            "summarizing {} rows with model {} via {} (concurrency {})",
            rows.len(),
            self.config.model,
            provider_id,
            self.config.concurrency
        );

        let model = self.config.model.clone();
        let call_timeout = self.config.call_timeout;

        // buffered() polls up to `concurrency` calls at once and yields
        // results in input order.
        let results: Vec<(CorrelationRow, f64, bool, bool)> = stream::iter(rows.into_iter())
            .map(|row| {
                let provider = Arc::clone(&provider);
                let model = model.clone();
                async move { summarize_row(row, provider, &model, call_timeout).await }
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut outcome = SummarizeOutcome {
            rows: Vec::with_capacity(results.len()),
            failed_rows: 0,
            summarized_rows: 0,
            total_call_secs: 0.0,
        };
        for (row, call_secs, attempted, failed) in results {
            outcome.total_call_secs += call_secs;
            if attempted {
                outcome.summarized_rows += 1;
            }
            if failed {
                outcome.failed_rows += 1;
            }
            outcome.rows.push(row);
        }

        if outcome.failed_rows > 0 {
            warn!(
                "{} of {} summarization calls failed; rows carry error markers",
                outcome.failed_rows, outcome.summarized_rows
            );
        }
        Ok(outcome)
    }
}

async fn summarize_row(
    mut row: CorrelationRow,
    provider: Arc<dyn Summarize>,
    model: &str,
    call_timeout: Duration,
) -> (CorrelationRow, f64, bool, bool) {
    if row.timestamp.is_none() {
        // Leftover rows were never discussed; nothing to summarize.
        return (row, 0.0, false, false);
    }

    let prompt = row_prompt(&row);
    let start = Instant::now();
    let result = timeout(call_timeout, provider.summarize(&prompt, model)).await;
    let call_secs = start.elapsed().as_secs_f64();

    let failed = match result {
        Ok(Ok(summary)) => {
            debug!("summarized {} in {:.1}s", row.version_id, call_secs);
            row.summary = Some(summary);
            false
        }
        Ok(Err(e)) => {
            warn!("summary for {} failed: {e:#}", row.version_id);
            row.summary = Some(format!("{SUMMARY_ERROR_MARKER} {e:#}"));
            true
        }
        Err(_) => {
            warn!(
                "summary for {} timed out after {:.0}s",
                row.version_id,
                call_timeout.as_secs_f64()
            );
            row.summary = Some(format!(
                "{SUMMARY_ERROR_MARKER} timed out after {:.0}s",
                call_timeout.as_secs_f64()
            ));
            true
        }
    };

    (row, call_secs, true, failed)
}

/// Prompt assembled from the row's conversation and tracked context.
fn row_prompt(row: &CorrelationRow) -> String {
    format!(
        "Generate concise, actionable review notes for version {id} (shot {shot}).\n\
         Conversation:\n{conversation}\n\
         Existing notes:\n{notes}",
        id = row.version_id,
        shot = row.shot,
        conversation = row.conversation,
        notes = row.notes,
    )
}
