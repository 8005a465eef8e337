use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acquire::{Fetch, MediaCache};
use crate::correlate::{CorrelationEngine, CorrelationReport};
use crate::protocol::{CorrelationRow, MentionPattern, RecordingSource, VersionRecord};
use crate::stages::{Detect, StageScheduler, Transcribe};
use crate::summarize::{DispatchConfig, Dispatcher, ProviderRegistry};
use crate::{utils, PipelineError, Result};

/// Loads the authoritative version records from the tracking side.
#[async_trait]
pub trait LoadVersions: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<VersionRecord>>;
}

/// Delivers the finished artifact (email, upload, ...). Best-effort.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, artifact: &Path, meta: &DeliveryMetadata) -> anyhow::Result<()>;
}

/// Context handed to the delivery collaborator alongside the artifact path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub recording_id: String,
    pub row_count: usize,
    pub recipient: Option<String>,
}

/// Per-run settings for the coordinator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: RecordingSource,
    pub version_pattern: String,
    pub reference_threshold: f64,
    pub model: String,
    pub summary_concurrency: usize,
    pub parallel_extraction: bool,
    pub force_refresh: bool,
    /// Keep scratch artifacts by moving them into `output_dir`
    pub retain_intermediates: bool,
    pub output_dir: PathBuf,
    pub recipient: Option<String>,
}

/// Collaborator bundle: every external seam the pipeline consumes.
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetch>,
    pub transcriber: Arc<dyn Transcribe>,
    pub detector: Arc<dyn Detect>,
    pub versions: Arc<dyn LoadVersions>,
    pub registry: Arc<ProviderRegistry>,
    pub deliverer: Option<Arc<dyn Deliver>>,
}

/// Wall-clock seconds per stage plus the derived total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunTimings {
    pub acquire_secs: f64,
    pub extract_secs: f64,
    pub correlate_secs: f64,
    pub summarize_secs: f64,
    pub deliver_secs: f64,
    pub extraction_speedup: Option<f64>,
}

impl RunTimings {
    pub fn total_secs(&self) -> f64 {
        self.acquire_secs
            + self.extract_secs
            + self.correlate_secs
            + self.summarize_secs
            + self.deliver_secs
    }
}

impl fmt::Display for RunTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acquire {} | extract {} | correlate {} | summarize {} | total {}",
            utils::format_duration(self.acquire_secs),
            utils::format_duration(self.extract_secs),
            utils::format_duration(self.correlate_secs),
            utils::format_duration(self.summarize_secs),
            utils::format_duration(self.total_secs()),
        )?;
        if let Some(speedup) = self.extraction_speedup {
            write!(f, " (extraction speedup {speedup:.2}x)")?;
        }
        Ok(())
    }
}

/// Final report for one run.
#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub recording_id: String,
    pub rows: Vec<CorrelationRow>,
    pub correlation: CorrelationReport,
    pub timings: RunTimings,
    pub summarize_failed_rows: usize,
    pub delivered: bool,
    /// Where the artifact ended up, if intermediates were retained
    pub artifact_path: Option<PathBuf>,
}

/// Sequences acquire, extract, correlate, summarize and delivery.
///
/// Owns a per-run scratch workspace; on success the workspace is deleted
/// unless intermediates are retained, and on failure or cancellation the
/// `TempDir` drop removes it.
pub struct Pipeline {
    config: PipelineConfig,
    collaborators: Collaborators,
    cache: Arc<MediaCache>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators, cache: Arc<MediaCache>) -> Self {
        Self {
            config,
            collaborators,
            cache,
        }
    }

    pub async fn run(&self) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let pattern = MentionPattern::new(&self.config.version_pattern)?;
        let scratch = TempDir::new().map_err(PipelineError::Io)?;
        info!(
            "run {} starting for {} (scratch {})",
            run_id,
            self.config.source.input,
            scratch.path().display()
        );

        let mut timings = RunTimings::default();

        // Acquire
        let start = Instant::now();
        let mut source = self.config.source.clone();
        let acquired = self
            .cache
            .acquire(
                &mut source,
                self.config.force_refresh,
                self.collaborators.fetcher.as_ref(),
            )
            .await
            .map_err(|e| e.in_stage("acquire"))?;
        timings.acquire_secs = start.elapsed().as_secs_f64();
        info!(
            "acquired {} ({}) in {}",
            acquired.recording_id,
            if acquired.cached { "cache" } else { "fetched" },
            utils::format_duration(timings.acquire_secs)
        );

        // Version records load alongside extraction prep; a failure here is
        // fatal before any heavy work runs.
        let records = self
            .collaborators
            .versions
            .load()
            .await
            .map_err(|e| PipelineError::Collaborator(e).in_stage("versions"))?;
        info!("loaded {} tracked version records", records.len());

        // Extract
        let start = Instant::now();
        let scheduler = StageScheduler::new(self.config.parallel_extraction);
        let extraction = scheduler
            .run(
                &acquired.local_path,
                &pattern,
                self.collaborators.transcriber.as_ref(),
                self.collaborators.detector.as_ref(),
            )
            .await
            .map_err(|e| e.in_stage("extract"))?;
        timings.extract_secs = start.elapsed().as_secs_f64();
        timings.extraction_speedup = extraction.timing.speedup;
        self.write_scratch_json(scratch.path(), "mentions.json", &extraction.mentions)?;

        // Correlate
        let start = Instant::now();
        let engine = CorrelationEngine::new(self.config.reference_threshold)
            .map_err(|e| e.in_stage("correlate"))?;
        let correlation = engine.correlate(&extraction.mentions, &records, &pattern);
        timings.correlate_secs = start.elapsed().as_secs_f64();

        // Summarize
        let start = Instant::now();
        let mut dispatch = DispatchConfig::new(self.config.model.as_str());
        dispatch.concurrency = self.config.summary_concurrency;
        let dispatcher = Dispatcher::new(Arc::clone(&self.collaborators.registry), dispatch);
        let summarized = dispatcher
            .run(correlation.rows.clone())
            .await
            .map_err(|e| e.in_stage("summarize"))?;
        timings.summarize_secs = start.elapsed().as_secs_f64();

        let artifact = scratch.path().join("correlation.json");
        self.write_scratch_json(scratch.path(), "correlation.json", &summarized.rows)?;

        // Deliver (best-effort)
        let mut delivered = false;
        if let Some(deliverer) = &self.collaborators.deliverer {
            let start = Instant::now();
            let meta = DeliveryMetadata {
                run_id,
                started_at,
                recording_id: acquired.recording_id.clone(),
                row_count: summarized.rows.len(),
                recipient: self.config.recipient.clone(),
            };
            match deliverer.deliver(&artifact, &meta).await {
                Ok(()) => {
                    delivered = true;
                    info!("artifact delivered");
                }
                Err(e) => warn!("delivery failed, artifact stands: {e:#}"),
            }
            timings.deliver_secs = start.elapsed().as_secs_f64();
        }

        let artifact_path = if self.config.retain_intermediates {
            Some(self.retain_scratch(scratch.path(), run_id).await?)
        } else {
            None
        };
        // TempDir drop removes whatever is left in the scratch workspace.
        drop(scratch);

        info!("run {} finished: {}", run_id, timings);
        Ok(PipelineReport {
            run_id,
            started_at,
            recording_id: acquired.recording_id,
            rows: summarized.rows,
            correlation: CorrelationReport {
                rows: Vec::new(),
                ..correlation
            },
            timings,
            summarize_failed_rows: summarized.failed_rows,
            delivered,
            artifact_path,
        })
    }

    fn write_scratch_json<T: Serialize>(&self, scratch: &Path, name: &str, value: &T) -> Result<()> {
        let path = scratch.join(name);
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| PipelineError::Inconsistency(format!("serializing {name}: {e}")))?;
        std::fs::write(&path, json)?;
        debug!("wrote {}", path.display());
        Ok(())
    }

    /// Move scratch contents into the durable output directory.
    async fn retain_scratch(&self, scratch: &Path, run_id: Uuid) -> Result<PathBuf> {
        let dest_dir = self.config.output_dir.join(format!("run-{run_id}"));
        tokio::fs::create_dir_all(&dest_dir).await?;
        let mut entries = tokio::fs::read_dir(scratch).await?;
        let mut artifact = dest_dir.join("correlation.json");
        while let Some(entry) = entries.next_entry().await? {
            let dest = dest_dir.join(entry.file_name());
            // Rename can cross filesystems between tmp and output; fall back
            // to copy + remove.
            if tokio::fs::rename(entry.path(), &dest).await.is_err() {
                tokio::fs::copy(entry.path(), &dest).await?;
                tokio::fs::remove_file(entry.path()).await?;
            }
            if entry.file_name() == "correlation.json" {
                artifact = dest;
            }
        }
        info!("intermediates retained under {}", dest_dir.display());
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Detection, SpeechSegment};
    use crate::summarize::ProviderId;
    use crate::summarize::Summarize;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NoFetch;

    #[async_trait]
    impl Fetch for NoFetch {
        async fn fetch(&self, _remote_id: &str, _dest: &Path) -> anyhow::Result<()> {
            anyhow::bail!("no remote fetch in tests")
        }
    }

    struct FakeTranscriber {
        segments: Vec<SpeechSegment>,
    }

    #[async_trait]
    impl Transcribe for FakeTranscriber {
        async fn transcribe(&self, _media: &Path) -> anyhow::Result<Vec<SpeechSegment>> {
            Ok(self.segments.clone())
        }
    }

    struct FakeDetector {
        detections: Vec<Detection>,
        fail: bool,
    }

    #[async_trait]
    impl Detect for FakeDetector {
        async fn detect(&self, _media: &Path) -> anyhow::Result<Vec<Detection>> {
            if self.fail {
                anyhow::bail!("detector model unavailable")
            }
            Ok(self.detections.clone())
        }
    }

    struct FakeVersions {
        records: Vec<VersionRecord>,
    }

    #[async_trait]
    impl LoadVersions for FakeVersions {
        async fn load(&self) -> anyhow::Result<Vec<VersionRecord>> {
            Ok(self.records.clone())
        }
    }

    struct FixedSummary;

    #[async_trait]
    impl Summarize for FixedSummary {
        async fn summarize(&self, _prompt: &str, _model: &str) -> anyhow::Result<String> {
            Ok("looks good, minor notes".to_string())
        }
    }

    struct CountingDeliverer {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Deliver for CountingDeliverer {
        async fn deliver(&self, artifact: &Path, meta: &DeliveryMetadata) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(artifact.exists());
            assert!(meta.row_count > 0);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("smtp unreachable")
            }
            Ok(())
        }
    }

    fn registry() -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderId::Ollama, &["llama"], Arc::new(FixedSummary));
        Arc::new(registry)
    }

    fn media_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("review.mp4");
        std::fs::write(&path, b"fake media").unwrap();
        path
    }

    fn config(media: &Path, output_dir: &Path) -> PipelineConfig {
        PipelineConfig {
            source: RecordingSource::parse(media.to_str().unwrap()),
            version_pattern: r"v\d{3}".to_string(),
            reference_threshold: 30.0,
            model: "llama3".to_string(),
            summary_concurrency: 2,
            parallel_extraction: false,
            force_refresh: false,
            retain_intermediates: false,
            output_dir: output_dir.to_path_buf(),
            recipient: None,
        }
    }

    fn collaborators(deliverer: Option<Arc<dyn Deliver>>) -> Collaborators {
        Collaborators {
            fetcher: Arc::new(NoFetch),
            transcriber: Arc::new(FakeTranscriber {
                segments: vec![
                    SpeechSegment {
                        timestamp: 10.0,
                        text: "let's look at v001 first".to_string(),
                        speaker: Some("sup".to_string()),
                    },
                    SpeechSegment {
                        timestamp: 40.0,
                        text: "compare with v002".to_string(),
                        speaker: None,
                    },
                ],
            }),
            detector: Arc::new(FakeDetector {
                detections: vec![Detection {
                    timestamp: 12.0,
                    version_id: "v001".to_string(),
                }],
                fail: false,
            }),
            versions: Arc::new(FakeVersions {
                records: vec![
                    VersionRecord::new("v001", "sh010", "first pass"),
                    VersionRecord::new("v002", "sh020", ""),
                    VersionRecord::new("v003", "sh030", "not shown"),
                ],
            }),
            registry: registry(),
            deliverer,
        }
    }

    #[tokio::test]
    async fn test_run_produces_rows_summaries_and_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_fixture(tmp.path());
        let cache = Arc::new(MediaCache::new(tmp.path().join("cache")));

        let pipeline = Pipeline::new(
            config(&media, &tmp.path().join("out")),
            collaborators(None),
            cache,
        );
        let report = pipeline.run().await.unwrap();

        // v001 and v002 mentioned, v003 leftover.
        assert_eq!(report.rows.len(), 3);
        assert_eq!(report.rows[0].version_id, "v001");
        assert_eq!(report.rows[1].version_id, "v002");
        assert_eq!(report.rows[2].version_id, "v003");
        assert!(report.rows[0].summary.is_some());
        assert!(report.rows[2].summary.is_none());
        assert_eq!(report.summarize_failed_rows, 0);
        assert!(!report.delivered);
        assert!(report.artifact_path.is_none());
        assert!(report.timings.total_secs() >= 0.0);
    }

    #[tokio::test]
    async fn test_retain_intermediates_moves_artifact_to_output() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_fixture(tmp.path());
        let cache = Arc::new(MediaCache::new(tmp.path().join("cache")));

        let mut cfg = config(&media, &tmp.path().join("out"));
        cfg.retain_intermediates = true;
        let pipeline = Pipeline::new(cfg, collaborators(None), cache);
        let report = pipeline.run().await.unwrap();

        let artifact = report.artifact_path.unwrap();
        assert!(artifact.exists());
        assert!(artifact.starts_with(tmp.path().join("out")));
        let rows: Vec<CorrelationRow> =
            serde_json::from_str(&std::fs::read_to_string(&artifact).unwrap()).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_best_effort() {
        let tmp = tempfile::tempdir().unwrap();
        let media = media_fixture(tmp.path());
        let cache = Arc::new(MediaCache::new(tmp.path().join("cache")));
        let deliverer = Arc::new(CountingDeliverer {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        });

        let pipeline = Pipeline::new(
            config(&media, &tmp.path().join("out")),
            collaborators(Some(deliverer.clone())),
            cache,
        );
        let report = pipeline.run().await.unwrap();

        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 1);
        assert!(!report.delivered);
        assert_eq!(report.rows.len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_stage_failure_names_stage() {
        struct BrokenTranscriber;

        #[async_trait]
        impl Transcribe for BrokenTranscriber {
            async fn transcribe(&self, _media: &Path) -> anyhow::Result<Vec<SpeechSegment>> {
                anyhow::bail!("stt backend offline")
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let media = media_fixture(tmp.path());
        let cache = Arc::new(MediaCache::new(tmp.path().join("cache")));
        let mut collabs = collaborators(None);
        collabs.transcriber = Arc::new(BrokenTranscriber);

        let pipeline = Pipeline::new(config(&media, &tmp.path().join("out")), collabs, cache);
        let err = pipeline.run().await.unwrap_err();
        assert_eq!(err.stage(), Some("extract"));
    }

    #[tokio::test]
    async fn test_missing_media_fails_in_acquire() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::new(tmp.path().join("cache")));
        let missing = tmp.path().join("nope.mp4");

        let pipeline = Pipeline::new(
            config(&missing, &tmp.path().join("out")),
            collaborators(None),
            cache,
        );
        let err = pipeline.run().await.unwrap_err();
        assert_eq!(err.stage(), Some("acquire"));
    }
}
