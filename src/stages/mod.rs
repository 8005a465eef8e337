use async_trait::async_trait;
use std::path::Path;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{Detection, MentionPattern, SpeechSegment, TranscriptMention};
use crate::{PipelineError, Result};

/// Speech-to-text collaborator. Returns chronologically ordered segments.
#[async_trait]
pub trait Transcribe: Send + Sync {
    async fn transcribe(&self, media: &Path) -> anyhow::Result<Vec<SpeechSegment>>;
}

/// Visual detection collaborator. Returns chronologically ordered detections
/// of version identifiers on screen.
#[async_trait]
pub trait Detect: Send + Sync {
    async fn detect(&self, media: &Path) -> anyhow::Result<Vec<Detection>>;
}

/// Timing for the extraction stage.
#[derive(Debug, Clone, Default)]
pub struct StageTiming {
    pub audio_secs: f64,
    pub visual_secs: f64,
    /// `max(audio, visual)` under concurrency, the sum when sequential
    pub elapsed_secs: f64,
    /// `(audio + visual) / elapsed`; present only in concurrent mode
    pub speedup: Option<f64>,
}

/// Output of the extraction stage: one chronologically ordered mention
/// sequence merged from the audio and visual streams.
#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub mentions: Vec<TranscriptMention>,
    pub timing: StageTiming,
    /// The visual sub-stage failed and contributed nothing (best-effort)
    pub detector_failed: bool,
}

/// Coordinates the transcription and visual-detection sub-stages.
///
/// Performs no CPU-bound work itself; it only awaits the underlying
/// collaborators, sequentially or concurrently per configuration. If one
/// sub-stage fails the other still runs to completion; the stage as a whole
/// fails only when the transcript is unusable.
pub struct StageScheduler {
    parallel: bool,
}

impl StageScheduler {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }

    pub async fn run(
        &self,
        media: &Path,
        pattern: &MentionPattern,
        transcriber: &dyn Transcribe,
        detector: &dyn Detect,
    ) -> Result<ExtractionOutput> {
        let (audio, visual, timing) = if self.parallel {
            self.run_parallel(media, transcriber, detector).await
        } else {
            self.run_sequential(media, transcriber, detector).await
        };

        let segments = audio.map_err(PipelineError::Collaborator)?;

        let (detections, detector_failed) = match visual {
            Ok(detections) => (detections, false),
            Err(e) => {
                warn!("visual detection failed, continuing with transcript only: {e:#}");
                (Vec::new(), true)
            }
        };

        let audio_mentions = extract_audio_mentions(&segments, pattern);
        let visual_mentions: Vec<TranscriptMention> = detections
            .iter()
            .map(|d| TranscriptMention::new(d.version_id.clone(), d.timestamp))
            .collect();

        debug!(
            "extracted {} audio mentions from {} segments, {} visual detections",
            audio_mentions.len(),
            segments.len(),
            visual_mentions.len()
        );

        if let Some(speedup) = timing.speedup {
            info!(
                "extraction done in {:.1}s (audio {:.1}s, visual {:.1}s, speedup {:.2}x)",
                timing.elapsed_secs, timing.audio_secs, timing.visual_secs, speedup
            );
        } else {
            info!(
                "extraction done in {:.1}s (audio {:.1}s, visual {:.1}s, sequential)",
                timing.elapsed_secs, timing.audio_secs, timing.visual_secs
            );
        }

        Ok(ExtractionOutput {
            mentions: merge_chronological(audio_mentions, visual_mentions),
            timing,
            detector_failed,
        })
    }

    async fn run_parallel(
        &self,
        media: &Path,
        transcriber: &dyn Transcribe,
        detector: &dyn Detect,
    ) -> (
        anyhow::Result<Vec<SpeechSegment>>,
        anyhow::Result<Vec<Detection>>,
        StageTiming,
    ) {
        // Both sub-stages start together; join awaits both even if one errors.
        let (audio, visual) = tokio::join!(
            timed(async { transcriber.transcribe(media).await }),
            timed(async { detector.detect(media).await }),
        );
        let (audio, audio_secs) = audio;
        let (visual, visual_secs) = visual;

        let elapsed_secs = audio_secs.max(visual_secs);
        let speedup = if elapsed_secs > 0.0 {
            Some((audio_secs + visual_secs) / elapsed_secs)
        } else {
            None
        };

        (
            audio,
            visual,
            StageTiming {
                audio_secs,
                visual_secs,
                elapsed_secs,
                speedup,
            },
        )
    }

    async fn run_sequential(
        &self,
        media: &Path,
        transcriber: &dyn Transcribe,
        detector: &dyn Detect,
    ) -> (
        anyhow::Result<Vec<SpeechSegment>>,
        anyhow::Result<Vec<Detection>>,
        StageTiming,
    ) {
        let (audio, audio_secs) = timed(async { transcriber.transcribe(media).await }).await;
        let (visual, visual_secs) = timed(async { detector.detect(media).await }).await;

        (
            audio,
            visual,
            StageTiming {
                audio_secs,
                visual_secs,
                elapsed_secs: audio_secs + visual_secs,
                speedup: None,
            },
        )
    }
}

async fn timed<T>(fut: impl std::future::Future<Output = T>) -> (T, f64) {
    let start = Instant::now();
    let out = fut.await;
    (out, start.elapsed().as_secs_f64())
}

/// Scan transcript segments with the extraction pattern; segments that name
/// a version become mentions carrying their dialogue, the rest are plain
/// conversation and contribute nothing.
fn extract_audio_mentions(
    segments: &[SpeechSegment],
    pattern: &MentionPattern,
) -> Vec<TranscriptMention> {
    segments
        .iter()
        .filter_map(|seg| {
            pattern.extract(&seg.text).map(|id| TranscriptMention {
                version_id: id,
                timestamp: seg.timestamp,
                text: Some(seg.text.clone()),
                speaker: seg.speaker.clone(),
            })
        })
        .collect()
}

/// Stable merge of two chronologically ordered mention runs. Ties keep the
/// audio mention first.
fn merge_chronological(
    audio: Vec<TranscriptMention>,
    visual: Vec<TranscriptMention>,
) -> Vec<TranscriptMention> {
    let mut merged = Vec::with_capacity(audio.len() + visual.len());
    let mut visual = visual.into_iter().peekable();
    for am in audio {
        while let Some(vm) = visual.next_if(|vm| vm.timestamp < am.timestamp) {
            merged.push(vm);
        }
        merged.push(am);
    }
    merged.extend(visual);
    merged
}
