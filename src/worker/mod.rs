use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::pipeline::{Deliver, DeliveryMetadata, LoadVersions};
use crate::protocol::{Detection, SpeechSegment, VersionRecord};
use crate::stages::{Detect, Transcribe};
use crate::summarize::Summarize;

/// A configurable external command: program plus leading arguments.
///
/// Parsed from a single whitespace-split string, e.g.
/// `"uv run transcribe.py --word-timestamps"`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split_whitespace().map(str::to_string);
        let program = parts.next().context("empty command spec")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Run a command to completion, feeding `stdin_data` if given, returning
/// stdout as a string. Stderr is captured and logged line by line.
async fn run_command(spec: &CommandSpec, extra_args: &[&str], stdin_data: Option<&str>) -> Result<String> {
    let mut cmd = spec.command();
    cmd.args(extra_args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning {} {:?} {:?}", spec.program, spec.args, extra_args);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {}", spec.program))?;

    if let Some(data) = stdin_data {
        let mut stdin = child.stdin.take().context("child stdin unavailable")?;
        stdin
            .write_all(data.as_bytes())
            .await
            .context("writing to child stdin")?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("waiting for {}", spec.program))?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if !line.trim().is_empty() {
            warn!("{}: {}", spec.program, line);
        }
    }

    if !output.status.success() {
        bail!("{} exited with {}", spec.program, output.status);
    }
    Ok(String::from_utf8(output.stdout).context("child stdout was not utf-8")?)
}

/// Parse JSON-lines output, skipping blank lines.
fn parse_json_lines<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<Vec<T>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("parsing output line {}", i + 1))
        })
        .collect()
}

/// Speech-to-text over a spawned command. The command receives the media
/// path as its final argument and emits one JSON segment per line:
/// `{"timestamp": 12.5, "text": "...", "speaker": "..."}`.
pub struct CommandTranscriber {
    spec: CommandSpec,
}

impl CommandTranscriber {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Transcribe for CommandTranscriber {
    async fn transcribe(&self, media: &Path) -> Result<Vec<SpeechSegment>> {
        let media = media.to_str().context("media path is not utf-8")?;
        let stdout = run_command(&self.spec, &[media], None).await?;
        let mut segments: Vec<SpeechSegment> = parse_json_lines(&stdout)?;
        // Downstream requires chronological order; sort defensively since
        // external tools occasionally emit out-of-order segments.
        segments.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(segments)
    }
}

/// Visual version-id detection over a spawned command, JSON lines of
/// `{"timestamp": 31.0, "version_id": "..."}`.
pub struct CommandDetector {
    spec: CommandSpec,
}

impl CommandDetector {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Detect for CommandDetector {
    async fn detect(&self, media: &Path) -> Result<Vec<Detection>> {
        let media = media.to_str().context("media path is not utf-8")?;
        let stdout = run_command(&self.spec, &[media], None).await?;
        let mut detections: Vec<Detection> = parse_json_lines(&stdout)?;
        detections.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(detections)
    }
}

/// LLM generation over a spawned command: prompt on stdin, `--model <name>`
/// appended, summary text on stdout.
pub struct CommandSummarizer {
    spec: CommandSpec,
}

impl CommandSummarizer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Summarize for CommandSummarizer {
    async fn summarize(&self, prompt: &str, model: &str) -> Result<String> {
        let stdout = run_command(&self.spec, &["--model", model], Some(prompt)).await?;
        let summary = stdout.trim();
        if summary.is_empty() {
            bail!("summarizer produced no output");
        }
        Ok(summary.to_string())
    }
}

/// Delivery over a spawned command: artifact path and recipient as args.
pub struct CommandDeliverer {
    spec: CommandSpec,
}

impl CommandDeliverer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Deliver for CommandDeliverer {
    async fn deliver(&self, artifact: &Path, meta: &DeliveryMetadata) -> Result<()> {
        let artifact = artifact.to_str().context("artifact path is not utf-8")?;
        let mut args = vec![artifact];
        if let Some(recipient) = &meta.recipient {
            args.push("--recipient");
            args.push(recipient);
        }
        run_command(&self.spec, &args, None).await?;
        Ok(())
    }
}

/// Loads version records from a JSON file: an array of objects with
/// `version_id`, `shot`, `notes` and arbitrary extra string fields.
pub struct JsonVersionSource {
    path: PathBuf,
}

impl JsonVersionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LoadVersions for JsonVersionSource {
    async fn load(&self) -> Result<Vec<VersionRecord>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading versions file {}", self.path.display()))?;
        let records: Vec<VersionRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing versions file {}", self.path.display()))?;
        Ok(records)
    }
}
