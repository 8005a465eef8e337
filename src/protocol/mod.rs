use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// A recording source: either a local media file or a remote identifier.
///
/// Created once per pipeline run and destroyed with the scratch workspace.
/// The resolved local path is filled in by the acquisition stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSource {
    /// The raw caller-supplied input (path or URL/remote id)
    pub input: String,
    /// The remote identifier, when the input is not a local path
    pub remote_id: Option<String>,
    /// Local media path once acquired
    pub local_path: Option<PathBuf>,
    /// Whether the media was served from the acquisition cache
    pub cached: bool,
}

impl RecordingSource {
    /// Parse a caller-supplied input string into a source.
    ///
    /// Inputs with an `http://` or `https://` scheme are treated as remote;
    /// everything else is taken to be a local path.
    pub fn parse(input: &str) -> Self {
        let remote_id = if input.starts_with("http://") || input.starts_with("https://") {
            Some(input.to_string())
        } else {
            None
        };

        Self {
            input: input.to_string(),
            remote_id,
            local_path: None,
            cached: false,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Stable cache key derived from the remote identifier.
    ///
    /// Remote ids map to the same key on every run: the identifier is
    /// sanitized to a filesystem-safe string, preserving length so distinct
    /// ids stay distinct. Local sources have no cache key.
    pub fn cache_key(&self) -> Option<String> {
        self.remote_id.as_ref().map(|id| {
            id.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect()
        })
    }

    /// Mark the source as resolved to a local media file.
    pub fn resolve(&mut self, path: &Path, cached: bool) {
        self.local_path = Some(path.to_path_buf());
        self.cached = cached;
    }
}

/// A timestamped occurrence of a version identifier in the transcript or
/// visual stream.
///
/// Sequences of mentions are chronologically ordered (collaborator
/// contract, relied upon by the correlation engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMention {
    /// Version identifier as captured (normalized later by the engine)
    pub version_id: String,
    /// Offset into the recording, in seconds
    pub timestamp: f64,
    /// Surrounding dialogue, when derived from the transcript
    pub text: Option<String>,
    /// Speaker attribution, when available
    pub speaker: Option<String>,
}

impl TranscriptMention {
    pub fn new(version_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            version_id: version_id.into(),
            timestamp,
            text: None,
            speaker: None,
        }
    }

    pub fn with_text(version_id: impl Into<String>, timestamp: f64, text: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            timestamp,
            text: Some(text.into()),
            speaker: None,
        }
    }

    /// The dialogue line for this mention, with speaker attribution when known.
    pub fn dialogue(&self) -> Option<String> {
        self.text.as_ref().map(|text| match &self.speaker {
            Some(speaker) => format!("{}: {}", speaker, text),
            None => text.clone(),
        })
    }
}

/// A timestamped transcript segment before version-id extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSegment {
    pub timestamp: f64,
    pub text: String,
    pub speaker: Option<String>,
}

/// A version identifier detected in the visual stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub timestamp: f64,
    pub version_id: String,
}

/// Authoritative version record from the tracking system.
///
/// Loaded once per run and immutable thereafter. `version_id` holds the raw
/// version-column value; the correlation engine normalizes it through the
/// extraction pattern when building its lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_id: String,
    pub shot: String,
    pub notes: String,
    /// Arbitrary pass-through fields from the tracking system
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

impl VersionRecord {
    pub fn new(
        version_id: impl Into<String>,
        shot: impl Into<String>,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            version_id: version_id.into(),
            shot: shot.into(),
            notes: notes.into(),
            extra: HashMap::new(),
        }
    }
}

/// One row of the final correlated artifact: one per distinct version across
/// the mentioned and leftover sets.
///
/// Produced once by the correlation engine; only the summarization
/// dispatcher mutates a row afterwards, to attach `summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRow {
    /// Normalized version identifier (unique within the artifact)
    pub version_id: String,
    pub shot: String,
    /// Raw value of the caller-configured version column
    pub version_value: String,
    pub notes: String,
    /// Dialogue captured around the version's mentions; empty for leftovers
    pub conversation: String,
    /// Timestamp of the first mention, in seconds; `None` for leftovers
    pub timestamp: Option<f64>,
    /// Versions discussed within the reference threshold of this one
    pub reference_versions: BTreeSet<String>,
    /// AI-generated summary, attached by the dispatcher
    pub summary: Option<String>,
}

impl CorrelationRow {
    /// Row seeded from a record at its first mention.
    pub fn mentioned(version_id: impl Into<String>, record: &VersionRecord, timestamp: f64) -> Self {
        Self {
            version_id: version_id.into(),
            shot: record.shot.clone(),
            version_value: record.version_id.clone(),
            notes: record.notes.clone(),
            conversation: String::new(),
            timestamp: Some(timestamp),
            reference_versions: BTreeSet::new(),
            summary: None,
        }
    }

    /// Contextless row for a tracked version never mentioned in the session.
    pub fn leftover(version_id: impl Into<String>, record: &VersionRecord) -> Self {
        Self {
            version_id: version_id.into(),
            shot: record.shot.clone(),
            version_value: record.version_id.clone(),
            notes: record.notes.clone(),
            conversation: String::new(),
            timestamp: None,
            reference_versions: BTreeSet::new(),
            summary: None,
        }
    }

    /// Append a dialogue line to the row's conversation.
    pub fn push_dialogue(&mut self, line: &str) {
        if !self.conversation.is_empty() {
            self.conversation.push('\n');
        }
        self.conversation.push_str(line);
    }
}

/// Compiled caller-supplied version-id extraction pattern.
///
/// Extraction takes the first capture group when the pattern defines one,
/// otherwise the whole match.
#[derive(Debug, Clone)]
pub struct MentionPattern {
    regex: Regex,
}

impl MentionPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Extract a version id from raw text, or `None` when the pattern does
    /// not match.
    pub fn extract(&self, text: &str) -> Option<String> {
        self.regex.captures(text).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parse_local_and_remote() {
        let local = RecordingSource::parse("/media/review.mp4");
        assert!(!local.is_remote());
        assert_eq!(local.cache_key(), None);

        let remote = RecordingSource::parse("https://drive.example.com/f/abc123");
        assert!(remote.is_remote());
        let key = remote.cache_key().unwrap();
        assert!(!key.contains('/'));
        assert!(!key.contains(':'));
        assert!(key.contains("abc123"));
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = RecordingSource::parse("https://host/a");
        let b = RecordingSource::parse("https://host/b");
        assert_eq!(a.cache_key(), RecordingSource::parse("https://host/a").cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_mention_dialogue_formatting() {
        let mut mention = TranscriptMention::with_text("v001", 12.0, "looks too dark");
        assert_eq!(mention.dialogue().unwrap(), "looks too dark");
        mention.speaker = Some("JD".to_string());
        assert_eq!(mention.dialogue().unwrap(), "JD: looks too dark");
        assert_eq!(TranscriptMention::new("v001", 12.0).dialogue(), None);
    }

    #[test]
    fn test_pattern_extracts_whole_match() {
        let pattern = MentionPattern::new(r"v\d{3}").unwrap();
        assert_eq!(pattern.extract("let's look at v042 next"), Some("v042".to_string()));
        assert_eq!(pattern.extract("no versions here"), None);
    }

    #[test]
    fn test_pattern_prefers_capture_group() {
        let pattern = MentionPattern::new(r"shot_\w+_v(\d+)").unwrap();
        assert_eq!(pattern.extract("shot_sh010_v12"), Some("12".to_string()));
    }

    #[test]
    fn test_row_push_dialogue() {
        let record = VersionRecord::new("v001", "sh010", "notes");
        let mut row = CorrelationRow::mentioned("v001", &record, 10.0);
        row.push_dialogue("JD: first pass");
        row.push_dialogue("AM: agreed");
        assert_eq!(row.conversation, "JD: first pass\nAM: agreed");
        assert_eq!(row.timestamp, Some(10.0));
    }

    #[test]
    fn test_leftover_row_shape() {
        let record = VersionRecord::new("v007", "sh070", "hold for comp");
        let row = CorrelationRow::leftover("v007", &record);
        assert_eq!(row.notes, "hold for comp");
        assert!(row.conversation.is_empty());
        assert_eq!(row.timestamp, None);
        assert!(row.reference_versions.is_empty());
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let mut record = VersionRecord::new("v001", "sh010", "n");
        record.extra.insert("artist".to_string(), "rd".to_string());
        let json = serde_json::to_string(&record).unwrap();
        let back: VersionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version_id, "v001");
        assert_eq!(back.extra.get("artist").map(String::as_str), Some("rd"));
    }
}
