use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::protocol::{CorrelationRow, MentionPattern, TranscriptMention, VersionRecord};
use crate::{PipelineError, Result};

/// Output of the correlation engine: the ordered rows plus the non-fatal
/// accounting the run report surfaces.
#[derive(Debug, Clone, Default)]
pub struct CorrelationReport {
    /// One row per distinct version id, mentioned rows first (in order of
    /// first mention), then leftovers
    pub rows: Vec<CorrelationRow>,
    /// Total mentions walked
    pub mention_count: usize,
    /// Mentions whose id failed the extraction pattern (dropped)
    pub dropped_mentions: usize,
    /// Mentions of ids absent from the tracking records (no row produced)
    pub orphan_mentions: usize,
    /// Records whose normalized id collided; resolved last-write-wins
    pub duplicate_overrides: usize,
    /// Tracked versions never mentioned in the session
    pub leftover_count: usize,
}

/// Merges chronological transcript mentions with tracked version records.
///
/// Walks mentions in order, keeping a last-seen timestamp per version.
/// Versions whose previous mention falls within the reference threshold of
/// the current one are recorded as reference versions on the current
/// mention's row. Repeated mentions of an already-rowed version update that
/// same row: its conversation grows and in-window references are added
/// retroactively. Tracked versions never mentioned are appended afterwards
/// as contextless leftover rows.
pub struct CorrelationEngine {
    threshold_secs: f64,
}

impl CorrelationEngine {
    /// Create an engine with the given reference threshold in seconds.
    pub fn new(threshold_secs: f64) -> Result<Self> {
        if !threshold_secs.is_finite() || threshold_secs < 0.0 {
            return Err(PipelineError::Config(format!(
                "reference threshold must be a non-negative duration, got {threshold_secs}"
            )));
        }
        Ok(Self { threshold_secs })
    }

    pub fn threshold_secs(&self) -> f64 {
        self.threshold_secs
    }

    pub fn correlate(
        &self,
        mentions: &[TranscriptMention],
        records: &[VersionRecord],
        pattern: &MentionPattern,
    ) -> CorrelationReport {
        let mut report = CorrelationReport {
            mention_count: mentions.len(),
            ..Default::default()
        };

        let lookup = self.build_lookup(records, pattern, &mut report);

        let mut rows: Vec<CorrelationRow> = Vec::new();
        let mut row_index: HashMap<String, usize> = HashMap::new();
        let mut last_seen: HashMap<String, f64> = HashMap::new();

        for mention in mentions {
            let Some(id) = pattern.extract(&mention.version_id) else {
                report.dropped_mentions += 1;
                debug!(
                    "dropping mention at {:.1}s: id {:?} fails the extraction pattern",
                    mention.timestamp, mention.version_id
                );
                continue;
            };
            let t = mention.timestamp;

            let row_at = match row_index.get(&id) {
                Some(&idx) => {
                    if let Some(line) = mention.dialogue() {
                        rows[idx].push_dialogue(&line);
                    }
                    Some(idx)
                }
                None => match lookup.get(&id) {
                    Some(record) => {
                        let mut row = CorrelationRow::mentioned(id.clone(), record, t);
                        if let Some(line) = mention.dialogue() {
                            row.push_dialogue(&line);
                        }
                        let idx = rows.len();
                        rows.push(row);
                        row_index.insert(id.clone(), idx);
                        Some(idx)
                    }
                    None => {
                        report.orphan_mentions += 1;
                        debug!("orphan mention of {} at {:.1}s: no tracked record", id, t);
                        None
                    }
                },
            };

            // Reference detection: versions whose previous mention falls
            // within (0, threshold] of this one. Orphans keep updating the
            // last-seen map so they can still surface as references.
            if let Some(idx) = row_at {
                for (other, &seen_at) in &last_seen {
                    if *other == id {
                        continue;
                    }
                    let gap = t - seen_at;
                    if gap > 0.0 && gap <= self.threshold_secs {
                        rows[idx].reference_versions.insert(other.clone());
                    }
                }
            }

            last_seen.insert(id, t);
        }

        self.append_leftovers(&lookup, &row_index, &mut rows, &mut report);

        info!(
            "correlated {} mentions into {} rows ({} leftover, {} orphan, {} dropped)",
            report.mention_count,
            rows.len(),
            report.leftover_count,
            report.orphan_mentions,
            report.dropped_mentions
        );

        report.rows = rows;
        report
    }

    /// Build the normalized-id lookup. Records whose ids normalize to the
    /// same key resolve last-write-wins; the collision is warned and counted,
    /// never fatal.
    fn build_lookup(
        &self,
        records: &[VersionRecord],
        pattern: &MentionPattern,
        report: &mut CorrelationReport,
    ) -> HashMap<String, VersionRecord> {
        let mut lookup: HashMap<String, VersionRecord> = HashMap::new();
        for record in records {
            let key = pattern
                .extract(&record.version_id)
                .unwrap_or_else(|| record.version_id.clone());
            if let Some(previous) = lookup.insert(key.clone(), record.clone()) {
                report.duplicate_overrides += 1;
                warn!(
                    "duplicate version id {key}: record {:?} overrides {:?}",
                    record.version_id, previous.version_id
                );
            }
        }
        lookup
    }

    fn append_leftovers(
        &self,
        lookup: &HashMap<String, VersionRecord>,
        row_index: &HashMap<String, usize>,
        rows: &mut Vec<CorrelationRow>,
        report: &mut CorrelationReport,
    ) {
        let mut leftover_ids: Vec<&String> = lookup
            .keys()
            .filter(|id| !row_index.contains_key(*id))
            .collect();
        leftover_ids.sort_by(|a, b| leftover_order(a, b));

        report.leftover_count = leftover_ids.len();
        for id in leftover_ids {
            rows.push(CorrelationRow::leftover(id.clone(), &lookup[id]));
        }
    }
}

/// Leftover ordering: fully numeric ids sort by numeric value and precede
/// non-numeric ids, which sort lexically.
fn leftover_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
