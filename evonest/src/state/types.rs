//! Persisted state types.
//!
//! Everything in this module is written into `.evonest/` as JSON by
//! [`crate::state::ProjectState`] and nowhere else.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of a cycle (or of a single phase within it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Skipped,
    Aborted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// The phases a cycle can run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    MetaObserve,
    Scout,
    Observe,
    Plan,
    Execute,
    Verify,
}

impl PhaseKind {
    /// Stable name used in artifacts, logs, and history records.
    pub fn name(self) -> &'static str {
        match self {
            Self::MetaObserve => "meta-observe",
            Self::Scout => "scout",
            Self::Observe => "observe",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Verify => "verify",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One phase's entry inside a [`CycleRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseKind,
    pub status: Outcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

/// Append-only history record for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub persona_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adversarial_id: Option<String>,
    pub phases: Vec<PhaseRecord>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
    /// Human-readable one-liner: persona, outcome, reason or SHA/PR.
    pub status_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Backlog item priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Backlog item lifecycle state.
///
/// Legal transitions: `pending → in_progress → {completed | pending}`, and
/// `pending → stale` after three failed attempts. Enforced in
/// [`crate::backlog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogStatus {
    Pending,
    InProgress,
    Completed,
    Stale,
}

/// One improvement candidate tracked across cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Free-form category: `test-coverage`, `bug`, `refactor`, `proposal`,
    /// `ecosystem`, …
    pub category: String,
    pub priority: Priority,
    pub status: BacklogStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub files: Vec<String>,
    pub created_cycle: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_cycle: Option<u64>,
}

/// Per-mutation usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationStats {
    #[serde(default)]
    pub uses: u64,
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_cycle: Option<u64>,
}

/// Aggregated engine progress, updated after every cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default)]
    pub personas: BTreeMap<String, MutationStats>,
    #[serde(default)]
    pub adversarials: BTreeMap<String, MutationStats>,
    /// Directory → number of successful-Execute touches.
    #[serde(default)]
    pub area_touch_counts: BTreeMap<String, u64>,
    /// Directory → rolling window (≤ 3) of whether the touch committed
    /// cleanly. Oldest first.
    #[serde(default)]
    pub area_recent_outcomes: BTreeMap<String, Vec<bool>>,
    /// Directories the convergence detector has flagged.
    #[serde(default)]
    pub converged_areas: BTreeSet<String>,
    #[serde(default)]
    pub total_cycles: u64,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Strategic direction emitted by the meta-observe gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviceRecord {
    pub cycle: u64,
    pub direction: String,
    #[serde(default)]
    pub focus: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A deduplication key for scout findings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoutKey {
    pub source_url: String,
    pub title: String,
}

impl ScoutKey {
    pub fn new(source_url: &str, title: &str) -> Self {
        Self {
            source_url: source_url.trim().to_string(),
            title: title.trim().to_string(),
        }
    }
}

/// Findings already surfaced by the scout gate, across all cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoutCache {
    #[serde(default)]
    pub entries: BTreeSet<ScoutKey>,
}

impl ScoutCache {
    pub fn contains(&self, key: &ScoutKey) -> bool {
        self.entries.contains(key)
    }

    /// Returns `true` if the key was new.
    pub fn insert(&mut self, key: ScoutKey) -> bool {
        self.entries.insert(key)
    }
}

/// Cached project-tree inventory, used for observe turn scaling and the
/// ecosystem section of the observe prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub scanned_cycle: u64,
    pub scanned_at: DateTime<Utc>,
    pub file_count: usize,
    #[serde(default)]
    pub files_by_extension: BTreeMap<String, usize>,
    #[serde(default)]
    pub build_files: Vec<String>,
    #[serde(default)]
    pub top_level_dirs: Vec<String>,
}

/// Externalized continuation written by a cautious run after Plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CautiousResume {
    pub cycle_number: u64,
    pub plan_artifact_path: String,
    pub persona_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adversarial_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Outcome::Success).unwrap(), "\"success\"");
        assert_eq!(
            serde_json::to_string(&PhaseKind::MetaObserve).unwrap(),
            "\"meta_observe\""
        );
    }

    #[test]
    fn scout_cache_dedupes_on_trimmed_pair() {
        let mut cache = ScoutCache::default();
        assert!(cache.insert(ScoutKey::new("https://a", " Title ")));
        assert!(!cache.insert(ScoutKey::new("https://a", "Title")));
        assert!(cache.insert(ScoutKey::new("https://b", "Title")));
    }

    #[test]
    fn progress_round_trips() {
        let mut progress = ProgressState::default();
        progress
            .personas
            .insert("tester".into(), MutationStats { uses: 3, successes: 2, failures: 1, last_used_cycle: Some(4) });
        progress.area_touch_counts.insert("src/foo".into(), 3);
        progress.converged_areas.insert("src/foo".into());

        let json = serde_json::to_string(&progress).unwrap();
        let back: ProgressState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.personas["tester"].successes, 2);
        assert!(back.converged_areas.contains("src/foo"));
    }
}
