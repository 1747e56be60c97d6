//! Backlog lifecycle.
//!
//! Items are appended by the observe phase (deduplicated by normalized title
//! within the same area), transitioned by the orchestrator, and pruned after
//! they finish. They are never deleted any other way.

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::state::slugify;
use crate::state::types::{BacklogItem, BacklogStatus, Priority};

/// Failed attempts before a pending item is shelved as stale.
pub const MAX_ATTEMPTS: u32 = 3;

/// Completed / stale items are pruned this many cycles after they finished.
pub const PRUNE_AFTER_CYCLES: u64 = 20;

/// The legal edges of the backlog state machine.
pub fn is_legal_transition(from: BacklogStatus, to: BacklogStatus) -> bool {
    use BacklogStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress) | (InProgress, Completed) | (InProgress, Pending) | (Pending, Stale)
    )
}

/// Apply a transition, rejecting illegal edges.
pub fn transition(item: &mut BacklogItem, to: BacklogStatus) -> EngineResult<()> {
    if !is_legal_transition(item.status, to) {
        return Err(EngineError::InvalidTransition {
            from: format!("{:?}", item.status),
            to: format!("{to:?}"),
        });
    }
    debug!(id = %item.id, from = ?item.status, to = ?to, "backlog transition");
    item.status = to;
    Ok(())
}

/// Titles compare case-insensitively with whitespace and punctuation
/// collapsed.
pub fn normalized_title(title: &str) -> String {
    title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Area an item belongs to: the parent directory of its first file, or ""
/// for items with no file attribution.
fn item_area(files: &[String]) -> String {
    files
        .first()
        .map(|f| {
            std::path::Path::new(f)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

/// A new improvement candidate from the observe envelope.
#[derive(Debug, Clone)]
pub struct ImprovementCandidate {
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: Priority,
    pub files: Vec<String>,
}

/// Merge observe output into the backlog. Candidates whose normalized title
/// already exists in the same area (on a live item) are dropped. Returns how
/// many were added.
pub fn merge_improvements(
    backlog: &mut Vec<BacklogItem>,
    candidates: Vec<ImprovementCandidate>,
    cycle: u64,
) -> usize {
    let mut added = 0;
    for candidate in candidates {
        let key = (normalized_title(&candidate.title), item_area(&candidate.files));
        let duplicate = backlog.iter().any(|item| {
            matches!(item.status, BacklogStatus::Pending | BacklogStatus::InProgress)
                && (normalized_title(&item.title), item_area(&item.files)) == key
        });
        if duplicate {
            debug!(title = %candidate.title, "duplicate improvement dropped");
            continue;
        }
        let id = unique_id(backlog, &candidate.title);
        backlog.push(BacklogItem {
            id,
            title: candidate.title,
            description: candidate.description,
            category: candidate.category,
            priority: candidate.priority,
            status: BacklogStatus::Pending,
            attempts: 0,
            files: candidate.files,
            created_cycle: cycle,
            last_attempt_cycle: None,
        });
        added += 1;
    }
    if added > 0 {
        info!(added, cycle, "backlog extended");
    }
    added
}

fn unique_id(backlog: &[BacklogItem], title: &str) -> String {
    let base = slugify(title);
    if !backlog.iter().any(|item| item.id == base) {
        return base;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base}-{counter}");
        if !backlog.iter().any(|item| item.id == candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Mark an item picked by Plan: in-progress plus an attempt stamp.
pub fn begin_attempt(item: &mut BacklogItem, cycle: u64) -> EngineResult<()> {
    transition(item, BacklogStatus::InProgress)?;
    item.attempts += 1;
    item.last_attempt_cycle = Some(cycle);
    Ok(())
}

/// Record a failed attempt: back to pending, or stale once the attempt
/// budget is spent.
pub fn fail_attempt(item: &mut BacklogItem) -> EngineResult<()> {
    transition(item, BacklogStatus::Pending)?;
    if item.attempts >= MAX_ATTEMPTS {
        transition(item, BacklogStatus::Stale)?;
        info!(id = %item.id, attempts = item.attempts, "backlog item went stale");
    }
    Ok(())
}

/// Remove finished items that have sat for [`PRUNE_AFTER_CYCLES`]. Returns
/// how many were pruned.
pub fn prune(backlog: &mut Vec<BacklogItem>, current_cycle: u64) -> usize {
    let before = backlog.len();
    backlog.retain(|item| {
        if !matches!(item.status, BacklogStatus::Completed | BacklogStatus::Stale) {
            return true;
        }
        let finished = item.last_attempt_cycle.unwrap_or(item.created_cycle);
        current_cycle.saturating_sub(finished) <= PRUNE_AFTER_CYCLES
    });
    let pruned = before - backlog.len();
    if pruned > 0 {
        debug!(pruned, current_cycle, "backlog pruned");
    }
    pruned
}

/// Highest-priority, then oldest, pending item.
pub fn next_pending(backlog: &[BacklogItem]) -> Option<&BacklogItem> {
    backlog
        .iter()
        .filter(|item| item.status == BacklogStatus::Pending)
        .min_by_key(|item| (item.priority, item.created_cycle, item.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, files: &[&str]) -> ImprovementCandidate {
        ImprovementCandidate {
            title: title.into(),
            description: "desc".into(),
            category: "bug".into(),
            priority: Priority::Medium,
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn state_machine_edges() {
        use BacklogStatus::*;
        assert!(is_legal_transition(Pending, InProgress));
        assert!(is_legal_transition(InProgress, Completed));
        assert!(is_legal_transition(InProgress, Pending));
        assert!(is_legal_transition(Pending, Stale));
        assert!(!is_legal_transition(Completed, Pending));
        assert!(!is_legal_transition(Stale, InProgress));
        assert!(!is_legal_transition(Pending, Completed));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut backlog = Vec::new();
        merge_improvements(&mut backlog, vec![candidate("Fix parser", &[])], 1);
        let item = &mut backlog[0];
        assert!(transition(item, BacklogStatus::Completed).is_err());
        assert_eq!(item.status, BacklogStatus::Pending);
    }

    #[test]
    fn dedupe_by_title_within_area() {
        let mut backlog = Vec::new();
        let added = merge_improvements(
            &mut backlog,
            vec![
                candidate("Fix the Parser", &["src/parser/lex.rs"]),
                candidate("fix the parser!", &["src/parser/ast.rs"]),
                candidate("fix the parser!", &["docs/guide.md"]),
            ],
            1,
        );
        // Same title + same area collapses; same title in another area stays.
        assert_eq!(added, 2);
    }

    #[test]
    fn completed_items_do_not_block_new_duplicates() {
        let mut backlog = Vec::new();
        merge_improvements(&mut backlog, vec![candidate("Add tests", &[])], 1);
        begin_attempt(&mut backlog[0], 2).unwrap();
        transition(&mut backlog[0], BacklogStatus::Completed).unwrap();

        let added = merge_improvements(&mut backlog, vec![candidate("Add tests", &[])], 3);
        assert_eq!(added, 1);
        assert_ne!(backlog[0].id, backlog[1].id);
    }

    #[test]
    fn third_failure_goes_stale() {
        let mut backlog = Vec::new();
        merge_improvements(&mut backlog, vec![candidate("Flaky fix", &[])], 1);
        let item = &mut backlog[0];

        for cycle in 1..=2 {
            begin_attempt(item, cycle).unwrap();
            fail_attempt(item).unwrap();
            assert_eq!(item.status, BacklogStatus::Pending);
        }
        begin_attempt(item, 3).unwrap();
        fail_attempt(item).unwrap();
        assert_eq!(item.status, BacklogStatus::Stale);
        assert_eq!(item.attempts, 3);
    }

    #[test]
    fn prune_after_grace_period() {
        let mut backlog = Vec::new();
        merge_improvements(&mut backlog, vec![candidate("Done thing", &[])], 1);
        begin_attempt(&mut backlog[0], 5).unwrap();
        transition(&mut backlog[0], BacklogStatus::Completed).unwrap();
        merge_improvements(&mut backlog, vec![candidate("Live thing", &[])], 6);

        assert_eq!(prune(&mut backlog, 25), 0); // 20 cycles after 5 → kept
        assert_eq!(prune(&mut backlog, 26), 1);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].title, "Live thing");
    }

    #[test]
    fn next_pending_orders_by_priority_then_age() {
        let mut backlog = Vec::new();
        merge_improvements(
            &mut backlog,
            vec![ImprovementCandidate {
                priority: Priority::Low,
                ..candidate("old low", &[])
            }],
            1,
        );
        merge_improvements(
            &mut backlog,
            vec![ImprovementCandidate {
                priority: Priority::High,
                ..candidate("newer high", &[])
            }],
            5,
        );
        assert_eq!(next_pending(&backlog).unwrap().title, "newer high");
    }
}
