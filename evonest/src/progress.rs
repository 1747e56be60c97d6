//! Progress statistics.
//!
//! Per-mutation success counters and global totals, updated after every
//! cycle. The counters are a pure function of history, so on startup they
//! can be recomputed from scratch and reconciled — a crash between the
//! history append and the progress write then heals itself.

use chrono::Utc;
use tracing::warn;

use crate::error::EngineResult;
use crate::state::types::{CycleRecord, MutationStats, Outcome, ProgressState};
use crate::state::ProjectState;

/// Fold one finished cycle into the progress counters.
pub fn record_cycle(progress: &mut ProgressState, record: &CycleRecord) {
    progress.total_cycles += 1;
    if record.outcome == Outcome::Success {
        progress.total_successes += 1;
    }

    bump(
        progress.personas.entry(record.persona_id.clone()).or_default(),
        record,
    );
    if let Some(adv_id) = &record.adversarial_id {
        bump(
            progress.adversarials.entry(adv_id.clone()).or_default(),
            record,
        );
    }
    progress.updated_at = Some(Utc::now());
}

/// A skipped or aborted cycle counts as a use without a success or failure,
/// so it still resets the recency clock without moving the rates.
fn bump(stats: &mut MutationStats, record: &CycleRecord) {
    stats.uses += 1;
    match record.outcome {
        Outcome::Success => stats.successes += 1,
        Outcome::Failure => stats.failures += 1,
        Outcome::Skipped | Outcome::Aborted => {}
    }
    stats.last_used_cycle = Some(record.cycle_number);
}

/// Rebuild the history-derived part of the counters from scratch.
fn recompute(records: &[CycleRecord]) -> ProgressState {
    let mut fresh = ProgressState::default();
    for record in records {
        record_cycle(&mut fresh, record);
    }
    fresh
}

/// Consistency check run at engine start: when the persisted counters
/// disagree with history, history wins. Area/convergence tracking is kept
/// as persisted — the rolling windows are not reconstructible from records.
pub fn reconcile_with_history(state: &ProjectState) -> EngineResult<ProgressState> {
    let mut progress = state.read_progress()?;
    let records = state.read_history(usize::MAX)?;
    let derived = recompute(&records);

    let mismatch = progress.total_cycles != derived.total_cycles
        || progress.total_successes != derived.total_successes
        || progress.personas != derived.personas
        || progress.adversarials != derived.adversarials;

    if mismatch {
        warn!(
            persisted_cycles = progress.total_cycles,
            derived_cycles = derived.total_cycles,
            "progress counters disagree with history; recomputed from history"
        );
        progress.total_cycles = derived.total_cycles;
        progress.total_successes = derived.total_successes;
        progress.personas = derived.personas;
        progress.adversarials = derived.adversarials;
        state.write_progress(&progress)?;
    }

    Ok(progress)
}
