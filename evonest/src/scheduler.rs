//! Adaptive mutation scheduling.
//!
//! Selection is weighted random over the enabled personas (plus a
//! probabilistic adversarial roll, orthogonal to persona choice). After
//! every cycle the weights of *all* mutations are recomputed from progress
//! statistics so the recency bonus stays consistent, then clamped to
//! [0.2, 3.0]. A convergence detector flags directories that keep getting
//! touched without producing a clean commit.

use rand::Rng;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::mutation::{clamp_weight, Adversarial, MutationCatalog, Persona};
use crate::state::touched_areas;
use crate::state::types::{MutationStats, ProgressState};

/// Cycles a mutation must sit unused before the recency bonus applies.
const RECENCY_GAP: u64 = 3;
const RECENCY_BONUS: f64 = 0.3;

/// Rolling-window length for per-area outcomes.
const AREA_WINDOW: usize = 3;

/// Pick a persona by weight-proportional random choice.
pub fn select_persona<'a>(
    personas: &[&'a Persona],
    rng: &mut impl Rng,
) -> EngineResult<&'a Persona> {
    if personas.is_empty() {
        return Err(EngineError::NoMutations);
    }
    let index = weighted_index(personas.iter().map(|p| p.weight), rng);
    Ok(personas[index])
}

/// Roll for an adversarial: with `probability`, pick one by weight.
pub fn roll_adversarial<'a>(
    adversarials: &[&'a Adversarial],
    probability: f64,
    rng: &mut impl Rng,
) -> Option<&'a Adversarial> {
    if adversarials.is_empty() || !rng.random_bool(probability.clamp(0.0, 1.0)) {
        return None;
    }
    let index = weighted_index(adversarials.iter().map(|a| a.weight), rng);
    Some(adversarials[index])
}

/// Enabled personas in deterministic id order, for `all_personas` sweeps.
pub fn sorted_enabled_personas(catalog: &MutationCatalog) -> Vec<&Persona> {
    let mut personas = catalog.enabled_personas();
    personas.sort_by(|a, b| a.id.cmp(&b.id));
    personas
}

/// Cumulative-weight sampling. Weights are already clamped positive, but a
/// degenerate all-zero total falls back to uniform.
fn weighted_index(weights: impl Iterator<Item = f64> + Clone, rng: &mut impl Rng) -> usize {
    let total: f64 = weights.clone().map(|w| w.max(0.0)).sum();
    let count = weights.clone().count();
    if total <= 0.0 {
        return rng.random_range(0..count);
    }
    let mut roll = rng.random_range(0.0..total);
    for (index, weight) in weights.enumerate() {
        roll -= weight.max(0.0);
        if roll < 0.0 {
            return index;
        }
    }
    count - 1
}

/// The weight update applied to one mutation's statistics.
///
/// `1.0 + 0.5·success_rate − 0.3·failure_rate + recency_bonus`, clamped.
/// A never-used mutation gets the recency bonus, which biases exploration
/// toward untried perspectives.
pub fn weight_for(stats: &MutationStats, current_cycle: u64) -> f64 {
    let uses = stats.uses.max(1) as f64;
    let success_rate = stats.successes as f64 / uses;
    let failure_rate = stats.failures as f64 / uses;
    let unused_for = match stats.last_used_cycle {
        Some(last) => current_cycle.saturating_sub(last),
        None => u64::MAX,
    };
    let recency_bonus = if unused_for >= RECENCY_GAP {
        RECENCY_BONUS
    } else {
        0.0
    };
    clamp_weight(1.0 + 0.5 * success_rate - 0.3 * failure_rate + recency_bonus)
}

/// Recompute every mutation's weight from progress statistics.
///
/// Runs after each cycle for the whole catalog, not just the mutation that
/// ran, so the recency bonus is applied consistently.
pub fn recompute_weights(
    catalog: &mut MutationCatalog,
    progress: &ProgressState,
    current_cycle: u64,
) {
    let default = MutationStats::default();
    for persona in catalog.personas_mut() {
        let stats = progress.personas.get(&persona.id).unwrap_or(&default);
        persona.weight = weight_for(stats, current_cycle);
    }
    for adversarial in catalog.adversarials_mut() {
        let stats = progress
            .adversarials
            .get(&adversarial.id)
            .unwrap_or(&default);
        adversarial.weight = weight_for(stats, current_cycle);
    }
    debug!(current_cycle, "mutation weights recomputed");
}

/// Record an Execute's touched areas and update convergence flags.
///
/// `clean_commit` is whether the cycle's change landed. Three consecutive
/// unclean touches flag the area; a clean touch clears the flag and resets
/// its window.
pub fn note_area_outcomes(progress: &mut ProgressState, files: &[String], clean_commit: bool) {
    for area in touched_areas(files) {
        *progress.area_touch_counts.entry(area.clone()).or_insert(0) += 1;

        let window = progress.area_recent_outcomes.entry(area.clone()).or_default();
        window.push(clean_commit);
        if window.len() > AREA_WINDOW {
            window.remove(0);
        }

        if clean_commit {
            if progress.converged_areas.remove(&area) {
                info!(area, "area un-flagged after clean commit");
            }
            continue;
        }

        let touches = progress.area_touch_counts[&area];
        let window = &progress.area_recent_outcomes[&area];
        if touches >= AREA_WINDOW as u64
            && window.len() == AREA_WINDOW
            && window.iter().all(|clean| !clean)
            && progress.converged_areas.insert(area.clone())
        {
            info!(area, touches, "area flagged as converged");
        }
    }
}

/// Load-update-store variant of [`note_area_outcomes`], used where the
/// persisted copy is the source of truth.
pub fn note_area_outcomes_for(
    state: &crate::state::ProjectState,
    files: &[String],
    clean_commit: bool,
) -> crate::error::EngineResult<()> {
    let mut progress = state.read_progress()?;
    note_area_outcomes(&mut progress, files, clean_commit);
    state.write_progress(&progress)
}
