//! Meta-observe gate: strategic reflection every N cycles.
//!
//! Expires TTL-exceeded dynamic mutations, then asks the LM for new
//! personas/adversarials (capped), auto-stimuli, and strategic advice.

use chrono::Utc;
use tracing::info;

use crate::error::EngineResult;
use crate::mutation::{Adversarial, MutationCatalog, Persona, PersonaGroup};
use crate::phases::envelope::MetaObserveEnvelope;
use crate::phases::{tool_list, PhaseCtx, READ_TOOLS};
use crate::prompts;
use crate::state::slugify;
use crate::state::types::{AdviceRecord, BacklogItem, CycleRecord, ProgressState};

pub struct MetaObserveOutput {
    pub expired: usize,
    pub personas_added: usize,
    pub adversarials_added: usize,
    pub stimuli_written: usize,
    pub advice_written: bool,
    pub turns_used: u32,
}

pub async fn run_meta_observe(
    ctx: &PhaseCtx<'_>,
    catalog: &mut MutationCatalog,
    progress: &ProgressState,
    backlog: &[BacklogItem],
    history: &[CycleRecord],
) -> EngineResult<MetaObserveOutput> {
    let expired = catalog.expire_dynamic(ctx.state, ctx.cycle)?;

    let roster = catalog
        .personas()
        .iter()
        .map(|p| {
            format!(
                "- persona `{}` [{}]{}: {}",
                p.id,
                p.group,
                if p.is_dynamic() { " (dynamic)" } else { "" },
                p.name
            )
        })
        .chain(catalog.adversarials().iter().map(|a| {
            format!(
                "- adversarial `{}`{}: {}",
                a.id,
                if a.is_dynamic() { " (dynamic)" } else { "" },
                a.name
            )
        }))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = prompts::meta_observe_prompt(
        ctx.identity,
        &ctx.config.language,
        history,
        progress,
        &roster,
        backlog,
    );
    let mut request = ctx.lm_request("meta-observe", prompt, ctx.config.max_turns.meta_observe);
    request.allowed_tools = tool_list(READ_TOOLS);
    let outcome = ctx.runner.run(request).await?;

    let envelope = MetaObserveEnvelope::parse(&outcome.text)?;

    let new_personas: Vec<Persona> = envelope
        .new_personas
        .into_iter()
        .map(|entry| Persona {
            id: entry.id.unwrap_or_else(|| slugify(&entry.name)),
            name: entry.name,
            group: entry.group.unwrap_or(PersonaGroup::Tech),
            perspective: entry.perspective,
            enabled: true,
            weight: 1.0,
            created_cycle: Some(ctx.cycle),
            ttl_cycles: Some(ctx.config.dynamic_mutation_ttl_cycles),
        })
        .collect();
    let personas_added =
        catalog.add_dynamic_personas(ctx.state, new_personas, ctx.config.max_dynamic_personas)?;

    let new_adversarials: Vec<Adversarial> = envelope
        .new_adversarials
        .into_iter()
        .map(|entry| Adversarial {
            id: entry.id.unwrap_or_else(|| slugify(&entry.name)),
            name: entry.name,
            challenge: entry.challenge,
            enabled: true,
            weight: 1.0,
            created_cycle: Some(ctx.cycle),
            ttl_cycles: Some(ctx.config.dynamic_mutation_ttl_cycles),
        })
        .collect();
    let adversarials_added = catalog.add_dynamic_adversarials(
        ctx.state,
        new_adversarials,
        ctx.config.max_dynamic_adversarials,
    )?;

    let mut stimuli_written = 0;
    for stimulus in &envelope.auto_stimuli {
        ctx.state.create_stimulus(&stimulus.title, &stimulus.content)?;
        stimuli_written += 1;
    }

    let advice_written = match envelope.advice {
        Some(direction) if !direction.trim().is_empty() => {
            ctx.state.write_advice(&AdviceRecord {
                cycle: ctx.cycle,
                direction,
                focus: Vec::new(),
                created_at: Utc::now(),
            })?;
            true
        }
        _ => false,
    };

    info!(
        cycle = ctx.cycle,
        expired,
        personas_added,
        adversarials_added,
        stimuli_written,
        advice_written,
        "meta-observe finished"
    );

    Ok(MetaObserveOutput {
        expired,
        personas_added,
        adversarials_added,
        stimuli_written,
        advice_written,
        turns_used: outcome.turns_used,
    })
}
