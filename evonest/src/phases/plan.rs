//! Plan: pick one backlog item and produce an execution plan.
//!
//! The plan artifact is the serialized envelope itself, so a cautious run
//! can reload it verbatim when resuming in a fresh process.

use std::path::PathBuf;

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::mutation::Persona;
use crate::phases::envelope::PlanEnvelope;
use crate::phases::{tool_list, PhaseCtx, READ_TOOLS};
use crate::prompts;
use crate::state::types::{BacklogItem, BacklogStatus, PhaseKind};

pub struct PlanOutput {
    pub envelope: PlanEnvelope,
    pub artifact_path: PathBuf,
    pub turns_used: u32,
}

pub async fn run_plan(
    ctx: &PhaseCtx<'_>,
    persona: &Persona,
    backlog: &[BacklogItem],
    decisions: &[String],
) -> EngineResult<PlanOutput> {
    let prompt = prompts::plan_prompt(
        ctx.identity,
        &ctx.config.language,
        persona,
        backlog,
        decisions,
    );

    let mut request = ctx.lm_request("plan", prompt, ctx.config.max_turns.plan);
    request.allowed_tools = tool_list(READ_TOOLS);
    let outcome = ctx.runner.run(request).await?;

    let envelope = PlanEnvelope::parse(&outcome.text)?;

    // A selection must point at a real, still-pending item.
    if let Some(id) = &envelope.selected_improvement {
        let valid = backlog
            .iter()
            .any(|item| &item.id == id && item.status == BacklogStatus::Pending);
        if !valid {
            return Err(EngineError::envelope(
                "plan",
                format!("selected unknown or non-pending backlog item '{id}'"),
            ));
        }
    }

    let artifact = serde_json::to_string_pretty(&envelope)
        .map_err(|e| EngineError::envelope("plan", e.to_string()))?;
    let artifact_path = ctx.state.write_phase_artifact(PhaseKind::Plan, &artifact)?;

    info!(
        cycle = ctx.cycle,
        selected = envelope.selected_improvement.as_deref().unwrap_or("<null>"),
        turns = outcome.turns_used,
        "plan finished"
    );

    Ok(PlanOutput {
        envelope,
        artifact_path,
        turns_used: outcome.turns_used,
    })
}

/// Reload a plan artifact written by a previous (cautious) process.
pub fn load_plan_artifact(path: &std::path::Path) -> EngineResult<PlanEnvelope> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| EngineError::corrupt(path, e.to_string()))
}
