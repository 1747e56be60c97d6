//! Execute: carry out the plan through the LM's Write/Edit tools.
//!
//! Boundary handling is belt and braces: targets listed by the plan are
//! checked before the LM is invoked, the prompt names every protected path,
//! and the orchestrator re-checks the actually-touched files afterwards
//! against the git status.

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::phases::envelope::{ExecuteEnvelope, PlanEnvelope};
use crate::phases::{tool_list, PhaseCtx, WRITE_TOOLS};
use crate::prompts;
use crate::state::types::PhaseKind;

pub struct ExecuteOutput {
    pub envelope: ExecuteEnvelope,
    /// Union of reported modified and created paths.
    pub files: Vec<String>,
    pub turns_used: u32,
}

pub async fn run_execute(
    ctx: &PhaseCtx<'_>,
    plan: &PlanEnvelope,
    decisions: &[String],
) -> EngineResult<ExecuteOutput> {
    // Pre-invocation check: refuse plans that already target protected paths.
    let targets = plan.write_targets();
    if let Some(violation) = ctx.identity.first_violation(&targets) {
        return Err(EngineError::BoundaryViolation {
            path: violation.to_string(),
        });
    }

    let prompt = prompts::execute_prompt(ctx.identity, &ctx.config.language, plan, decisions);
    let mut request = ctx.lm_request("execute", prompt, ctx.config.max_turns.execute);
    request.allowed_tools = tool_list(WRITE_TOOLS);
    let outcome = ctx.runner.run(request).await?;

    let envelope = ExecuteEnvelope::parse(&outcome.text)?;
    let mut files = envelope.files_modified.clone();
    files.extend(envelope.files_created.iter().cloned());
    files.sort();
    files.dedup();

    let mut artifact = envelope.summary.clone();
    artifact.push('\n');
    for file in &files {
        artifact.push_str(&format!("- {file}\n"));
    }
    ctx.state.write_phase_artifact(PhaseKind::Execute, &artifact)?;

    info!(
        cycle = ctx.cycle,
        files = files.len(),
        turns = outcome.turns_used,
        "execute finished"
    );

    Ok(ExecuteOutput {
        envelope,
        files,
        turns_used: outcome.turns_used,
    })
}
