//! Observe: study the project through a persona and feed the backlog.

use std::path::PathBuf;

use tracing::info;

use crate::backlog::ImprovementCandidate;
use crate::error::EngineResult;
use crate::mutation::{Adversarial, Persona};
use crate::phases::envelope::ObserveEnvelope;
use crate::phases::{tool_list, PhaseCtx, READ_TOOLS};
use crate::prompts;
use crate::state::types::{
    AdviceRecord, CycleRecord, EnvironmentSnapshot, PhaseKind, ProgressState,
};

/// Inputs gathered by the orchestrator before observe runs. Stimuli are
/// already consumed (moved to `.processed/`) by this point; only their
/// contents travel here.
pub struct ObserveInput<'a> {
    pub persona: &'a Persona,
    pub adversarial: Option<&'a Adversarial>,
    pub progress: &'a ProgressState,
    pub environment: &'a EnvironmentSnapshot,
    pub advice: Option<&'a AdviceRecord>,
    pub history: &'a [CycleRecord],
    pub stimuli: Vec<String>,
    pub decisions: Vec<String>,
}

pub struct ObserveOutput {
    pub candidates: Vec<ImprovementCandidate>,
    pub observations: String,
    pub artifact_path: PathBuf,
    pub turns_used: u32,
}

pub async fn run_observe(
    ctx: &PhaseCtx<'_>,
    input: ObserveInput<'_>,
) -> EngineResult<ObserveOutput> {
    let deep = ctx.config.is_deep_cycle(ctx.cycle);
    let max_turns = ctx
        .config
        .observe_turns(deep, input.environment.file_count);

    let prompt = prompts::observe_prompt(
        ctx.identity,
        &ctx.config.language,
        input.persona,
        input.adversarial,
        input.environment,
        input.history,
        input.progress,
        input.advice,
        &input.stimuli,
        &input.decisions,
    );

    let mut request = ctx.lm_request("observe", prompt, max_turns);
    request.allowed_tools = tool_list(READ_TOOLS);
    let outcome = ctx.runner.run(request).await?;

    let envelope = ObserveEnvelope::parse(&outcome.text)?;

    let mut artifact = String::new();
    artifact.push_str(&envelope.observations);
    artifact.push('\n');
    for improvement in &envelope.improvements {
        artifact.push_str(&format!(
            "- [{}] {} ({:?})\n",
            improvement.category, improvement.title, improvement.priority
        ));
    }
    let artifact_path = ctx.state.write_phase_artifact(PhaseKind::Observe, &artifact)?;

    info!(
        cycle = ctx.cycle,
        persona = %input.persona.id,
        deep,
        improvements = envelope.improvements.len(),
        turns = outcome.turns_used,
        "observe finished"
    );

    let candidates = envelope
        .improvements
        .into_iter()
        .map(|entry| ImprovementCandidate {
            title: entry.title,
            description: entry.description,
            category: entry.category,
            priority: entry.priority,
            files: entry.files,
        })
        .collect();

    Ok(ObserveOutput {
        candidates,
        observations: envelope.observations,
        artifact_path,
        turns_used: outcome.turns_used,
    })
}
