//! Cycle phases.
//!
//! Each phase assembles a prompt from project state, calls the model runner,
//! parses its envelope, and writes artifacts back through [`ProjectState`].
//! Meta-observe and scout are gate phases that fire on a periodic schedule;
//! verify runs no LM at all, only the configured build/test commands.

pub mod envelope;
mod execute;
mod meta_observe;
mod observe;
mod plan;
mod scout;
mod verify;

pub use execute::{run_execute, ExecuteOutput};
pub use meta_observe::{run_meta_observe, MetaObserveOutput};
pub use observe::{run_observe, ObserveInput, ObserveOutput};
pub use plan::{load_plan_artifact, run_plan, PlanOutput};
pub use scout::{run_scout, ScoutOutput};
pub use verify::{run_verify, VerifyVerdict};

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::identity::Identity;
use crate::runner::{LmRequest, ModelRunner};
use crate::state::ProjectState;

/// Shared inputs every phase receives.
pub struct PhaseCtx<'a> {
    pub state: &'a ProjectState,
    pub config: &'a EngineConfig,
    pub runner: &'a dyn ModelRunner,
    pub identity: &'a Identity,
    pub cancel: &'a CancellationToken,
    pub cycle: u64,
}

impl PhaseCtx<'_> {
    /// Base LM request for this cycle; phases adjust tools and turn caps.
    pub(crate) fn lm_request(&self, label: &str, prompt: String, max_turns: u32) -> LmRequest {
        LmRequest {
            prompt,
            allowed_tools: Vec::new(),
            model: self.config.model.flag().to_string(),
            max_turns,
            timeout: Duration::from_secs(self.config.phase_timeout_secs),
            label: label.to_string(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Read-only tool set for observation-style phases.
pub(crate) const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];

/// Tool set for the execute phase.
pub(crate) const WRITE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash", "Edit", "Write"];

/// Tool set for the scout gate.
pub(crate) const SCOUT_TOOLS: &[&str] = &["WebFetch", "WebSearch", "Read"];

pub(crate) fn tool_list(tools: &[&str]) -> Vec<String> {
    tools.iter().map(|t| t.to_string()).collect()
}
