//! Evonest: an autonomous evolution engine.
//!
//! Drives a codebase through repeated Observe → Plan → Execute → Verify
//! cycles. Each cycle adopts a *mutation* — a persona, optionally paired
//! with an adversarial challenge — chosen by an adaptive weighted scheduler,
//! invokes a language-model subprocess under that viewpoint, and lands the
//! resulting change only when the configured build/test gates pass, with a
//! git stash checkpoint guaranteeing rollback otherwise.
//!
//! All engine-owned state lives under the project's `.evonest/` directory,
//! behind [`state::ProjectState`]; a file lock makes runs exclusive per
//! project; the cautious mode externalizes its continuation to disk so a
//! paused run can resume in a different process.

pub mod backlog;
pub mod config;
pub mod environment;
pub mod error;
pub mod git;
pub mod identity;
pub mod lock;
pub mod mutation;
pub mod orchestrator;
pub mod phases;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use config::{EngineConfig, EnvOverrides, Level, RuntimeOverrides};
pub use error::{EngineError, EngineResult};
pub use orchestrator::{
    AnalyzeOptions, Engine, EvolveOptions, ImproveOptions, RunMode, RunSummary,
};
pub use runner::{ClaudeRunner, LmOutcome, LmRequest, ModelRunner};
pub use state::ProjectState;
