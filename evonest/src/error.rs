//! Engine error types.
//!
//! Every failure mode the engine can surface is a variant here. Errors raised
//! inside a phase are caught by the orchestrator, which records the cycle as
//! failed and reverts; the fatal variants (`LockHeld`, `StateCorrupt`,
//! `RevertFailed`) abort the run instead. `Config` errors abort before any
//! cycle starts.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration schema violation, bad level name, or unknown dotted key.
    #[error("config error: {message}")]
    Config { message: String },

    /// Another engine instance holds the project lock.
    #[error("another engine instance holds the lock (pid {pid})")]
    LockHeld { pid: u32 },

    /// A state file inside `.evonest/` is unreadable.
    #[error("state file {path} is corrupt: {message}")]
    StateCorrupt { path: PathBuf, message: String },

    /// The LM subprocess could not be spawned at all.
    #[error("LM subprocess unavailable: {message}")]
    LmUnavailable { message: String },

    /// The LM subprocess ran but failed (bad exit, rate-limit exhaustion, …).
    #[error("LM run failed: {message}")]
    Lm { message: String },

    /// The LM subprocess exceeded its wall-clock deadline.
    #[error("LM run timed out after {seconds}s")]
    LmTimeout { seconds: u64 },

    /// The final LM message carried no parseable envelope for the phase.
    #[error("malformed {phase} envelope: {message}")]
    Envelope { phase: String, message: String },

    /// A configured verify command returned non-zero.
    #[error("verify gate '{gate}' failed: {message}")]
    VerifyFail { gate: String, message: String },

    /// Execute touched a path listed in the identity's Boundaries.
    #[error("execute touched protected path: {path}")]
    BoundaryViolation { path: String },

    /// A git operation failed.
    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    /// Reverting a failed cycle itself failed. The working tree may be dirty;
    /// the run must abort rather than continue on an unknown base.
    #[error("revert failed, aborting run: {message}")]
    RevertFailed { message: String },

    /// Illegal backlog state-machine transition.
    #[error("illegal backlog transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// `resume` was requested but no cautious checkpoint exists.
    #[error("nothing to resume: no cautious checkpoint found")]
    NothingToResume,

    /// Every persona is disabled or filtered out.
    #[error("no mutations available: all personas are disabled")]
    NoMutations,

    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StateCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn lm(message: impl Into<String>) -> Self {
        Self::Lm {
            message: message.into(),
        }
    }

    pub fn envelope(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Envelope {
            phase: phase.into(),
            message: message.into(),
        }
    }

    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error aborts the whole run instead of failing one cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. } | Self::StateCorrupt { .. } | Self::RevertFailed { .. }
        )
    }

    /// Process exit code for the CLI wrapper.
    ///
    /// 0 success, 2 lock held, 3 config invalid, 4 verify failed,
    /// 5 LM unavailable, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LockHeld { .. } => 2,
            Self::Config { .. } => 3,
            Self::VerifyFail { .. } => 4,
            Self::LmUnavailable { .. } => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(EngineError::LockHeld { pid: 1 }.exit_code(), 2);
        assert_eq!(EngineError::config("bad").exit_code(), 3);
        assert_eq!(
            EngineError::VerifyFail {
                gate: "test".into(),
                message: "exit 1".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            EngineError::LmUnavailable {
                message: "not found".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(EngineError::NothingToResume.exit_code(), 1);
    }

    #[test]
    fn fatal_classification() {
        assert!(EngineError::LockHeld { pid: 1 }.is_fatal());
        assert!(EngineError::corrupt("/x", "bad json").is_fatal());
        assert!(EngineError::RevertFailed {
            message: "pop conflict".into()
        }
        .is_fatal());
        assert!(!EngineError::lm("boom").is_fatal());
        assert!(!EngineError::BoundaryViolation { path: "a".into() }.is_fatal());
    }
}
