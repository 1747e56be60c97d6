//! Verify: run the configured build and test gates.
//!
//! Commands come from config as single strings, are shlex-split into argv
//! vectors, and exec directly — never through a shell. A `null` command
//! skips its gate. Each gate gets the phase wall-clock timeout.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::VerifyConfig;
use crate::error::{EngineError, EngineResult};

/// Outcome of the command gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyVerdict {
    Passed,
    Failed { gate: String, detail: String },
}

impl VerifyVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Run build then test. The first failing gate short-circuits.
pub async fn run_verify(
    project_root: &Path,
    config: &VerifyConfig,
    timeout_secs: u64,
) -> EngineResult<VerifyVerdict> {
    let gates = [("build", &config.build), ("test", &config.test)];
    for (gate, command) in gates {
        let Some(command) = command else {
            continue;
        };
        match run_gate(project_root, gate, command, timeout_secs).await? {
            GateResult::Passed => {}
            GateResult::Failed(detail) => {
                warn!(gate, detail = %truncate(&detail, 500), "verify gate failed");
                return Ok(VerifyVerdict::Failed {
                    gate: gate.to_string(),
                    detail,
                });
            }
        }
    }
    Ok(VerifyVerdict::Passed)
}

enum GateResult {
    Passed,
    Failed(String),
}

async fn run_gate(
    project_root: &Path,
    gate: &str,
    command: &str,
    timeout_secs: u64,
) -> EngineResult<GateResult> {
    let argv = shlex::split(command).ok_or_else(|| {
        EngineError::config(format!("verify.{gate}: unparseable command {command:?}"))
    })?;
    let Some((program, args)) = argv.split_first() else {
        return Err(EngineError::config(format!("verify.{gate}: empty command")));
    };

    info!(gate, command, "verify gate running");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(project_root)
        .kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
        Ok(result) => result.map_err(|e| EngineError::VerifyFail {
            gate: gate.to_string(),
            message: format!("failed to run {program}: {e}"),
        })?,
        Err(_) => {
            return Ok(GateResult::Failed(format!(
                "timed out after {timeout_secs}s"
            )))
        }
    };

    if output.status.success() {
        info!(gate, "verify gate passed");
        Ok(GateResult::Passed)
    } else {
        let mut detail = String::from_utf8_lossy(&output.stdout).into_owned();
        detail.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(GateResult::Failed(format!(
            "exit {:?}: {}",
            output.status.code(),
            detail.trim()
        )))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(build: Option<&str>, test: Option<&str>) -> VerifyConfig {
        VerifyConfig {
            build: build.map(str::to_string),
            test: test.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn null_commands_pass_vacuously() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_verify(dir.path(), &config(None, None), 10).await.unwrap();
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn failing_test_gate_reports() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_verify(dir.path(), &config(None, Some("false")), 10)
            .await
            .unwrap();
        assert_eq!(
            verdict,
            VerifyVerdict::Failed {
                gate: "test".into(),
                detail: "exit Some(1): ".into()
            }
        );
    }

    #[tokio::test]
    async fn passing_gates_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_verify(dir.path(), &config(Some("true"), Some("true")), 10)
            .await
            .unwrap();
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn build_failure_short_circuits_test() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("test-ran");
        let test_cmd = format!("touch {}", marker.display());
        let verdict = run_verify(dir.path(), &config(Some("false"), Some(&test_cmd)), 10)
            .await
            .unwrap();
        assert!(!verdict.is_pass());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn quoted_arguments_survive_shlex() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c "exit 0"` only works when the quoted string stays one argv.
        let verdict = run_verify(dir.path(), &config(Some(r#"sh -c "exit 0""#), None), 10)
            .await
            .unwrap();
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn gate_timeout_fails_not_hangs() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = run_verify(dir.path(), &config(Some("sleep 30"), None), 1)
            .await
            .unwrap();
        assert!(matches!(verdict, VerifyVerdict::Failed { ref detail, .. } if detail.contains("timed out")));
    }
}
