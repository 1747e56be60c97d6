//! LM subprocess supervision.
//!
//! [`ModelRunner`] is the seam between the engine and the language model:
//! phases depend on the trait, the production implementation shells out to
//! the `claude` CLI in print mode with `--output-format stream-json`, and
//! tests substitute scripted runners.
//!
//! The subprocess contract: prompt on stdin, tool allow-list / model /
//! turn-cap as flags, newline-delimited JSON events on stdout. Both output
//! pipes are drained concurrently so neither can fill and deadlock the
//! child. Every spawned child is waited on — including on timeout and
//! cancellation, where it is terminated, given a short grace, then killed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Base delay for rate-limit backoff (doubles per attempt).
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Keep at most this much stderr for diagnostics.
const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// One LM invocation.
#[derive(Debug, Clone)]
pub struct LmRequest {
    pub prompt: String,
    /// Tool allow-list passed to the subprocess (e.g. `Read`, `Grep`, `Edit`).
    pub allowed_tools: Vec<String>,
    /// Model flag value (`haiku` / `sonnet` / `opus`).
    pub model: String,
    pub max_turns: u32,
    /// Wall-clock deadline for the whole exchange.
    pub timeout: Duration,
    /// Label for logs (phase name).
    pub label: String,
    pub cancel: CancellationToken,
}

/// How an LM run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    MaxTurns,
}

/// Final text plus structured metadata from one LM run.
#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub text: String,
    pub turns_used: u32,
    pub exit: ExitReason,
}

/// The seam phases call through; implemented by [`ClaudeRunner`] in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn run(&self, req: LmRequest) -> EngineResult<LmOutcome>;
}

/// Production runner shelling out to the `claude` CLI.
pub struct ClaudeRunner {
    binary: String,
    max_retries: u32,
}

impl ClaudeRunner {
    pub fn new(binary: impl Into<String>, max_retries: u32) -> Self {
        Self {
            binary: binary.into(),
            max_retries,
        }
    }
}

#[async_trait]
impl ModelRunner for ClaudeRunner {
    async fn run(&self, req: LmRequest) -> EngineResult<LmOutcome> {
        let mut attempt = 0;
        loop {
            match self.run_once(&req).await {
                Ok(outcome) => return Ok(outcome),
                Err(RunError::RateLimited { detail }) => {
                    if attempt >= self.max_retries {
                        return Err(EngineError::lm(format!(
                            "rate limited after {attempt} retries: {detail}"
                        )));
                    }
                    let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt);
                    warn!(
                        label = %req.label,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "LM rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(RunError::Engine(e)) => return Err(e),
            }
        }
    }
}

enum RunError {
    RateLimited { detail: String },
    Engine(EngineError),
}

impl From<EngineError> for RunError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl ClaudeRunner {
    async fn run_once(&self, req: &LmRequest) -> Result<LmOutcome, RunError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg("--verbose")
            .args(["--output-format", "stream-json"])
            .args(["--model", &req.model])
            .args(["--max-turns", &req.max_turns.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !req.allowed_tools.is_empty() {
            cmd.args(["--allowed-tools", &req.allowed_tools.join(",")]);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunError::Engine(EngineError::LmUnavailable {
                    message: format!("{} not found on PATH", self.binary),
                })
            } else {
                RunError::Engine(EngineError::LmUnavailable {
                    message: e.to_string(),
                })
            }
        })?;

        // Feed the prompt and close stdin so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(req.prompt.as_bytes())
                .await
                .map_err(|e| EngineError::lm(format!("stdin: {e}")))?;
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let label = req.label.clone();

        // Drain both pipes concurrently to avoid pipe-fill deadlock.
        let stdout_task = tokio::spawn(read_events(stdout, label.clone()));
        let stderr_task = tokio::spawn(read_stderr_tail(stderr));

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| EngineError::lm(format!("wait: {e}")))?
            }
            () = tokio::time::sleep(req.timeout) => {
                warn!(label = %req.label, timeout_secs = req.timeout.as_secs(), "LM timed out");
                terminate_and_reap(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunError::Engine(EngineError::LmTimeout {
                    seconds: req.timeout.as_secs(),
                }));
            }
            () = req.cancel.cancelled() => {
                info!(label = %req.label, "LM run cancelled");
                terminate_and_reap(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(RunError::Engine(EngineError::lm("cancelled")));
            }
        };

        let events = stdout_task
            .await
            .map_err(|e| EngineError::lm(format!("stdout reader: {e}")))?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = if events.result_text.is_empty() {
                stderr_tail.clone()
            } else {
                events.result_text.clone()
            };
            if looks_rate_limited(status.code(), &detail) {
                return Err(RunError::RateLimited { detail });
            }
            return Err(RunError::Engine(EngineError::lm(format!(
                "exit {:?}: {}",
                status.code(),
                detail.trim()
            ))));
        }

        let turns_used = events.num_turns.unwrap_or(events.assistant_turns);
        let exit = if events.subtype.as_deref() == Some("error_max_turns")
            || turns_used >= req.max_turns
        {
            ExitReason::MaxTurns
        } else {
            ExitReason::Completed
        };
        let text = if events.result_text.is_empty() {
            events.assistant_text
        } else {
            events.result_text
        };

        debug!(label = %req.label, turns_used, ?exit, "LM run finished");
        Ok(LmOutcome {
            text,
            turns_used,
            exit,
        })
    }
}

#[derive(Default)]
struct StreamedEvents {
    result_text: String,
    assistant_text: String,
    assistant_turns: u32,
    num_turns: Option<u32>,
    subtype: Option<String>,
}

/// Parse the stream-json event feed. Unparseable lines are skipped; each
/// assistant turn is logged as it arrives.
async fn read_events(stdout: tokio::process::ChildStdout, label: String) -> StreamedEvents {
    let mut events = StreamedEvents::default();
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(event) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                events.assistant_turns += 1;
                let text = message_text(&event);
                if !text.is_empty() {
                    info!(
                        label = %label,
                        turn = events.assistant_turns,
                        "assistant: {}",
                        truncate(&text, 400)
                    );
                    events.assistant_text = text;
                }
            }
            Some("result") => {
                if let Some(text) = event.get("result").and_then(Value::as_str) {
                    events.result_text = text.to_string();
                }
                events.num_turns = event
                    .get("num_turns")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32);
                events.subtype = event
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            _ => {}
        }
    }
    events
}

async fn read_stderr_tail(stderr: tokio::process::ChildStderr) -> String {
    let mut tail = String::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let cut = tail.len() - STDERR_TAIL_BYTES;
            tail.drain(..cut);
        }
    }
    tail
}

/// Flatten a `{"message": {"content": [...]}}` event into plain text.
fn message_text(event: &Value) -> String {
    let Some(content) = event.pointer("/message/content") else {
        return String::new();
    };
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                (b.get("type").and_then(Value::as_str) == Some("text"))
                    .then(|| b.get("text").and_then(Value::as_str))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn looks_rate_limited(_code: Option<i32>, detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("overloaded")
        || lower.contains("429")
}

/// SIGTERM, short grace, SIGKILL, then wait. Never leaves a zombie.
async fn terminate_and_reap(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "child ignored SIGTERM; killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
