//! Shared test fixtures: a scripted model runner and temp git projects.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use evonest::config::{EngineConfig, EnvOverrides, RuntimeOverrides};
use evonest::error::{EngineError, EngineResult};
use evonest::runner::{LmOutcome, LmRequest, ModelRunner};
use evonest::{Engine, ProjectState};
use tempfile::TempDir;

type Script = Box<dyn Fn(&LmRequest) -> EngineResult<String> + Send + Sync>;

/// Scripted stand-in for the LM subprocess. Each phase label carries a queue
/// of responses; scripts may touch the filesystem to mimic tool use.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, label: &str, script: F)
    where
        F: Fn(&LmRequest) -> EngineResult<String> + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(Box::new(script));
    }

    pub fn push_text(&self, label: &str, text: &str) {
        let text = text.to_string();
        self.push(label, move |_| Ok(text.clone()));
    }
}

#[async_trait]
impl ModelRunner for FakeRunner {
    async fn run(&self, req: LmRequest) -> EngineResult<LmOutcome> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&req.label)
            .and_then(VecDeque::pop_front);
        let Some(script) = script else {
            return Err(EngineError::lm(format!(
                "no scripted response for phase '{}'",
                req.label
            )));
        };
        let text = script(&req)?;
        Ok(LmOutcome {
            text,
            turns_used: 1,
            exit: evonest::runner::ExitReason::Completed,
        })
    }
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Fresh git repo with one commit, plus an initialized `.evonest/`.
/// Init runs before the commit so the generated `.gitignore` is tracked
/// and the tree starts clean.
pub fn init_git_project() -> (TempDir, ProjectState) {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# Project\n").unwrap();
    std::fs::write(dir.path().join("pyproject.toml"), "[project]\nname = \"demo\"\n").unwrap();
    let state = ProjectState::init_project(dir.path()).unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-q", "-m", "initial"]);
    (dir, state)
}

pub fn engine_with(
    state: ProjectState,
    project_config: &str,
    runner: Arc<FakeRunner>,
) -> Engine {
    let config = EngineConfig::resolve(
        Some(project_config),
        &RuntimeOverrides::default(),
        &EnvOverrides::default(),
    )
    .unwrap();
    Engine::with_runner(state, config, runner)
}

pub fn commit_count(dir: &Path) -> usize {
    git(dir, &["rev-list", "--count", "HEAD"])
        .parse()
        .unwrap()
}

/// Observe envelope proposing a single improvement titled `title`.
pub fn observe_response(title: &str) -> String {
    format!(
        r#"{{
            "improvements": [
                {{"title": "{title}", "description": "do it", "category": "refactor",
                  "priority": "high", "files": ["src/demo.rs"]}}
            ],
            "observations": "looked around"
        }}"#
    )
}

/// Plan envelope selecting the backlog id derived from `title`.
pub fn plan_response(id: &str, target_file: &str) -> String {
    format!(
        r#"{{
            "selected_improvement": "{id}",
            "steps": ["write the file"],
            "files_to_read": [],
            "files_to_modify": ["{target_file}"],
            "files_to_create": [],
            "expected_outcome": "file updated",
            "risk_level": "low",
            "commit_message": "update {target_file}"
        }}"#
    )
}

pub fn execute_response(files: &[&str]) -> String {
    let list = files
        .iter()
        .map(|f| format!("\"{f}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"{{"files_modified": [{list}], "files_created": [], "summary": "changed files"}}"#
    )
}
