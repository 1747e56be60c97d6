//! `ProjectState` — the sole gateway to the on-disk `.evonest/` directory.
//!
//! Every read and write of engine-owned state goes through this type: path
//! resolution, atomic JSON persistence (write-to-temp-then-rename), the
//! append-only cycle history, and slug-scoped filenames for anything derived
//! from model output. No other component constructs paths into `.evonest/`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::mutation::{Adversarial, Persona};
use crate::state::types::{
    AdviceRecord, BacklogItem, CautiousResume, CycleRecord, EnvironmentSnapshot, PhaseKind,
    ProgressState, ScoutCache,
};

/// Name of the engine-owned state directory inside a project.
pub const STATE_DIR: &str = ".evonest";

/// Identity template written by `init_project`.
pub const IDENTITY_TEMPLATE: &str = "\
# Identity

## Mission

Describe what this project exists to do.

## Core Values

- Correctness over speed

## Current Phase

Early development.

## Quality Standards

- Build and tests must pass before any change lands.

## Product Direction

(unset)

## Ecosystem

(unset)

## Boundaries

- .evonest/
";

/// Maximum length of a slug derived from model output.
const SLUG_MAX_LEN: usize = 64;

/// Lowercase a model-produced name into a filesystem-safe slug.
///
/// Non-alphanumeric runs collapse to single `-`, the result is trimmed and
/// truncated to 64 chars. Empty input degrades to `"item"` so a slug is
/// never an empty filename component.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len().min(SLUG_MAX_LEN));
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

/// Sole owner of `.evonest/` for one project.
#[derive(Debug, Clone)]
pub struct ProjectState {
    project_root: PathBuf,
    dir: PathBuf,
}

impl ProjectState {
    /// Open the state directory of an already-initialized project.
    pub fn open(project_root: impl AsRef<Path>) -> EngineResult<Self> {
        let project_root = project_root.as_ref().to_path_buf();
        let dir = project_root.join(STATE_DIR);
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "{} not found — run `evonest init` first",
                    dir.display()
                ),
            )
            .into());
        }
        Ok(Self { project_root, dir })
    }

    /// Create `.evonest/` with its subdirectories and starter files.
    ///
    /// Idempotent: existing files are left untouched.
    pub fn init_project(project_root: impl AsRef<Path>) -> EngineResult<Self> {
        let project_root = project_root.as_ref().to_path_buf();
        let dir = project_root.join(STATE_DIR);

        for sub in [
            dir.clone(),
            dir.join("proposals"),
            dir.join("proposals").join("done"),
            dir.join("stimuli"),
            dir.join("stimuli").join(".processed"),
            dir.join("decisions"),
            dir.join("history"),
        ] {
            std::fs::create_dir_all(&sub)?;
        }

        let state = Self { project_root, dir };

        if !state.identity_path().exists() {
            state.write_identity(IDENTITY_TEMPLATE)?;
        }
        if !state.config_path().exists() {
            std::fs::write(
                state.config_path(),
                "{\n  // Evonest project configuration. Keys omitted here inherit engine defaults.\n}\n",
            )?;
        }
        if !state.progress_path().exists() {
            state.write_progress(&ProgressState::default())?;
        }
        if !state.backlog_path().exists() {
            state.save_backlog(&[])?;
        }

        state.ensure_ignored()?;
        info!(dir = %state.dir.display(), "project state initialized");
        Ok(state)
    }

    /// Append `.evonest/` to the project's `.gitignore` when the project is a
    /// git repository and the entry is missing.
    fn ensure_ignored(&self) -> EngineResult<()> {
        if !self.project_root.join(".git").exists() {
            return Ok(());
        }
        let gitignore = self.project_root.join(".gitignore");
        let existing = match std::fs::read_to_string(&gitignore) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let entry = format!("{STATE_DIR}/");
        if existing.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        std::fs::write(&gitignore, updated)?;
        Ok(())
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── path accessors ──────────────────────────────────────────────────────

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.dir.join("identity.md")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join("progress.json")
    }

    pub fn backlog_path(&self) -> PathBuf {
        self.dir.join("backlog.json")
    }

    pub fn advice_path(&self) -> PathBuf {
        self.dir.join("advice.json")
    }

    pub fn environment_path(&self) -> PathBuf {
        self.dir.join("environment.json")
    }

    pub fn scout_cache_path(&self) -> PathBuf {
        self.dir.join("scout.json")
    }

    pub fn dynamic_personas_path(&self) -> PathBuf {
        self.dir.join("dynamic-personas.json")
    }

    pub fn dynamic_adversarials_path(&self) -> PathBuf {
        self.dir.join("dynamic-adversarials.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }

    pub fn cautious_resume_path(&self) -> PathBuf {
        self.dir.join(".cautious-resume")
    }

    pub fn proposals_dir(&self) -> PathBuf {
        self.dir.join("proposals")
    }

    pub fn proposals_done_dir(&self) -> PathBuf {
        self.dir.join("proposals").join("done")
    }

    pub fn stimuli_dir(&self) -> PathBuf {
        self.dir.join("stimuli")
    }

    pub fn stimuli_processed_dir(&self) -> PathBuf {
        self.dir.join("stimuli").join(".processed")
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.dir.join("decisions")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.dir.join("history")
    }

    /// Latest-cycle text artifact for the three core phases; gate phases and
    /// verify have no text artifact.
    pub fn phase_artifact_path(&self, phase: PhaseKind) -> Option<PathBuf> {
        match phase {
            PhaseKind::Observe => Some(self.dir.join("observe.txt")),
            PhaseKind::Plan => Some(self.dir.join("plan.txt")),
            PhaseKind::Execute => Some(self.dir.join("execute.txt")),
            _ => None,
        }
    }

    // ── generic atomic JSON IO ──────────────────────────────────────────────

    /// Read a JSON file. `Ok(None)` when the file does not exist; corruption
    /// raises `StateCorrupt` with the offending path.
    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> EngineResult<Option<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| EngineError::corrupt(path, e.to_string()))
    }

    /// Write a JSON file atomically: serialize to `<name>.tmp`, then rename
    /// over the destination.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> EngineResult<()> {
        let tmp = tmp_path(path);
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| EngineError::corrupt(path, e.to_string()))?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    // ── typed state accessors ───────────────────────────────────────────────

    /// Raw config file text, if present. Parsing (including comment
    /// stripping) lives in [`crate::config`].
    pub fn read_config_text(&self) -> EngineResult<Option<String>> {
        match std::fs::read_to_string(self.config_path()) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_config_value(&self, value: &serde_json::Value) -> EngineResult<()> {
        self.write_json(&self.config_path(), value)
    }

    pub fn read_identity(&self) -> EngineResult<String> {
        match std::fs::read_to_string(self.identity_path()) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(IDENTITY_TEMPLATE.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_identity(&self, content: &str) -> EngineResult<()> {
        let tmp = tmp_path(&self.identity_path());
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, self.identity_path())?;
        Ok(())
    }

    pub fn read_progress(&self) -> EngineResult<ProgressState> {
        Ok(self.read_json(&self.progress_path())?.unwrap_or_default())
    }

    pub fn write_progress(&self, progress: &ProgressState) -> EngineResult<()> {
        self.write_json(&self.progress_path(), progress)
    }

    pub fn load_backlog(&self) -> EngineResult<Vec<BacklogItem>> {
        Ok(self.read_json(&self.backlog_path())?.unwrap_or_default())
    }

    pub fn save_backlog(&self, backlog: &[BacklogItem]) -> EngineResult<()> {
        self.write_json(&self.backlog_path(), &backlog)
    }

    pub fn read_advice(&self) -> EngineResult<Option<AdviceRecord>> {
        self.read_json(&self.advice_path())
    }

    pub fn write_advice(&self, advice: &AdviceRecord) -> EngineResult<()> {
        self.write_json(&self.advice_path(), advice)
    }

    pub fn read_environment(&self) -> EngineResult<Option<EnvironmentSnapshot>> {
        self.read_json(&self.environment_path())
    }

    pub fn write_environment(&self, snapshot: &EnvironmentSnapshot) -> EngineResult<()> {
        self.write_json(&self.environment_path(), snapshot)
    }

    pub fn read_scout_cache(&self) -> EngineResult<ScoutCache> {
        Ok(self.read_json(&self.scout_cache_path())?.unwrap_or_default())
    }

    pub fn update_scout_cache(&self, cache: &ScoutCache) -> EngineResult<()> {
        self.write_json(&self.scout_cache_path(), cache)
    }

    pub fn read_dynamic_personas(&self) -> EngineResult<Vec<Persona>> {
        Ok(self
            .read_json(&self.dynamic_personas_path())?
            .unwrap_or_default())
    }

    pub fn write_dynamic_personas(&self, personas: &[Persona]) -> EngineResult<()> {
        self.write_json(&self.dynamic_personas_path(), &personas)
    }

    pub fn read_dynamic_adversarials(&self) -> EngineResult<Vec<Adversarial>> {
        Ok(self
            .read_json(&self.dynamic_adversarials_path())?
            .unwrap_or_default())
    }

    pub fn write_dynamic_adversarials(&self, adversarials: &[Adversarial]) -> EngineResult<()> {
        self.write_json(&self.dynamic_adversarials_path(), &adversarials)
    }

    pub fn read_cautious_resume(&self) -> EngineResult<Option<CautiousResume>> {
        self.read_json(&self.cautious_resume_path())
    }

    pub fn write_cautious_resume(&self, token: &CautiousResume) -> EngineResult<()> {
        self.write_json(&self.cautious_resume_path(), token)
    }

    pub fn clear_cautious_resume(&self) -> EngineResult<()> {
        match std::fs::remove_file(self.cautious_resume_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── phase artifacts ─────────────────────────────────────────────────────

    pub fn write_phase_artifact(&self, phase: PhaseKind, content: &str) -> EngineResult<PathBuf> {
        let path = self.phase_artifact_path(phase).ok_or_else(|| {
            EngineError::config(format!("phase {phase} has no text artifact"))
        })?;
        let tmp = tmp_path(&path);
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    // ── history ─────────────────────────────────────────────────────────────

    fn history_file(&self, cycle: u64) -> PathBuf {
        self.history_dir().join(format!("cycle-{cycle:04}.json"))
    }

    pub fn append_history(&self, record: &CycleRecord) -> EngineResult<()> {
        self.write_json(&self.history_file(record.cycle_number), record)
    }

    /// The most recent `limit` records, oldest first.
    pub fn read_history(&self, limit: usize) -> EngineResult<Vec<CycleRecord>> {
        let mut numbers: Vec<u64> = Vec::new();
        for entry in std::fs::read_dir(self.history_dir())? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name
                .strip_prefix("cycle-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                numbers.push(num);
            }
        }
        numbers.sort_unstable();
        let start = numbers.len().saturating_sub(limit);
        let mut records = Vec::with_capacity(numbers.len() - start);
        for num in &numbers[start..] {
            let path = self.history_file(*num);
            let record = self
                .read_json::<CycleRecord>(&path)?
                .ok_or_else(|| EngineError::corrupt(&path, "history file vanished"))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Highest cycle number recorded so far, or 0 for a fresh project.
    pub fn last_cycle_number(&self) -> EngineResult<u64> {
        let mut max = 0;
        for entry in std::fs::read_dir(self.history_dir())? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name
                .strip_prefix("cycle-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                max = max.max(num);
            }
        }
        Ok(max)
    }

    // ── proposals ───────────────────────────────────────────────────────────

    /// Persist a proposal document. The filename carries an ordinal, a
    /// timestamp, and a slug of the document's first heading.
    pub fn create_proposal(&self, content: &str) -> EngineResult<String> {
        let title = content
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim_start_matches('#').trim())
            .unwrap_or("proposal");
        let ordinal = self.count_proposals()? + 1;
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let filename = format!("{ordinal:04}-{stamp}-{}.md", slugify(title));
        let path = self.scoped_path(&self.proposals_dir(), &filename)?;
        let tmp = tmp_path(&path);
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!(filename, "proposal created");
        Ok(filename)
    }

    fn count_proposals(&self) -> EngineResult<usize> {
        let pending = count_md_files(&self.proposals_dir())?;
        let done = count_md_files(&self.proposals_done_dir())?;
        Ok(pending + done)
    }

    /// Pending proposal filenames, sorted (ordinal order).
    pub fn list_proposals(&self) -> EngineResult<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(self.proposals_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".md") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn read_proposal(&self, filename: &str) -> EngineResult<String> {
        let path = self.scoped_path(&self.proposals_dir(), filename)?;
        Ok(std::fs::read_to_string(path)?)
    }

    pub fn mark_proposal_done(&self, filename: &str) -> EngineResult<()> {
        let from = self.scoped_path(&self.proposals_dir(), filename)?;
        let to = self.scoped_path(&self.proposals_done_dir(), filename)?;
        std::fs::rename(from, to)?;
        debug!(filename, "proposal archived");
        Ok(())
    }

    // ── stimuli and decisions ───────────────────────────────────────────────

    pub fn list_stimuli(&self) -> EngineResult<Vec<PathBuf>> {
        list_md_files(&self.stimuli_dir())
    }

    /// Write an auto-generated stimulus (from meta-observe or scout).
    pub fn create_stimulus(&self, name_hint: &str, content: &str) -> EngineResult<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let filename = format!("{stamp}-{}.md", slugify(name_hint));
        let path = self.scoped_path(&self.stimuli_dir(), &filename)?;
        let tmp = tmp_path(&path);
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Consume a stimulus by moving it to the `.processed/` sibling.
    pub fn consume_stimulus(&self, path: &Path) -> EngineResult<()> {
        let filename = contained_file_name(&self.stimuli_dir(), path)?;
        let to = self.scoped_path(&self.stimuli_processed_dir(), &filename)?;
        std::fs::rename(path, to)?;
        Ok(())
    }

    pub fn list_decisions(&self) -> EngineResult<Vec<PathBuf>> {
        list_md_files(&self.decisions_dir())
    }

    /// Consume a decision by deleting it — strict single-shot semantics.
    pub fn consume_decision(&self, path: &Path) -> EngineResult<()> {
        contained_file_name(&self.decisions_dir(), path)?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    // ── slug-scoped path construction ───────────────────────────────────────

    /// Join `filename` onto `dir` and assert the result stays inside it.
    ///
    /// Filenames derived from model output are slugified before reaching
    /// here; this is the backstop against traversal.
    fn scoped_path(&self, dir: &Path, filename: &str) -> EngineResult<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename == ".."
        {
            return Err(EngineError::config(format!(
                "unsafe filename rejected: {filename:?}"
            )));
        }
        let path = dir.join(filename);
        if !path.starts_with(self.dir()) || !path.starts_with(dir) {
            return Err(EngineError::config(format!(
                "path {} escapes {}",
                path.display(),
                dir.display()
            )));
        }
        Ok(path)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

fn count_md_files(dir: &Path) -> EngineResult<usize> {
    Ok(list_md_files(dir)?.len())
}

fn list_md_files(dir: &Path) -> EngineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Verify `path` is a direct child of `dir` and return its file name.
fn contained_file_name(dir: &Path, path: &Path) -> EngineResult<String> {
    let parent_ok = path.parent().is_some_and(|p| p == dir);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..");
    match (parent_ok, name) {
        (true, Some(name)) => Ok(name),
        _ => Err(EngineError::config(format!(
            "path {} is not inside {}",
            path.display(),
            dir.display()
        ))),
    }
}

/// Normalized top-level set of directories touched by a list of files,
/// used by the convergence detector.
pub fn touched_areas(files: &[String]) -> BTreeSet<String> {
    let mut areas = BTreeSet::new();
    for file in files {
        let path = Path::new(file);
        let area = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        areas.insert(area);
    }
    areas
}
