//! Engine configuration.
//!
//! Three-tier resolution: engine defaults (code constants) ← project file
//! (`.evonest/config.json`, JSON with comment tolerance) ← runtime overrides
//! (flat dotted keys). Level presets (`quick` / `standard` / `deep`) apply
//! last as a bundle; a runtime `--level` beats the project `active_level`,
//! which beats the default.
//!
//! Merge semantics: objects deep-merge, scalars and lists replace, and an
//! explicit `null` replaces the default with null (distinct from a missing
//! key, which inherits).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::mutation::PersonaGroup;
use crate::state::ProjectState;

/// Level preset selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Quick,
    Standard,
    Deep,
}

impl std::str::FromStr for Level {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(EngineError::config(format!("unknown level '{other}'"))),
        }
    }
}

/// Delivery mode for successful changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeOutput {
    Commit,
    Pr,
}

/// LM choice hint, mapped to the subprocess `--model` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelChoice {
    Haiku,
    Sonnet,
    Opus,
}

impl ModelChoice {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
        }
    }
}

impl std::str::FromStr for ModelChoice {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "haiku" => Ok(Self::Haiku),
            "sonnet" => Ok(Self::Sonnet),
            "opus" => Ok(Self::Opus),
            other => Err(EngineError::config(format!("unknown model '{other}'"))),
        }
    }
}

/// Observe turn-budget mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserveMode {
    Auto,
    Quick,
    Deep,
}

/// Shell commands run by the verify phase. `null` (or missing) skips a gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    pub build: Option<String>,
    pub test: Option<String>,
}

/// Hard turn caps per phase. `observe: null` means the budget scales with
/// project file count (see [`EngineConfig::observe_turns`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaxTurns {
    pub meta_observe: u32,
    pub scout: u32,
    pub observe: Option<u32>,
    pub plan: u32,
    pub execute: u32,
}

impl Default for MaxTurns {
    fn default() -> Self {
        Self {
            meta_observe: 20,
            scout: 15,
            observe: None,
            plan: 15,
            execute: 60,
        }
    }
}

/// Resolved engine configuration. Immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub active_level: Level,
    /// Natural language for generated artifacts.
    pub language: String,
    pub code_output: CodeOutput,
    pub model: ModelChoice,
    pub max_cycles_per_run: u32,
    pub verify: VerifyConfig,
    pub observe_mode: ObserveMode,
    /// In auto mode, observe goes deep every N cycles.
    pub deep_cycle_interval: u64,
    pub observe_turns_min_quick: u32,
    pub observe_turns_min_deep: u32,
    pub observe_turns_quick_ratio: f64,
    pub observe_turns_deep_ratio: f64,
    pub max_turns: MaxTurns,
    pub adversarial_probability: f64,
    /// Persona group filter; empty means all groups.
    pub active_groups: Vec<PersonaGroup>,
    /// Per-persona enable toggles (default true).
    pub personas: BTreeMap<String, bool>,
    /// Per-adversarial enable toggles (default true).
    pub adversarials: BTreeMap<String, bool>,
    pub meta_cycle_interval: u64,
    pub max_dynamic_personas: usize,
    pub max_dynamic_adversarials: usize,
    pub dynamic_mutation_ttl_cycles: u64,
    pub scout_enabled: bool,
    pub scout_cycle_interval: u64,
    /// 1–10; findings at or above this score become stimuli.
    pub scout_min_relevance_score: u8,
    /// LM subprocess executable.
    pub lm_binary: String,
    /// Rate-limit backoff ceiling.
    pub lm_max_retries: u32,
    /// Wall-clock cap per LM invocation.
    pub phase_timeout_secs: u64,
    /// argv template for `code_output = "pr"`; `null` uses `gh pr create`.
    pub pr_command: Option<String>,
    /// `--author` value for engine commits.
    pub git_author: Option<String>,
    /// From `EVONEST_NO_META`; never persisted.
    #[serde(skip)]
    pub no_meta: bool,
    /// From `EVONEST_NO_SCOUT`; never persisted.
    #[serde(skip)]
    pub no_scout: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            active_level: Level::Standard,
            language: "english".to_string(),
            code_output: CodeOutput::Commit,
            model: ModelChoice::Sonnet,
            max_cycles_per_run: 5,
            verify: VerifyConfig::default(),
            observe_mode: ObserveMode::Auto,
            deep_cycle_interval: 10,
            observe_turns_min_quick: 15,
            observe_turns_min_deep: 30,
            observe_turns_quick_ratio: 0.10,
            observe_turns_deep_ratio: 0.50,
            max_turns: MaxTurns::default(),
            adversarial_probability: 0.20,
            active_groups: Vec::new(),
            personas: BTreeMap::new(),
            adversarials: BTreeMap::new(),
            meta_cycle_interval: 5,
            max_dynamic_personas: 5,
            max_dynamic_adversarials: 3,
            dynamic_mutation_ttl_cycles: 15,
            scout_enabled: true,
            scout_cycle_interval: 10,
            scout_min_relevance_score: 6,
            lm_binary: "claude".to_string(),
            lm_max_retries: 3,
            phase_timeout_secs: 1800,
            pr_command: None,
            git_author: None,
            no_meta: false,
            no_scout: false,
        }
    }
}

/// Overrides passed at invocation time (CLI `--set key=value`, `--level`).
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub level: Option<Level>,
    pub set: BTreeMap<String, Value>,
}

/// Environment-variable overrides, read once at engine construction.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub model: Option<String>,
    pub no_meta: bool,
    pub no_scout: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            model: std::env::var("EVONEST_MODEL").ok().filter(|s| !s.is_empty()),
            no_meta: env_flag("EVONEST_NO_META"),
            no_scout: env_flag("EVONEST_NO_SCOUT"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl EngineConfig {
    /// Load and resolve the config for a project.
    pub fn load(
        state: &ProjectState,
        runtime: &RuntimeOverrides,
        env: &EnvOverrides,
    ) -> EngineResult<Self> {
        let text = state.read_config_text()?;
        Self::resolve(text.as_deref(), runtime, env)
    }

    /// Pure three-tier resolution over an optional project-file text.
    pub fn resolve(
        project_text: Option<&str>,
        runtime: &RuntimeOverrides,
        env: &EnvOverrides,
    ) -> EngineResult<Self> {
        let mut merged = serde_json::to_value(Self::default())
            .map_err(|e| EngineError::config(e.to_string()))?;

        if let Some(text) = project_text {
            let stripped = strip_json_comments(text);
            let project: Value = serde_json::from_str(&stripped)
                .map_err(|e| EngineError::config(format!("config.json: {e}")))?;
            if !project.is_object() {
                return Err(EngineError::config("config.json must be a JSON object"));
            }
            deep_merge(&mut merged, project);
        }

        for (key, value) in &runtime.set {
            set_dotted(&mut merged, key, value.clone())?;
        }

        let level = match runtime.level {
            Some(level) => level,
            None => match merged.get("active_level") {
                Some(Value::String(s)) => s.parse()?,
                Some(other) => {
                    return Err(EngineError::config(format!(
                        "active_level must be a string, got {other}"
                    )))
                }
                None => Level::Standard,
            },
        };
        apply_level_preset(&mut merged, level)?;

        let mut config: Self = serde_json::from_value(merged)
            .map_err(|e| EngineError::config(e.to_string()))?;
        config.active_level = level;

        if let Some(model) = &env.model {
            config.model = model.parse()?;
        }
        config.no_meta = env.no_meta;
        config.no_scout = env.no_scout;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.adversarial_probability) {
            return Err(EngineError::config(
                "adversarial_probability must be in [0, 1]",
            ));
        }
        if !(1..=10).contains(&self.scout_min_relevance_score) {
            return Err(EngineError::config(
                "scout_min_relevance_score must be in 1..=10",
            ));
        }
        for (name, value) in [
            ("meta_cycle_interval", self.meta_cycle_interval),
            ("scout_cycle_interval", self.scout_cycle_interval),
            ("deep_cycle_interval", self.deep_cycle_interval),
        ] {
            if value == 0 {
                return Err(EngineError::config(format!("{name} must be >= 1")));
            }
        }
        if self.observe_turns_quick_ratio <= 0.0 || self.observe_turns_deep_ratio <= 0.0 {
            return Err(EngineError::config("observe turn ratios must be positive"));
        }
        if self.lm_binary.is_empty() {
            return Err(EngineError::config("lm_binary must not be empty"));
        }
        for (key, command) in [
            ("verify.build", &self.verify.build),
            ("verify.test", &self.verify.test),
            ("pr_command", &self.pr_command),
        ] {
            if let Some(command) = command {
                let argv = shlex::split(command);
                if argv.as_ref().is_none_or(|argv| argv.is_empty()) {
                    return Err(EngineError::config(format!(
                        "{key}: unparseable command {command:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Observe turn budget: the configured cap, or the file-count scaled
    /// value floored at the mode minimum.
    pub fn observe_turns(&self, deep: bool, project_file_count: usize) -> u32 {
        if let Some(configured) = self.max_turns.observe {
            return configured;
        }
        let (floor, ratio) = if deep {
            (self.observe_turns_min_deep, self.observe_turns_deep_ratio)
        } else {
            (self.observe_turns_min_quick, self.observe_turns_quick_ratio)
        };
        let scaled = (project_file_count as f64 * ratio).ceil() as u32;
        scaled.max(floor)
    }

    /// Whether this cycle's observe runs in deep mode.
    pub fn is_deep_cycle(&self, cycle: u64) -> bool {
        match self.observe_mode {
            ObserveMode::Quick => false,
            ObserveMode::Deep => true,
            ObserveMode::Auto => cycle % self.deep_cycle_interval == 0,
        }
    }

    /// Whether the meta-observe gate fires on this cycle.
    pub fn meta_due(&self, cycle: u64) -> bool {
        !self.no_meta && cycle % self.meta_cycle_interval == 0
    }

    /// Whether the scout gate fires on this cycle.
    pub fn scout_due(&self, cycle: u64) -> bool {
        self.scout_enabled && !self.no_scout && cycle % self.scout_cycle_interval == 0
    }
}

/// Set one dotted key in the project config file and persist it.
///
/// The value text is parsed as JSON when possible, else taken as a string.
/// The updated document is validated against the schema before writing.
pub fn update_project_config(state: &ProjectState, key: &str, value_text: &str) -> EngineResult<()> {
    let value: Value = serde_json::from_str(value_text)
        .unwrap_or_else(|_| Value::String(value_text.to_string()));

    let mut project = match state.read_config_text()? {
        Some(text) => {
            let stripped = strip_json_comments(&text);
            serde_json::from_str(&stripped)
                .map_err(|e| EngineError::config(format!("config.json: {e}")))?
        }
        None => Value::Object(serde_json::Map::new()),
    };

    set_dotted(&mut project, key, value)?;

    // Type-check against the schema before persisting.
    let serialized = serde_json::to_string(&project)
        .map_err(|e| EngineError::config(e.to_string()))?;
    EngineConfig::resolve(
        Some(&serialized),
        &RuntimeOverrides::default(),
        &EnvOverrides::default(),
    )?;

    state.write_config_value(&project)
}

/// Recursive merge: objects merge per key, everything else (including
/// explicit `null`) replaces.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Write `value` at a dotted path, creating leaves only under objects that
/// already exist (so typos like `verfiy.test` fail instead of silently
/// adding a tree the schema then rejects with a better message).
fn set_dotted(root: &mut Value, key: &str, value: Value) -> EngineResult<()> {
    let mut parts = key.split('.').peekable();
    let mut cursor = root;
    loop {
        let part = parts
            .next()
            .ok_or_else(|| EngineError::config(format!("empty config key '{key}'")))?;
        if part.is_empty() {
            return Err(EngineError::config(format!("malformed config key '{key}'")));
        }
        let map = cursor
            .as_object_mut()
            .ok_or_else(|| EngineError::config(format!("'{key}': '{part}' is not an object")))?;
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return Ok(());
        }
        cursor = map
            .get_mut(part)
            .ok_or_else(|| EngineError::config(format!("unknown config key '{key}'")))?;
    }
}

fn apply_level_preset(merged: &mut Value, level: Level) -> EngineResult<()> {
    let preset: &[(&str, Value)] = match level {
        Level::Standard => &[],
        Level::Quick => &[
            ("model", Value::String("haiku".into())),
            ("observe_mode", Value::String("quick".into())),
            ("max_turns.observe", Value::from(15u32)),
            ("max_turns.plan", Value::from(10u32)),
            ("max_turns.execute", Value::from(40u32)),
        ],
        Level::Deep => &[
            ("model", Value::String("opus".into())),
            ("observe_mode", Value::String("deep".into())),
            ("max_turns.observe", Value::from(40u32)),
            ("max_turns.plan", Value::from(20u32)),
            ("max_turns.execute", Value::from(80u32)),
        ],
    };
    for (key, value) in preset {
        set_dotted(merged, key, value.clone())?;
    }
    Ok(())
}

/// Strip `//` line comments and `/* */` block comments outside strings.
pub fn strip_json_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    for next in chars.by_ref() {
                        if next == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                }
                _ => out.push(ch),
            },
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(project: Option<&str>) -> EngineResult<EngineConfig> {
        EngineConfig::resolve(project, &RuntimeOverrides::default(), &EnvOverrides::default())
    }

    #[test]
    fn defaults_resolve_clean() {
        let config = resolve(None).unwrap();
        assert_eq!(config.model, ModelChoice::Sonnet);
        assert_eq!(config.max_cycles_per_run, 5);
        assert_eq!(config.adversarial_probability, 0.20);
        assert!(config.verify.build.is_none());
    }

    #[test]
    fn project_file_overrides_defaults() {
        let config = resolve(Some(
            r#"{
                // project tweaks
                "max_cycles_per_run": 2,
                "verify": { "test": "cargo test" }
            }"#,
        ))
        .unwrap();
        assert_eq!(config.max_cycles_per_run, 2);
        assert_eq!(config.verify.test.as_deref(), Some("cargo test"));
        // untouched sibling inherits the default
        assert!(config.verify.build.is_none());
    }

    #[test]
    fn explicit_null_is_unset_not_missing() {
        let config = resolve(Some(
            r#"{ "verify": { "build": null, "test": "pytest" } }"#,
        ))
        .unwrap();
        assert!(config.verify.build.is_none());
        assert_eq!(config.verify.test.as_deref(), Some("pytest"));
    }

    #[test]
    fn runtime_override_beats_project_file() {
        let mut runtime = RuntimeOverrides::default();
        runtime
            .set
            .insert("max_cycles_per_run".into(), Value::from(9u32));
        let config = EngineConfig::resolve(
            Some(r#"{ "max_cycles_per_run": 2 }"#),
            &runtime,
            &EnvOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.max_cycles_per_run, 9);
    }

    #[test]
    fn unknown_keys_are_config_errors() {
        assert!(matches!(
            resolve(Some(r#"{ "max_cycels": 2 }"#)),
            Err(EngineError::Config { .. })
        ));

        let mut runtime = RuntimeOverrides::default();
        runtime.set.insert("verfiy.test".into(), Value::from("x"));
        assert!(matches!(
            EngineConfig::resolve(None, &runtime, &EnvOverrides::default()),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn persona_toggles_accept_arbitrary_ids() {
        let config = resolve(Some(r#"{ "personas": { "architect": false } }"#)).unwrap();
        assert_eq!(config.personas.get("architect"), Some(&false));
    }

    #[test]
    fn runtime_level_beats_project_level() {
        let runtime = RuntimeOverrides {
            level: Some(Level::Quick),
            set: BTreeMap::new(),
        };
        let config = EngineConfig::resolve(
            Some(r#"{ "active_level": "deep" }"#),
            &runtime,
            &EnvOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.active_level, Level::Quick);
        assert_eq!(config.model, ModelChoice::Haiku);
        assert_eq!(config.observe_mode, ObserveMode::Quick);
        assert_eq!(config.max_turns.observe, Some(15));
    }

    #[test]
    fn project_level_beats_default() {
        let config = resolve(Some(r#"{ "active_level": "deep" }"#)).unwrap();
        assert_eq!(config.model, ModelChoice::Opus);
        assert_eq!(config.max_turns.execute, 80);
    }

    #[test]
    fn env_model_beats_everything() {
        let env = EnvOverrides {
            model: Some("haiku".into()),
            ..Default::default()
        };
        let config = EngineConfig::resolve(
            Some(r#"{ "active_level": "deep" }"#),
            &RuntimeOverrides::default(),
            &env,
        )
        .unwrap();
        assert_eq!(config.model, ModelChoice::Haiku);
    }

    #[test]
    fn bad_level_and_bad_probability_fail() {
        assert!(resolve(Some(r#"{ "active_level": "extreme" }"#)).is_err());
        assert!(resolve(Some(r#"{ "adversarial_probability": 1.5 }"#)).is_err());
        assert!(resolve(Some(r#"{ "scout_min_relevance_score": 0 }"#)).is_err());
    }

    #[test]
    fn observe_turns_scale_with_file_count() {
        let config = resolve(None).unwrap();
        // quick: max(15, 200 * 0.10) = 20
        assert_eq!(config.observe_turns(false, 200), 20);
        // quick floor wins on small projects
        assert_eq!(config.observe_turns(false, 10), 15);
        // deep: max(30, 200 * 0.50) = 100
        assert_eq!(config.observe_turns(true, 200), 100);

        let pinned = resolve(Some(r#"{ "max_turns": { "observe": 7 } }"#)).unwrap();
        assert_eq!(pinned.observe_turns(true, 10_000), 7);
    }

    #[test]
    fn gate_scheduling_helpers() {
        let config = resolve(None).unwrap();
        assert!(config.meta_due(5));
        assert!(!config.meta_due(4));
        assert!(config.scout_due(10));
        assert!(!config.scout_due(5));
        assert!(config.is_deep_cycle(10));
        assert!(!config.is_deep_cycle(3));
    }

    #[test]
    fn comment_stripping_preserves_strings() {
        let stripped = strip_json_comments(
            "{\n  // comment\n  \"a\": \"http://not-a-comment\", /* gone */ \"b\": 1\n}",
        );
        let value: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], "http://not-a-comment");
        assert_eq!(value["b"], 1);
    }

    #[test]
    fn dotted_setter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = ProjectState::init_project(dir.path()).unwrap();

        update_project_config(&state, "verify.test", "\"cargo test -q\"").unwrap();
        update_project_config(&state, "max_cycles_per_run", "3").unwrap();

        let config = EngineConfig::load(
            &state,
            &RuntimeOverrides::default(),
            &EnvOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.verify.test.as_deref(), Some("cargo test -q"));
        assert_eq!(config.max_cycles_per_run, 3);

        // Schema violations never hit disk.
        assert!(update_project_config(&state, "max_cycles_per_run", "\"many\"").is_err());
        let config = EngineConfig::load(
            &state,
            &RuntimeOverrides::default(),
            &EnvOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.max_cycles_per_run, 3);
    }
}
