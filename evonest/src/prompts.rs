//! Prompt assembly for every phase.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content
//! changes, so history records can be correlated with the prompt text that
//! produced them.

use std::fmt::Write as _;

use crate::identity::Identity;
use crate::mutation::{Adversarial, Persona};
use crate::phases::envelope::PlanEnvelope;
use crate::state::types::{
    AdviceRecord, BacklogItem, BacklogStatus, CycleRecord, EnvironmentSnapshot, ProgressState,
};

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

const OBSERVE_PREAMBLE: &str = "\
You are the observation pass of an autonomous evolution engine. Your job is \
to study this project from one specific perspective and surface concrete, \
actionable improvements. You may read files but must not modify anything.
";

const PLAN_PREAMBLE: &str = "\
You are the planning pass of an autonomous evolution engine. Pick exactly ONE \
backlog item worth doing right now and produce a concrete execution plan for \
it. You may read files but must not modify anything.

Decision order when choosing: fix failing tests, then fix build errors, then \
add missing test coverage, then fix bugs, then improve code quality, then \
refactor, then new features. If nothing on the backlog is worth doing, select \
null.
";

const EXECUTE_PREAMBLE: &str = "\
You are the execution pass of an autonomous evolution engine. Carry out the \
plan below, touching ONLY the files it lists. Make the smallest change that \
achieves the expected outcome. Do not run destructive commands, do not \
commit, and do not touch anything under a protected path.
";

const META_PREAMBLE: &str = "\
You are the meta-observation pass of an autonomous evolution engine. Step \
back from individual cycles and look at the trajectory: which perspectives \
are earning their keep, what the backlog says about blind spots, and where \
the next few cycles should focus. You may propose new personas and \
adversarial challenges, and drop guidance notes the next observation pass \
will read.
";

const SCOUT_PREAMBLE: &str = "\
You are the scouting pass of an autonomous evolution engine. Search outside \
the project for developments relevant to its mission: libraries, techniques, \
standards, ecosystem shifts. Score each finding 1-10 for relevance to this \
specific project.
";

fn section(out: &mut String, title: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    let _ = writeln!(out, "## {title}\n\n{}\n", body.trim_end());
}

fn language_note(out: &mut String, language: &str) {
    if !language.eq_ignore_ascii_case("english") {
        let _ = writeln!(out, "Write all generated text in {language}.\n");
    }
}

/// One line per recent cycle, newest last.
pub fn history_summary(records: &[CycleRecord]) -> String {
    records
        .iter()
        .map(|r| format!("- cycle {}: {}", r.cycle_number, r.status_line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn environment_summary(env: &EnvironmentSnapshot) -> String {
    let mut extensions: Vec<(&String, &usize)> = env.files_by_extension.iter().collect();
    extensions.sort_by(|a, b| b.1.cmp(a.1));
    let top: Vec<String> = extensions
        .iter()
        .take(6)
        .map(|(ext, count)| format!(".{ext} x{count}"))
        .collect();
    format!(
        "{} files ({}). Build files: {}. Top-level dirs: {}.",
        env.file_count,
        top.join(", "),
        if env.build_files.is_empty() {
            "none".to_string()
        } else {
            env.build_files.join(", ")
        },
        env.top_level_dirs.join(", ")
    )
}

fn mutation_header(out: &mut String, persona: &Persona, adversarial: Option<&Adversarial>) {
    section(
        out,
        &format!("Your Perspective: {}", persona.name),
        &persona.perspective,
    );
    if let Some(adv) = adversarial {
        section(
            out,
            &format!("Adversarial Challenge: {}", adv.name),
            &adv.challenge,
        );
    }
}

#[allow(clippy::too_many_arguments)]
pub fn observe_prompt(
    identity: &Identity,
    language: &str,
    persona: &Persona,
    adversarial: Option<&Adversarial>,
    environment: &EnvironmentSnapshot,
    history: &[CycleRecord],
    progress: &ProgressState,
    advice: Option<&AdviceRecord>,
    stimuli: &[String],
    decisions: &[String],
) -> String {
    let mut out = String::from(OBSERVE_PREAMBLE);
    out.push('\n');
    language_note(&mut out, language);
    mutation_header(&mut out, persona, adversarial);
    section(&mut out, "Project Identity", identity.text());
    section(&mut out, "Project Shape", &environment_summary(environment));
    section(&mut out, "Recent Cycles", &history_summary(history));

    if !progress.converged_areas.is_empty() {
        let areas: Vec<&str> = progress.converged_areas.iter().map(String::as_str).collect();
        section(
            &mut out,
            "Converged Areas",
            &format!(
                "These directories were worked repeatedly without a clean \
                 change landing: {}. Avoid them, or try a genuinely different \
                 angle.",
                areas.join(", ")
            ),
        );
    }

    if let Some(advice) = advice {
        section(
            &mut out,
            "Strategic Advice",
            &format!("{} (focus: {})", advice.direction, advice.focus.join(", ")),
        );
    }
    if !stimuli.is_empty() {
        section(&mut out, "Injected Guidance (one-shot)", &stimuli.join("\n---\n"));
    }
    if !decisions.is_empty() {
        section(
            &mut out,
            "Standing Decisions (strictly overriding)",
            &decisions.join("\n---\n"),
        );
    }

    section(
        &mut out,
        "Response Format",
        r#"End with ONLY a JSON object, no markdown fences:
{
  "improvements": [
    {
      "title": "short imperative title",
      "description": "what and why",
      "category": "test-coverage|bug|refactor|proposal|ecosystem",
      "priority": "high|medium|low",
      "files": ["paths/involved.rs"]
    }
  ],
  "observations": "free-text notes on what you saw"
}"#,
    );
    out
}

pub fn plan_prompt(
    identity: &Identity,
    language: &str,
    persona: &Persona,
    backlog: &[BacklogItem],
    decisions: &[String],
) -> String {
    let mut out = String::from(PLAN_PREAMBLE);
    out.push('\n');
    language_note(&mut out, language);
    mutation_header(&mut out, persona, None);
    section(&mut out, "Project Identity", identity.text());

    let mut rows = String::new();
    for item in backlog.iter().filter(|i| i.status == BacklogStatus::Pending) {
        let _ = writeln!(
            rows,
            "- `{}` [{:?}/{}] attempts={} files={} — {}: {}",
            item.id,
            item.priority,
            item.category,
            item.attempts,
            item.files.join(","),
            item.title,
            item.description
        );
    }
    section(&mut out, "Pending Backlog", &rows);
    if !decisions.is_empty() {
        section(
            &mut out,
            "Standing Decisions (strictly overriding)",
            &decisions.join("\n---\n"),
        );
    }

    section(
        &mut out,
        "Response Format",
        r#"End with ONLY a JSON object, no markdown fences:
{
  "selected_improvement": "backlog id, or null if nothing is worth doing",
  "steps": ["ordered concrete steps"],
  "files_to_read": [], "files_to_modify": [], "files_to_create": [],
  "expected_outcome": "observable result",
  "risk_level": "low|medium|high",
  "commit_message": "imperative, one line"
}"#,
    );
    out
}

pub fn execute_prompt(
    identity: &Identity,
    language: &str,
    plan: &PlanEnvelope,
    decisions: &[String],
) -> String {
    let mut out = String::from(EXECUTE_PREAMBLE);
    out.push('\n');
    language_note(&mut out, language);

    let mut plan_text = String::new();
    let _ = writeln!(plan_text, "Goal: {}", plan.expected_outcome);
    for (index, step) in plan.steps.iter().enumerate() {
        let _ = writeln!(plan_text, "{}. {}", index + 1, step);
    }
    let _ = writeln!(plan_text, "Read: {}", plan.files_to_read.join(", "));
    let _ = writeln!(plan_text, "Modify: {}", plan.files_to_modify.join(", "));
    let _ = writeln!(plan_text, "Create: {}", plan.files_to_create.join(", "));
    section(&mut out, "Plan", &plan_text);

    if !identity.boundaries().is_empty() {
        section(
            &mut out,
            "Protected Paths (never touch)",
            &identity
                .boundaries()
                .iter()
                .map(|b| format!("- {b}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }
    if !decisions.is_empty() {
        section(
            &mut out,
            "Standing Decisions (strictly overriding)",
            &decisions.join("\n---\n"),
        );
    }

    section(
        &mut out,
        "Response Format",
        r#"End with ONLY a JSON object, no markdown fences:
{
  "files_modified": ["..."],
  "files_created": ["..."],
  "summary": "what changed, one paragraph"
}"#,
    );
    out
}

pub fn meta_observe_prompt(
    identity: &Identity,
    language: &str,
    history: &[CycleRecord],
    progress: &ProgressState,
    persona_roster: &str,
    backlog: &[BacklogItem],
) -> String {
    let mut out = String::from(META_PREAMBLE);
    out.push('\n');
    language_note(&mut out, language);
    section(&mut out, "Project Identity", identity.text());
    section(&mut out, "Recent Cycles", &history_summary(history));

    let mut stats = String::new();
    let _ = writeln!(
        stats,
        "total cycles: {}, successes: {}",
        progress.total_cycles, progress.total_successes
    );
    for (id, s) in &progress.personas {
        let _ = writeln!(
            stats,
            "- {id}: uses={} successes={} failures={}",
            s.uses, s.successes, s.failures
        );
    }
    section(&mut out, "Persona Statistics", &stats);
    section(&mut out, "Current Mutations", persona_roster);

    let pending = backlog
        .iter()
        .filter(|i| i.status == BacklogStatus::Pending)
        .count();
    let stale = backlog
        .iter()
        .filter(|i| i.status == BacklogStatus::Stale)
        .count();
    section(
        &mut out,
        "Backlog Shape",
        &format!("{pending} pending, {stale} stale, {} total", backlog.len()),
    );

    section(
        &mut out,
        "Response Format",
        r#"End with ONLY a JSON object, no markdown fences:
{
  "new_personas": [{"name": "...", "group": "tech|biz|quality", "perspective": "..."}],
  "new_adversarials": [{"name": "...", "challenge": "..."}],
  "auto_stimuli": [{"title": "...", "content": "guidance for the next observe"}],
  "advice": "strategic direction for the next few cycles, or null"
}"#,
    );
    out
}

pub fn scout_prompt(identity: &Identity, language: &str, keywords: &[String], min_score: u8) -> String {
    let mut out = String::from(SCOUT_PREAMBLE);
    out.push('\n');
    language_note(&mut out, language);
    section(&mut out, "Project Identity", identity.text());
    section(&mut out, "Search Keywords", &keywords.join(", "));
    section(
        &mut out,
        "Response Format",
        &format!(
            r#"Only findings scoring {min_score} or higher will be used. End with ONLY a JSON object:
{{
  "findings": [
    {{"title": "...", "source_url": "https://...", "relevance_score": 1, "summary": "..."}}
  ]
}}"#
        ),
    );
    out
}
