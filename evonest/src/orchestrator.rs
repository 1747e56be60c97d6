//! The cycle orchestrator.
//!
//! Single-threaded and sequential: gate phases, mutation selection, observe,
//! plan, execute, verify, then commit-or-revert, progress update, and the
//! history append — one cycle at a time, holding the project lock for the
//! whole run. Three entry modes (`analyze`, `improve`, `evolve`) plus the
//! cautious pause/resume pair that survives process restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backlog;
use crate::config::{CodeOutput, EngineConfig, EnvOverrides, RuntimeOverrides};
use crate::environment;
use crate::error::{EngineError, EngineResult};
use crate::git::GitGateway;
use crate::identity::Identity;
use crate::lock::LockGuard;
use crate::mutation::MutationCatalog;
use crate::phases::envelope::PlanEnvelope;
use crate::phases::{
    load_plan_artifact, run_execute, run_meta_observe, run_observe, run_plan, run_scout,
    run_verify, ObserveInput, PhaseCtx, VerifyVerdict,
};
use crate::progress;
use crate::runner::{ClaudeRunner, ModelRunner};
use crate::scheduler;
use crate::state::types::{
    BacklogStatus, CautiousResume, CycleRecord, Outcome, PhaseKind, PhaseRecord, ProgressState,
};
use crate::state::{slugify, ProjectState};

/// Pseudo persona id used for cycles that execute an existing proposal.
const IMPROVE_PERSONA: &str = "improve";

/// Entry mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Analyze,
    Improve,
    Evolve,
    Resume,
}

/// Options for `evolve`.
#[derive(Debug, Clone, Default)]
pub struct EvolveOptions {
    /// Override `max_cycles_per_run`.
    pub cycles: Option<u32>,
    /// Suspend after Plan and leave a resume token.
    pub cautious: bool,
    /// Deterministic persona sweep instead of weighted sampling.
    pub all_personas: bool,
}

/// Options for `analyze`.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub cycles: Option<u32>,
    pub all_personas: bool,
}

/// Options for `improve`.
#[derive(Debug, Clone, Default)]
pub struct ImproveOptions {
    /// Proposal filename (or unique prefix). `None` auto-picks the oldest.
    pub proposal: Option<String>,
    /// Keep going until the pending proposal queue is empty.
    pub all: bool,
}

/// What a run did, cycle by cycle.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: RunMode,
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub status_lines: Vec<String>,
    /// True when a cautious run suspended after Plan.
    pub paused: bool,
}

impl RunSummary {
    fn new(mode: RunMode) -> Self {
        Self {
            mode,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            status_lines: Vec::new(),
            paused: false,
        }
    }

    fn absorb(&mut self, record: &CycleRecord) {
        self.attempted += 1;
        match record.outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Failure => self.failed += 1,
            Outcome::Skipped | Outcome::Aborted => self.skipped += 1,
        }
        self.status_lines.push(record.status_line.clone());
    }

    /// Run-level verify verdict: any failed cycle taints the run (exit 4).
    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }

    pub fn headline(&self) -> String {
        if self.paused {
            return format!(
                "paused after plan; resume with `evonest resume` ({} cycle(s) recorded)",
                self.attempted
            );
        }
        format!(
            "{} succeeded of {} attempted ({} failed, {} skipped)",
            self.succeeded, self.attempted, self.failed, self.skipped
        )
    }
}

/// How one evolve cycle ended, seen from the outer loop.
enum CycleEnd {
    Completed(CycleRecord),
    /// Plan returned null: record it and stop the run.
    PlanExhausted(CycleRecord),
    /// Cautious pause: nothing recorded yet, lock must be released.
    Paused,
}

/// The engine: one project, one configuration, one run at a time.
pub struct Engine {
    state: ProjectState,
    config: EngineConfig,
    git: GitGateway,
    runner: Arc<dyn ModelRunner>,
    cancel: CancellationToken,
}

impl Engine {
    /// Open an initialized project with the default (subprocess) runner.
    pub fn open(project_root: &std::path::Path, runtime: &RuntimeOverrides) -> EngineResult<Self> {
        let state = ProjectState::open(project_root)?;
        let config = EngineConfig::load(&state, runtime, &EnvOverrides::from_env())?;
        let runner = Arc::new(ClaudeRunner::new(
            config.lm_binary.clone(),
            config.lm_max_retries,
        ));
        Ok(Self::with_runner(state, config, runner))
    }

    /// Wire an engine over explicit parts; tests inject scripted runners.
    pub fn with_runner(
        state: ProjectState,
        config: EngineConfig,
        runner: Arc<dyn ModelRunner>,
    ) -> Self {
        let git = GitGateway::new(state.project_root());
        Self {
            state,
            config,
            git,
            runner,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token cancelled by the SIGINT handler; checked at phase boundaries.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn identity(&self) -> EngineResult<Identity> {
        Identity::parse(&self.state.read_identity()?)
    }

    fn ctx<'a>(&'a self, identity: &'a Identity, cycle: u64) -> PhaseCtx<'a> {
        PhaseCtx {
            state: &self.state,
            config: &self.config,
            runner: self.runner.as_ref(),
            identity,
            cancel: &self.cancel,
            cycle,
        }
    }

    // ── evolve ──────────────────────────────────────────────────────────────

    /// Full Observe → Plan → Execute → Verify cycles.
    pub async fn evolve(&self, opts: EvolveOptions) -> EngineResult<RunSummary> {
        let lock = LockGuard::acquire(&self.state)?;
        let mut summary = RunSummary::new(RunMode::Evolve);
        let mut progress = progress::reconcile_with_history(&self.state)?;
        let mut catalog = MutationCatalog::load(&self.state, &self.config)?;
        if catalog.enabled_personas().is_empty() {
            return Err(EngineError::NoMutations);
        }

        let max_cycles = opts.cycles.unwrap_or(self.config.max_cycles_per_run);
        let start_cycle = self.state.last_cycle_number()? + 1;
        let mut rng = StdRng::from_os_rng();

        for index in 0..max_cycles {
            if self.cancel.is_cancelled() {
                info!("run cancelled between cycles");
                break;
            }
            if !self.state.lock_path().exists() {
                warn!("lock file vanished mid-run; stopping");
                break;
            }
            let cycle = start_cycle + u64::from(index);
            scheduler::recompute_weights(&mut catalog, &progress, cycle);

            if self.consume_stop_decision()? {
                info!(cycle, "stop decision consumed; ending run");
                break;
            }

            // Select the mutation for this cycle. The adversarial roll is
            // orthogonal and still fires during a deterministic sweep.
            let persona = if opts.all_personas {
                let sweep = scheduler::sorted_enabled_personas(&catalog);
                sweep[index as usize % sweep.len()].clone()
            } else {
                scheduler::select_persona(&catalog.enabled_personas(), &mut rng)?.clone()
            };
            let adversarial = scheduler::roll_adversarial(
                &catalog.enabled_adversarials(),
                self.config.adversarial_probability,
                &mut rng,
            )
            .cloned();

            let end = self
                .run_evolve_cycle(
                    cycle,
                    &persona,
                    adversarial.as_ref().map(|a| a.id.as_str()),
                    &mut catalog,
                    &mut progress,
                    opts.cautious,
                )
                .await?;

            match end {
                CycleEnd::Completed(record) => {
                    self.finish_cycle(&record, &mut progress)?;
                    summary.absorb(&record);
                }
                CycleEnd::PlanExhausted(record) => {
                    self.finish_cycle(&record, &mut progress)?;
                    summary.absorb(&record);
                    info!(cycle, "plan selected nothing; remaining cycles skipped");
                    break;
                }
                CycleEnd::Paused => {
                    summary.paused = true;
                    lock.release();
                    return Ok(summary);
                }
            }
        }

        info!(summary = %summary.headline(), "evolve run finished");
        Ok(summary)
    }

    /// One full evolve cycle. Non-fatal phase errors become a failure record;
    /// fatal errors propagate and abort the run.
    async fn run_evolve_cycle(
        &self,
        cycle: u64,
        persona: &crate::mutation::Persona,
        adversarial_id: Option<&str>,
        catalog: &mut MutationCatalog,
        progress: &mut ProgressState,
        cautious: bool,
    ) -> EngineResult<CycleEnd> {
        let identity = self.identity()?;
        let ctx = self.ctx(&identity, cycle);
        let mut builder = CycleBuilder::new(cycle, &persona.id, &persona.name, adversarial_id);
        info!(cycle, persona = %persona.id, adversarial = adversarial_id, "cycle starting");

        let mut backlog_items = self.state.load_backlog()?;

        // Gate: meta-observe.
        if self.config.meta_due(cycle) {
            let started = std::time::Instant::now();
            let history = self.state.read_history(20)?;
            match run_meta_observe(&ctx, catalog, progress, &backlog_items, &history).await {
                Ok(_) => builder.phase(PhaseKind::MetaObserve, Outcome::Success, started, None),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    builder.phase(PhaseKind::MetaObserve, Outcome::Failure, started, None);
                    return Ok(CycleEnd::Completed(builder.failure(e.to_string(), vec![])));
                }
            }
        }

        // Gate: scout.
        if self.config.scout_due(cycle) {
            let started = std::time::Instant::now();
            match run_scout(&ctx).await {
                Ok(_) => builder.phase(PhaseKind::Scout, Outcome::Success, started, None),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    builder.phase(PhaseKind::Scout, Outcome::Failure, started, None);
                    return Ok(CycleEnd::Completed(builder.failure(e.to_string(), vec![])));
                }
            }
        }

        // Stimuli are consumed (moved aside) before observe begins, so a
        // crash mid-observe cannot replay them.
        let stimuli = self.drain_stimuli()?;
        let decisions = self.read_decisions()?;

        // Observe.
        let environment = environment::refresh_if_stale(&self.state, cycle)?;
        let history = self.state.read_history(10)?;
        let advice = self.state.read_advice()?;
        let started = std::time::Instant::now();
        let observed = match run_observe(
            &ctx,
            ObserveInput {
                persona,
                adversarial: adversarial_id.and_then(|id| catalog.adversarial(id)),
                progress,
                environment: &environment,
                advice: advice.as_ref(),
                history: &history,
                stimuli,
                decisions: decisions.clone(),
            },
        )
        .await
        {
            Ok(out) => {
                builder.phase(
                    PhaseKind::Observe,
                    Outcome::Success,
                    started,
                    Some(out.artifact_path.display().to_string()),
                );
                out
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                builder.phase(PhaseKind::Observe, Outcome::Failure, started, None);
                return Ok(CycleEnd::Completed(builder.failure(e.to_string(), vec![])));
            }
        };

        backlog::merge_improvements(&mut backlog_items, observed.candidates, cycle);
        self.state.save_backlog(&backlog_items)?;

        // Plan.
        let started = std::time::Instant::now();
        let planned = match run_plan(&ctx, persona, &backlog_items, &decisions).await {
            Ok(out) => {
                builder.phase(
                    PhaseKind::Plan,
                    Outcome::Success,
                    started,
                    Some(out.artifact_path.display().to_string()),
                );
                out
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                builder.phase(PhaseKind::Plan, Outcome::Failure, started, None);
                return Ok(CycleEnd::Completed(builder.failure(e.to_string(), vec![])));
            }
        };

        let Some(selected_id) = planned.envelope.selected_improvement.clone() else {
            return Ok(CycleEnd::PlanExhausted(
                builder.skipped("plan selected no improvement".to_string()),
            ));
        };

        let item = backlog_items
            .iter_mut()
            .find(|item| item.id == selected_id)
            .expect("plan selection validated against backlog");
        let category = item.category.clone();
        let item_title = item.title.clone();
        backlog::begin_attempt(item, cycle)?;
        self.state.save_backlog(&backlog_items)?;

        // Cautious pause: externalize the continuation and stop here.
        if cautious {
            self.state.write_cautious_resume(&CautiousResume {
                cycle_number: cycle,
                plan_artifact_path: planned.artifact_path.display().to_string(),
                persona_id: persona.id.clone(),
                adversarial_id: adversarial_id.map(str::to_string),
                created_at: Utc::now(),
            })?;
            info!(cycle, "cautious pause: plan written, resume token saved");
            return Ok(CycleEnd::Paused);
        }

        let record = self
            .execute_and_verify(
                builder,
                &identity,
                cycle,
                &planned.envelope,
                &decisions,
                Some((selected_id, category, item_title)),
            )
            .await?;
        Ok(CycleEnd::Completed(record))
    }

    /// Execute + verify + commit-or-revert, shared by evolve, improve, and
    /// resume. Consumes decisions once Execute has run.
    async fn execute_and_verify(
        &self,
        mut builder: CycleBuilder,
        identity: &Identity,
        cycle: u64,
        plan: &PlanEnvelope,
        decisions: &[String],
        backlog_target: Option<(String, String, String)>,
    ) -> EngineResult<CycleRecord> {
        let ctx = self.ctx(identity, cycle);
        let stash_label = format!("evonest-cycle-{cycle}");

        // Design-level proposals never touch source: persist the advice and
        // succeed without a checkpoint.
        if let Some((_, category, title)) = &backlog_target {
            if category == "proposal" {
                let filename = self.state.create_proposal(&format!(
                    "# {title}\n\n{}\n\n## Steps\n\n{}\n",
                    plan.expected_outcome,
                    plan.steps.join("\n")
                ))?;
                let started = std::time::Instant::now();
                builder.phase(PhaseKind::Execute, Outcome::Success, started, None);
                builder.phase_skipped(PhaseKind::Verify);
                self.complete_backlog_target(&backlog_target, true)?;
                self.consume_decisions()?;
                return Ok(builder.success(None, None, vec![], format!("proposal {filename}")));
            }
        }

        let stashed = match self.git.stash_push(&stash_label) {
            Ok(stashed) => stashed,
            Err(e) => {
                builder.phase_skipped(PhaseKind::Execute);
                return Ok(builder.failure(e.to_string(), vec![]));
            }
        };

        // Execute.
        let started = std::time::Instant::now();
        let executed = match run_execute(&ctx, plan, decisions).await {
            Ok(out) => {
                builder.phase(PhaseKind::Execute, Outcome::Success, started, None);
                out
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                builder.phase(PhaseKind::Execute, Outcome::Failure, started, None);
                self.git.revert(stashed)?;
                self.fail_backlog_target(&backlog_target)?;
                return Ok(builder.failure(e.to_string(), vec![]));
            }
        };
        self.consume_decisions()?;

        // Verify step 1: diff scope. An empty diff means nothing to do; the
        // backlog item goes back to pending (the attempt produced nothing).
        let touched = self.git.changed_files()?;
        if touched.is_empty() {
            if stashed {
                self.git.stash_pop()?;
            }
            builder.phase_skipped(PhaseKind::Verify);
            self.fail_backlog_target(&backlog_target)?;
            return Ok(builder.skipped("no changes produced".to_string()));
        }

        // Boundary enforcement on what actually changed.
        if let Some(violation) = identity.first_violation(&touched) {
            let violation = violation.to_string();
            builder.phase_skipped(PhaseKind::Verify);
            self.git.revert(stashed)?;
            self.fail_backlog_target(&backlog_target)?;
            scheduler::note_area_outcomes_for(&self.state, &touched, false)?;
            error!(cycle, path = %violation, "boundary violation; cycle reverted");
            return Ok(builder.failure(
                EngineError::BoundaryViolation { path: violation }.to_string(),
                touched,
            ));
        }

        // Verify steps 2-3: build and test gates.
        let started = std::time::Instant::now();
        let verdict = run_verify(
            self.state.project_root(),
            &self.config.verify,
            self.config.phase_timeout_secs,
        )
        .await?;

        match verdict {
            VerifyVerdict::Failed { gate, detail } => {
                builder.phase(PhaseKind::Verify, Outcome::Failure, started, None);
                self.git.revert(stashed)?;
                self.fail_backlog_target(&backlog_target)?;
                scheduler::note_area_outcomes_for(&self.state, &touched, false)?;
                let reason = format!("verify {gate} failed: {}", first_line(&detail));
                Ok(builder.failure(reason, touched))
            }
            VerifyVerdict::Passed => {
                builder.phase(PhaseKind::Verify, Outcome::Success, started, None);
                let message = if plan.commit_message.is_empty() {
                    format!("evonest: cycle {cycle}")
                } else {
                    plan.commit_message.clone()
                };
                match self.deliver(cycle, &message, executed.envelope.summary.as_str()) {
                    Ok((sha, pr_url)) => {
                        if stashed {
                            warn!(
                                label = %stash_label,
                                "pre-cycle changes remain stashed; pop manually when ready"
                            );
                        }
                        self.complete_backlog_target(&backlog_target, true)?;
                        scheduler::note_area_outcomes_for(&self.state, &touched, true)?;
                        Ok(builder.success(sha, pr_url, touched, message))
                    }
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        // Commit/push failed with the changes still in the
                        // tree: discard them like any other failed cycle.
                        if self.git.has_changes()? {
                            self.git.revert(stashed)?;
                        } else if stashed {
                            self.git.stash_pop().map_err(|pop| {
                                EngineError::RevertFailed {
                                    message: pop.to_string(),
                                }
                            })?;
                        }
                        self.fail_backlog_target(&backlog_target)?;
                        scheduler::note_area_outcomes_for(&self.state, &touched, false)?;
                        Ok(builder.failure(format!("delivery failed: {e}"), touched))
                    }
                }
            }
        }
    }

    /// Deliver a passing change: plain commit, or branch + push + PR.
    fn deliver(
        &self,
        cycle: u64,
        message: &str,
        body: &str,
    ) -> EngineResult<(Option<String>, Option<String>)> {
        match self.config.code_output {
            CodeOutput::Commit => {
                let sha = self
                    .git
                    .commit(message, self.config.git_author.as_deref())?;
                Ok((Some(sha), None))
            }
            CodeOutput::Pr => {
                let original = self.git.current_branch()?;
                let branch = format!("evonest/{cycle}-{}", slugify(message));
                let result: EngineResult<(Option<String>, Option<String>)> = (|| {
                    self.git.create_branch(&branch)?;
                    let sha = self
                        .git
                        .commit(message, self.config.git_author.as_deref())?;
                    self.git.push_branch(&branch)?;
                    let url = self.run_pr_command(&branch, message, body)?;
                    Ok((Some(sha), Some(url)))
                })();
                if result.is_err() {
                    // Leave the branch for forensics but return to the
                    // original line of development.
                    if let Err(e) = self.git.checkout_branch(&original) {
                        warn!(branch = %original, error = %e, "could not return to original branch");
                    }
                } else {
                    self.git.checkout_branch(&original)?;
                }
                result
            }
        }
    }

    fn run_pr_command(&self, branch: &str, title: &str, body: &str) -> EngineResult<String> {
        let argv: Vec<String> = match &self.config.pr_command {
            Some(template) => {
                let rendered = template
                    .replace("{branch}", branch)
                    .replace("{title}", title)
                    .replace("{body}", body);
                shlex::split(&rendered).ok_or_else(|| {
                    EngineError::config(format!("pr_command: unparseable {template:?}"))
                })?
            }
            None => vec![
                "gh".into(),
                "pr".into(),
                "create".into(),
                "--title".into(),
                title.into(),
                "--body".into(),
                body.into(),
            ],
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(EngineError::config("pr_command is empty"));
        };
        let output = std::process::Command::new(program)
            .args(args)
            .current_dir(self.state.project_root())
            .output()
            .map_err(|e| EngineError::git("pr", e.to_string()))?;
        if !output.status.success() {
            return Err(EngineError::git(
                "pr",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().last().unwrap_or_default().trim().to_string())
    }

    // ── analyze ─────────────────────────────────────────────────────────────

    /// Observe-only cycles; every improvement becomes a proposal file.
    pub async fn analyze(&self, opts: AnalyzeOptions) -> EngineResult<RunSummary> {
        let _lock = LockGuard::acquire(&self.state)?;
        let mut summary = RunSummary::new(RunMode::Analyze);
        let mut progress = progress::reconcile_with_history(&self.state)?;
        let mut catalog = MutationCatalog::load(&self.state, &self.config)?;
        if catalog.enabled_personas().is_empty() {
            return Err(EngineError::NoMutations);
        }

        let max_cycles = opts.cycles.unwrap_or(self.config.max_cycles_per_run);
        let budget = if opts.all_personas {
            catalog.enabled_personas().len() as u32
        } else {
            max_cycles
        };
        let start_cycle = self.state.last_cycle_number()? + 1;
        let mut rng = StdRng::from_os_rng();

        for index in 0..budget {
            if self.cancel.is_cancelled() {
                break;
            }
            let cycle = start_cycle + u64::from(index);
            scheduler::recompute_weights(&mut catalog, &progress, cycle);
            let persona = if opts.all_personas {
                scheduler::sorted_enabled_personas(&catalog)[index as usize].clone()
            } else {
                scheduler::select_persona(&catalog.enabled_personas(), &mut rng)?.clone()
            };

            let identity = self.identity()?;
            let ctx = self.ctx(&identity, cycle);
            let mut builder = CycleBuilder::new(cycle, &persona.id, &persona.name, None);

            let environment = environment::refresh_if_stale(&self.state, cycle)?;
            let history = self.state.read_history(10)?;
            let advice = self.state.read_advice()?;
            let stimuli = self.drain_stimuli()?;
            let decisions = self.read_decisions()?;

            let started = std::time::Instant::now();
            let record = match run_observe(
                &ctx,
                ObserveInput {
                    persona: &persona,
                    adversarial: None,
                    progress: &progress,
                    environment: &environment,
                    advice: advice.as_ref(),
                    history: &history,
                    stimuli,
                    decisions,
                },
            )
            .await
            {
                Ok(out) => {
                    builder.phase(
                        PhaseKind::Observe,
                        Outcome::Success,
                        started,
                        Some(out.artifact_path.display().to_string()),
                    );
                    let mut written = 0;
                    for candidate in &out.candidates {
                        self.state.create_proposal(&format!(
                            "# {}\n\nCategory: {} | Priority: {:?} | Persona: {}\n\n{}\n\nFiles: {}\n",
                            candidate.title,
                            candidate.category,
                            candidate.priority,
                            persona.id,
                            candidate.description,
                            candidate.files.join(", ")
                        ))?;
                        written += 1;
                    }
                    builder.success(None, None, vec![], format!("{written} proposal(s)"))
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    builder.phase(PhaseKind::Observe, Outcome::Failure, started, None);
                    builder.failure(e.to_string(), vec![])
                }
            };

            self.finish_cycle(&record, &mut progress)?;
            summary.absorb(&record);
        }

        info!(summary = %summary.headline(), "analyze run finished");
        Ok(summary)
    }

    // ── improve ─────────────────────────────────────────────────────────────

    /// Execute existing proposals: skip Observe/Plan, treat the proposal as
    /// the plan, run Execute + Verify.
    pub async fn improve(&self, opts: ImproveOptions) -> EngineResult<RunSummary> {
        let _lock = LockGuard::acquire(&self.state)?;
        let mut summary = RunSummary::new(RunMode::Improve);
        let mut progress = progress::reconcile_with_history(&self.state)?;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let pending = self.state.list_proposals()?;
            let Some(filename) = pick_proposal(&pending, opts.proposal.as_deref())? else {
                if summary.attempted == 0 && opts.proposal.is_some() {
                    return Err(EngineError::config(format!(
                        "proposal {:?} not found",
                        opts.proposal.as_deref().unwrap_or_default()
                    )));
                }
                break;
            };

            let cycle = self.state.last_cycle_number()? + 1;
            let content = self.state.read_proposal(&filename)?;
            let identity = self.identity()?;
            let decisions = self.read_decisions()?;
            let plan = plan_from_proposal(&filename, &content);
            let builder = CycleBuilder::new(cycle, IMPROVE_PERSONA, "Improve", None);

            let mut record = self
                .execute_and_verify(builder, &identity, cycle, &plan, &decisions, None)
                .await?;

            // A proposal that produced no code change is consumed anyway, so
            // design-only advice cannot jam the queue. Failures keep it
            // pending for another attempt.
            match record.outcome {
                Outcome::Success | Outcome::Skipped => {
                    self.state.mark_proposal_done(&filename)?;
                    record.status_line = format!("{} [{}]", record.status_line, filename);
                }
                Outcome::Failure | Outcome::Aborted => {}
            }

            self.finish_cycle(&record, &mut progress)?;
            summary.absorb(&record);

            if !opts.all {
                break;
            }
        }

        info!(summary = %summary.headline(), "improve run finished");
        Ok(summary)
    }

    // ── cautious resume ─────────────────────────────────────────────────────

    /// Resume a cautious run: reload the plan artifact and enter Execute.
    pub async fn resume(&self) -> EngineResult<RunSummary> {
        let _lock = LockGuard::acquire(&self.state)?;
        let Some(token) = self.state.read_cautious_resume()? else {
            return Err(EngineError::NothingToResume);
        };
        info!(cycle = token.cycle_number, "resuming cautious run");

        let mut summary = RunSummary::new(RunMode::Resume);
        let mut progress = progress::reconcile_with_history(&self.state)?;
        let catalog = MutationCatalog::load(&self.state, &self.config)?;
        let plan = load_plan_artifact(std::path::Path::new(&token.plan_artifact_path))?;
        let identity = self.identity()?;
        let decisions = self.read_decisions()?;

        let persona_name = catalog
            .persona(&token.persona_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| token.persona_id.clone());
        let builder = CycleBuilder::new(
            token.cycle_number,
            &token.persona_id,
            &persona_name,
            token.adversarial_id.as_deref(),
        );

        let backlog_target = plan.selected_improvement.clone().map(|id| {
            let items = self.state.load_backlog().unwrap_or_default();
            let (category, title) = items
                .iter()
                .find(|item| item.id == id)
                .map(|item| (item.category.clone(), item.title.clone()))
                .unwrap_or_else(|| ("refactor".to_string(), id.clone()));
            (id, category, title)
        });

        let record = self
            .execute_and_verify(
                builder,
                &identity,
                token.cycle_number,
                &plan,
                &decisions,
                backlog_target,
            )
            .await?;

        self.finish_cycle(&record, &mut progress)?;
        summary.absorb(&record);
        self.state.clear_cautious_resume()?;

        info!(summary = %summary.headline(), "resume finished");
        Ok(summary)
    }

    // ── shared plumbing ─────────────────────────────────────────────────────

    /// Post-cycle bookkeeping: progress, backlog pruning, history. The
    /// history append lands last so a crash in between heals via the
    /// startup reconciliation.
    fn finish_cycle(&self, record: &CycleRecord, progress: &mut ProgressState) -> EngineResult<()> {
        progress::record_cycle(progress, record);
        let mut refreshed = self.state.read_progress()?;
        refreshed.personas = progress.personas.clone();
        refreshed.adversarials = progress.adversarials.clone();
        refreshed.total_cycles = progress.total_cycles;
        refreshed.total_successes = progress.total_successes;
        // Area/convergence tracking is persisted by the scheduler as it
        // happens; carry the freshest copy forward for the next selection.
        progress.area_touch_counts = refreshed.area_touch_counts.clone();
        progress.area_recent_outcomes = refreshed.area_recent_outcomes.clone();
        progress.converged_areas = refreshed.converged_areas.clone();
        refreshed.updated_at = progress.updated_at;
        self.state.write_progress(&refreshed)?;

        let mut items = self.state.load_backlog()?;
        if backlog::prune(&mut items, record.cycle_number) > 0 {
            self.state.save_backlog(&items)?;
        }

        self.state.append_history(record)?;
        info!(cycle = record.cycle_number, status = %record.status_line, "cycle recorded");
        Ok(())
    }

    fn complete_backlog_target(
        &self,
        target: &Option<(String, String, String)>,
        success: bool,
    ) -> EngineResult<()> {
        let Some((id, _, _)) = target else {
            return Ok(());
        };
        let mut items = self.state.load_backlog()?;
        if let Some(item) = items.iter_mut().find(|item| &item.id == id) {
            if item.status == BacklogStatus::InProgress {
                if success {
                    backlog::transition(item, BacklogStatus::Completed)?;
                } else {
                    backlog::fail_attempt(item)?;
                }
            }
            self.state.save_backlog(&items)?;
        }
        Ok(())
    }

    fn fail_backlog_target(&self, target: &Option<(String, String, String)>) -> EngineResult<()> {
        self.complete_backlog_target(target, false)
    }

    /// Read and consume all stimuli, returning their contents.
    fn drain_stimuli(&self) -> EngineResult<Vec<String>> {
        let mut contents = Vec::new();
        for path in self.state.list_stimuli()? {
            contents.push(std::fs::read_to_string(&path)?);
            self.state.consume_stimulus(&path)?;
        }
        Ok(contents)
    }

    /// Read decisions without consuming them (consumption happens at
    /// Execute, the point they constrain).
    fn read_decisions(&self) -> EngineResult<Vec<String>> {
        let mut contents = Vec::new();
        for path in self.state.list_decisions()? {
            contents.push(std::fs::read_to_string(&path)?);
        }
        Ok(contents)
    }

    /// Delete every decision file: strict single-shot semantics.
    fn consume_decisions(&self) -> EngineResult<()> {
        for path in self.state.list_decisions()? {
            self.state.consume_decision(&path)?;
        }
        Ok(())
    }

    /// A decision whose first non-empty line is `stop` ends the run. It is
    /// consumed immediately so it cannot stop the next run too.
    fn consume_stop_decision(&self) -> EngineResult<bool> {
        for path in self.state.list_decisions()? {
            let content = std::fs::read_to_string(&path)?;
            let is_stop = content
                .lines()
                .find(|line| !line.trim().is_empty())
                .is_some_and(|line| line.trim().eq_ignore_ascii_case("stop"));
            if is_stop {
                self.state.consume_decision(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Builds a `CycleRecord` incrementally as phases run.
struct CycleBuilder {
    cycle: u64,
    started_at: DateTime<Utc>,
    persona_id: String,
    persona_name: String,
    adversarial_id: Option<String>,
    phases: Vec<PhaseRecord>,
}

impl CycleBuilder {
    fn new(cycle: u64, persona_id: &str, persona_name: &str, adversarial_id: Option<&str>) -> Self {
        Self {
            cycle,
            started_at: Utc::now(),
            persona_id: persona_id.to_string(),
            persona_name: persona_name.to_string(),
            adversarial_id: adversarial_id.map(str::to_string),
            phases: Vec::new(),
        }
    }

    fn phase(
        &mut self,
        kind: PhaseKind,
        status: Outcome,
        started: std::time::Instant,
        artifact_path: Option<String>,
    ) {
        self.phases.push(PhaseRecord {
            phase: kind,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            artifact_path,
        });
    }

    fn phase_skipped(&mut self, kind: PhaseKind) {
        self.phases.push(PhaseRecord {
            phase: kind,
            status: Outcome::Skipped,
            duration_ms: 0,
            artifact_path: None,
        });
    }

    fn record(
        self,
        outcome: Outcome,
        commit_sha: Option<String>,
        pr_url: Option<String>,
        files_touched: Vec<String>,
        detail: String,
    ) -> CycleRecord {
        let status_line = match outcome {
            Outcome::Success => match (&commit_sha, &pr_url) {
                (_, Some(url)) => format!("{}: success ({url})", self.persona_name),
                (Some(sha), None) => format!("{}: success ({sha})", self.persona_name),
                (None, None) => format!("{}: success ({detail})", self.persona_name),
            },
            Outcome::Failure => format!("{}: failure — {detail}", self.persona_name),
            Outcome::Skipped => format!("{}: skipped — {detail}", self.persona_name),
            Outcome::Aborted => format!("{}: aborted — {detail}", self.persona_name),
        };
        CycleRecord {
            cycle_number: self.cycle,
            started_at: self.started_at,
            ended_at: Utc::now(),
            persona_id: self.persona_id,
            adversarial_id: self.adversarial_id,
            phases: self.phases,
            outcome,
            commit_sha,
            pr_url,
            files_touched,
            status_line,
            failure_reason: (outcome == Outcome::Failure).then_some(detail),
        }
    }

    fn success(
        self,
        commit_sha: Option<String>,
        pr_url: Option<String>,
        files: Vec<String>,
        detail: String,
    ) -> CycleRecord {
        self.record(Outcome::Success, commit_sha, pr_url, files, detail)
    }

    fn failure(self, reason: String, files: Vec<String>) -> CycleRecord {
        self.record(Outcome::Failure, None, None, files, reason)
    }

    fn skipped(self, reason: String) -> CycleRecord {
        self.record(Outcome::Skipped, None, None, vec![], reason)
    }
}

/// Resolve which pending proposal to run: explicit name (or unique prefix),
/// else the oldest by filename ordinal.
fn pick_proposal(pending: &[String], requested: Option<&str>) -> EngineResult<Option<String>> {
    match requested {
        None => Ok(pending.first().cloned()),
        Some(wanted) => {
            let matches: Vec<&String> = pending
                .iter()
                .filter(|name| name.as_str() == wanted || name.starts_with(wanted))
                .collect();
            match matches.as_slice() {
                [] => Ok(None),
                [only] => Ok(Some((*only).clone())),
                many => Err(EngineError::config(format!(
                    "proposal {wanted:?} is ambiguous ({} matches)",
                    many.len()
                ))),
            }
        }
    }
}

/// Wrap a free-form proposal document as an execution plan.
fn plan_from_proposal(filename: &str, content: &str) -> PlanEnvelope {
    let title = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .unwrap_or_else(|| filename.to_string());
    PlanEnvelope {
        selected_improvement: None,
        steps: vec![content.to_string()],
        files_to_read: Vec::new(),
        files_to_modify: Vec::new(),
        files_to_create: Vec::new(),
        expected_outcome: title.clone(),
        risk_level: Default::default(),
        commit_message: title,
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
