//! The loop runner: iteration state machine driving a single PRD to
//! completion.
//!
//! Each iteration is a fresh agent invocation with no in-process memory;
//! continuity lives in the PRD, the progress log, and the git branch. The
//! runner owns the PTY master, the RPC server, and the registry row; PRD
//! writes never happen anywhere else.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ralph_adapters::{
    AgentBackend, IterationEnd, IterationHandle, Outcome, PtySession, SpawnConfig,
    COMPLETION_PROMISE,
};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::error::{RalphError, RalphResult};
use crate::git::Git;
use crate::interactive::InteractiveController;
use crate::paths::RalphPaths;
use crate::prd::PrdDoc;
use crate::progress::{ProgressLog, DEFAULT_ROTATION_THRESHOLD};
use crate::prompt::{build_iteration_prompt, resolve_template};
use crate::registry::{SessionRecord, SessionRegistry, SessionStatus};
use crate::rpc::RpcServer;
use crate::state::{Controls, SharedState, StatePatch, MAX_OUTPUT_BUFFER};

/// Default iteration budget.
pub const DEFAULT_ITERATIONS: u32 = 10;

/// Pause between iterations so very fast failures don't spin.
const DEFAULT_PACING: Duration = Duration::from_secs(2);

/// Grace period between SIGTERM and SIGKILL on stop.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How a loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Completed,
    Stopped,
    Checkpointed { reason: String },
    Failed { reason: String },
}

impl TerminationReason {
    pub fn status(&self) -> SessionStatus {
        match self {
            TerminationReason::Completed => SessionStatus::Completed,
            TerminationReason::Stopped => SessionStatus::Stopped,
            TerminationReason::Checkpointed { .. } => SessionStatus::Checkpointed,
            TerminationReason::Failed { .. } => SessionStatus::Failed,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            TerminationReason::Completed => "",
            TerminationReason::Stopped => "user",
            TerminationReason::Checkpointed { reason } => reason,
            TerminationReason::Failed { reason } => reason,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::Completed | TerminationReason::Checkpointed { .. } => 0,
            TerminationReason::Stopped | TerminationReason::Failed { .. } => 1,
        }
    }

    /// One-line summary printed by `run` on exit.
    pub fn summary(&self, task_name: &str) -> String {
        match self {
            TerminationReason::Completed => format!("Loop '{task_name}' completed: all stories pass"),
            TerminationReason::Stopped => format!("Loop '{task_name}' stopped by request"),
            TerminationReason::Checkpointed { reason } => {
                format!("Loop '{task_name}' checkpointed ({reason})")
            }
            TerminationReason::Failed { reason } => format!("Loop '{task_name}' failed ({reason})"),
        }
    }
}

/// Everything a loop needs, resolved by the CLI before start.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub task_dir: PathBuf,
    pub max_iterations: u32,
    pub model: Option<String>,
    pub yolo: bool,
    pub prompt_file: Option<PathBuf>,
    /// Replace a stale running registry row without complaint.
    pub force: bool,
    pub completion_promise: String,
    pub rotation_threshold: usize,
    pub output_cap: usize,
    pub pacing: Duration,
    pub stop_grace: Duration,
    pub paths: RalphPaths,
}

impl LoopConfig {
    pub fn new(task_dir: PathBuf, paths: RalphPaths) -> Self {
        Self {
            task_dir,
            max_iterations: DEFAULT_ITERATIONS,
            model: None,
            yolo: false,
            prompt_file: None,
            force: false,
            completion_promise: COMPLETION_PROMISE.to_string(),
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
            output_cap: MAX_OUTPUT_BUFFER,
            pacing: DEFAULT_PACING,
            stop_grace: DEFAULT_STOP_GRACE,
            paths,
        }
    }
}

enum IterationStep {
    /// Agent finished cleanly; transcript for completion inspection.
    Finished { transcript: String },
    Terminal(TerminationReason),
}

/// The per-loop state machine.
pub struct LoopRunner {
    config: LoopConfig,
    task_name: String,
    repo_root: PathBuf,
    doc: PrdDoc,
    progress: ProgressLog,
    registry: SessionRegistry,
    state: Arc<SharedState>,
    controls: Arc<Controls>,
    interactive: Arc<InteractiveController>,
    backends: Vec<Arc<dyn AgentBackend>>,
    template: String,
    resume_from: u32,
    record: SessionRecord,
    last_session_id: Option<String>,
}

impl LoopRunner {
    /// Run a prepared loop to a terminal state. This is the blocking
    /// (foreground) entry; background mode forks a supervisor child that
    /// lands here.
    pub async fn start(
        config: LoopConfig,
        backends: Vec<Arc<dyn AgentBackend>>,
    ) -> RalphResult<TerminationReason> {
        let mut runner = Self::initialize(config, backends)?;
        let rpc = RpcServer::bind(
            &runner.record.socket_path,
            Arc::clone(&runner.state),
            Arc::clone(&runner.controls),
            Arc::clone(&runner.interactive),
        )
        .await?;

        runner.install_signal_handlers();
        runner.upsert_with_retry().await;

        let outcome = runner.run_iterations().await;

        // Terminal transition: state first (so attached clients get the final
        // state_change), then the registry row, then the socket.
        runner.state.update(StatePatch::status(outcome.status().as_str()));
        runner
            .mark_terminal_with_retry(outcome.status(), outcome.reason())
            .await;
        rpc.shutdown().await;

        info!(task = %runner.task_name, status = outcome.status().as_str(), "loop finished");
        Ok(outcome)
    }

    /// Initialization steps 1-6 and 8 (the RPC socket is bound by `start`).
    fn initialize(
        config: LoopConfig,
        backends: Vec<Arc<dyn AgentBackend>>,
    ) -> RalphResult<Self> {
        if backends.is_empty() {
            return Err(RalphError::Config("no agent backend available".into()));
        }

        let task_name = task_name_from_dir(&config.task_dir);
        let prd_path = config.task_dir.join("prd.json");
        let mut doc = PrdDoc::load(&prd_path)?;

        // Resume a checkpointed loop where it left off.
        let resume_from = match doc.checkpoint() {
            Some((last, reason)) => {
                info!(last, %reason, "resuming from checkpoint");
                doc.clear_checkpoint()?;
                last + 1
            }
            None => 1,
        };

        let repo_root = Git::toplevel(&config.task_dir)
            .or_else(|| config.task_dir.parent().and_then(|p| p.parent()).map(PathBuf::from))
            .ok_or_else(|| {
                RalphError::Git("task directory is not inside a git repository".into())
            })?;

        if let Some(branch) = doc.prd.branch_name.clone() {
            Git::new(&repo_root).ensure_branch(&branch)?;
        }

        let progress = ProgressLog::new(&config.task_dir)
            .with_rotation_threshold(config.rotation_threshold);
        progress.init_if_absent(&doc.prd.project, &doc.prd.prd_type)?;

        let template = resolve_template(
            config.prompt_file.as_deref(),
            &std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            &config.paths.default_prompt(),
        )?;

        let registry = SessionRegistry::open(&config.paths.registry_db())?;

        let agent = backends[0].name().to_string();
        let state = Arc::new(SharedState::with_output_cap(
            &task_name,
            &config.task_dir.display().to_string(),
            &agent,
            config.max_iterations,
            config.output_cap,
        ));

        let mut record = SessionRecord::new(
            &task_name,
            &config.task_dir,
            &agent,
            config.max_iterations,
        );
        record.socket_path = config.paths.socket_path(&task_name)?;
        record.last_iteration = resume_from.saturating_sub(1);

        Ok(Self {
            config,
            task_name,
            repo_root,
            doc,
            progress,
            registry,
            state,
            controls: Arc::new(Controls::new()),
            interactive: Arc::new(InteractiveController::new()),
            backends,
            template,
            resume_from,
            record,
            last_session_id: None,
        })
    }

    fn install_signal_handlers(&self) {
        use tokio::signal::unix::{signal, SignalKind};
        for kind in [SignalKind::terminate(), SignalKind::interrupt()] {
            if let Ok(mut stream) = signal(kind) {
                let controls = Arc::clone(&self.controls);
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        info!("signal received, requesting stop");
                        controls.request_stop();
                    }
                });
            }
        }
    }

    /// The iteration loop: steps 1-10 per iteration, bounded by
    /// `maxIterations` inclusive from `resume_from`.
    async fn run_iterations(&mut self) -> TerminationReason {
        // Reconcile before the first spawn: an already-complete PRD exits
        // Completed without running the agent, including when the budget is 0.
        if let Some(done) = self.reconcile_initial() {
            return done;
        }

        let mut iteration = self.resume_from;
        loop {
            if iteration > self.config.max_iterations {
                return TerminationReason::Failed {
                    reason: "max_iterations".into(),
                };
            }

            // Gate checks. Stop wins over checkpoint.
            if self.controls.stop_requested() {
                return TerminationReason::Stopped;
            }
            if self.controls.checkpoint_requested() {
                return self.write_checkpoint(iteration - 1, "user");
            }

            // PRD refresh from disk; the file is authoritative.
            if let Err(e) = self.doc.reload() {
                error!("PRD reload failed: {e}");
                return TerminationReason::Failed {
                    reason: format!("prd_unreadable: {e}"),
                };
            }
            if self.doc.prd.all_complete() {
                return self.complete();
            }

            // Story selection.
            let story = match self.doc.prd.select_next() {
                Some(story) => story.clone(),
                None => {
                    let gates = self.doc.prd.pending_decision_files(&self.config.task_dir);
                    if !gates.is_empty() {
                        let listing: Vec<String> =
                            gates.iter().map(|p| p.display().to_string()).collect();
                        info!(files = ?listing, "awaiting human decision");
                        let _ = self.progress.append(&format!(
                            "\n## Awaiting decision\n{}\n",
                            listing
                                .iter()
                                .map(|f| format!("- {f}"))
                                .collect::<Vec<_>>()
                                .join("\n")
                        ));
                        return self.write_checkpoint(iteration - 1, "awaiting_decision");
                    }
                    return TerminationReason::Failed {
                        reason: "no_eligible_stories".into(),
                    };
                }
            };

            self.state.update(StatePatch {
                iteration: Some(iteration),
                current_story: Some(story.id.clone()),
                ..Default::default()
            });
            info!(
                iteration,
                story = %story.id,
                title = %story.title,
                "iteration starting"
            );

            // Progress-log maintenance before the agent appends more.
            if let Err(e) = self.progress.rotate_if_needed() {
                warn!("progress rotation failed: {e}");
            }

            // Prompt assembly; the injected payload is consumed here.
            let injected = self.controls.take_injected();
            let agents_md = std::fs::read_to_string(self.config.task_dir.join("AGENTS.md")).ok();
            let prompt = build_iteration_prompt(
                &self.template,
                &self.config.task_dir,
                self.doc.path(),
                self.progress.path(),
                injected.as_deref(),
                Some(&story),
                agents_md.as_deref(),
            );

            // Spawn through the fallback list.
            let step = self.run_agent(&prompt).await;
            let transcript = match step {
                IterationStep::Terminal(reason) => return reason,
                IterationStep::Finished { transcript } => transcript,
            };

            // Completion-signal inspection: the promise counts only when the
            // final payload carries no error markers.
            let patterns = self.backends[0].failure_patterns();
            let candidate = transcript.contains(&self.config.completion_promise)
                && !patterns.has_error_markers(&transcript);

            // PRD reconciliation.
            if let Err(e) = self.doc.reload() {
                error!("PRD reload failed after iteration: {e}");
                return TerminationReason::Failed {
                    reason: format!("prd_unreadable: {e}"),
                };
            }
            if self.doc.prd.all_complete() && candidate {
                return self.complete();
            }
            if candidate {
                warn!(
                    iteration,
                    "agent signaled completion but stories remain unfinished"
                );
                let _ = self.progress.append(&format!(
                    "\n- warning: completion signal at iteration {iteration} with {}/{} stories done\n",
                    self.doc.prd.completed_count(),
                    self.doc.prd.user_stories.len()
                ));
            }

            // State advance.
            self.record.last_iteration = iteration;
            self.state.update(StatePatch {
                iteration: Some(iteration),
                ..Default::default()
            });
            self.upsert_with_retry().await;

            // Pacing.
            tokio::time::sleep(self.config.pacing).await;
            iteration += 1;
        }
    }

    fn reconcile_initial(&mut self) -> Option<TerminationReason> {
        if self.doc.prd.all_complete() {
            info!("PRD already complete on load");
            return Some(self.complete());
        }
        None
    }

    /// Walk the fallback list for one iteration.
    async fn run_agent(&mut self, prompt: &str) -> IterationStep {
        let backends = self.backends.clone();
        for (idx, backend) in backends.iter().enumerate() {
            if !backend.is_available() {
                warn!(backend = backend.name(), "backend unavailable, skipping");
                continue;
            }

            self.record.agent = backend.name().to_string();
            self.state.update(StatePatch {
                agent: Some(backend.name().to_string()),
                ..Default::default()
            });

            let mut spawn = SpawnConfig::new(prompt, &self.repo_root);
            spawn.model = self.config.model.clone();
            spawn.yolo = self.config.yolo;
            spawn.completion_promise = self.config.completion_promise.clone();
            spawn.signal_file = self.config.paths.signal_path(&self.task_name).ok();
            if let Some(id) = &self.last_session_id {
                spawn.env.push(("RALPH_SESSION_ID".to_string(), id.clone()));
            }

            let mut handle = match backend.spawn_iteration(spawn).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(backend = backend.name(), "spawn failed: {e}");
                    continue;
                }
            };
            self.record.last_port = handle.server_port;
            self.last_session_id = handle.session_id.clone();
            self.interactive.attach_pty(Some(Arc::clone(&handle.pty)));

            let end = match self.drive_iteration(&mut handle).await {
                Some(end) => end,
                None => {
                    // Stop requested mid-iteration.
                    self.shutdown_child(&handle.pty).await;
                    self.interactive.attach_pty(None);
                    return IterationStep::Terminal(TerminationReason::Stopped);
                }
            };

            // Server backends stay alive after the idle signal; the
            // iteration is over, so bring the child down.
            self.shutdown_child(&handle.pty).await;
            self.interactive.attach_pty(None);

            let outcome = backend.failure_patterns().classify(&end);
            debug!(backend = backend.name(), outcome = outcome.as_str(), "iteration classified");
            match outcome {
                Outcome::Success => {
                    return IterationStep::Finished {
                        transcript: end.transcript,
                    };
                }
                other => {
                    warn!(
                        backend = backend.name(),
                        outcome = other.as_str(),
                        "agent failed, trying next backend"
                    );
                    let _ = self.progress.append(&format!(
                        "- failover: {} reported {} \n",
                        backend.display_name(),
                        other.as_str()
                    ));
                    if idx + 1 == backends.len() {
                        break;
                    }
                }
            }
        }

        IterationStep::Terminal(TerminationReason::Failed {
            reason: "agents_exhausted".into(),
        })
    }

    /// Stream output and wait for the completion signal.
    ///
    /// Returns `None` when stop was requested instead. While the operator is
    /// interactive, a received completion signal is held and the child keeps
    /// running; it is acted on once suppression clears.
    async fn drive_iteration(&mut self, handle: &mut IterationHandle) -> Option<IterationEnd> {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        let mut lines_open = true;
        let mut completion: Option<IterationEnd> = None;

        loop {
            if completion.is_some() && !self.interactive.should_suppress_completion() {
                return completion;
            }

            tokio::select! {
                line = handle.lines.recv(), if lines_open => {
                    match line {
                        Some(line) => self.state.push_output(line),
                        None => lines_open = false,
                    }
                }
                _ = ticker.tick() => {
                    if self.controls.stop_requested() {
                        return None;
                    }
                    if completion.is_none() {
                        match handle.done.try_recv() {
                            Ok(end) => {
                                if self.interactive.should_suppress_completion() {
                                    debug!("completion signal suppressed (interactive)");
                                }
                                completion = Some(end);
                            }
                            Err(TryRecvError::Empty) => {}
                            Err(TryRecvError::Closed) => {
                                completion = Some(IterationEnd {
                                    exit_code: -1,
                                    transcript: String::new(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    /// SIGTERM, grace period, SIGKILL.
    async fn shutdown_child(&self, pty: &Arc<PtySession>) {
        if !pty.is_alive() {
            return;
        }
        let _ = pty.terminate();
        let deadline = tokio::time::Instant::now() + self.config.stop_grace;
        while pty.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if pty.is_alive() {
            warn!("child ignored SIGTERM, sending SIGKILL");
            let _ = pty.kill();
        }
        let pty = Arc::clone(pty);
        let _ = tokio::task::spawn_blocking(move || pty.wait()).await;
    }

    /// Completed transition plus the optional merge-target action.
    fn complete(&mut self) -> TerminationReason {
        if let (Some(branch), Some(target)) = (
            self.doc.prd.branch_name.clone(),
            self.doc.prd.merge_target.clone(),
        ) {
            if self.doc.prd.auto_merge {
                match Git::new(&self.repo_root).merge_into(&branch, &target) {
                    Ok(kind) => {
                        info!(%branch, %target, %kind, "merged on completion");
                        let _ = self.progress.append(&format!(
                            "\n- merged {branch} into {target} ({kind})\n"
                        ));
                    }
                    Err(e) => {
                        warn!("auto-merge failed: {e}");
                        let _ = self
                            .progress
                            .append(&format!("\n- auto-merge into {target} FAILED: {e}\n"));
                    }
                }
            } else {
                let _ = self.progress.append_ready_to_merge(&branch, &target);
            }
        }
        TerminationReason::Completed
    }

    /// Checkpoint semantics: progress-log block plus PRD fields, then exit
    /// cleanly.
    fn write_checkpoint(&mut self, last_iteration: u32, reason: &str) -> TerminationReason {
        let snap = self.state.snapshot();
        let _ = self.progress.append_checkpoint(
            last_iteration,
            self.config.max_iterations,
            self.doc.prd.completed_count(),
            self.doc.prd.user_stories.len(),
            &snap.current_story,
            &snap.agent,
            reason,
        );
        if let Err(e) = self.doc.set_checkpoint(last_iteration, reason) {
            error!("failed to write checkpoint fields: {e}");
        }
        TerminationReason::Checkpointed {
            reason: reason.to_string(),
        }
    }

    /// Registry writes retry with exponential backoff; registry outage never
    /// kills a running agent.
    async fn upsert_with_retry(&mut self) {
        let record = self.record.clone();
        let force = self.config.force;
        retry(|| self.registry.upsert(&record, force)).await;
    }

    async fn mark_terminal_with_retry(&mut self, status: SessionStatus, reason: &str) {
        let reason = if reason.is_empty() { None } else { Some(reason) };
        retry(|| self.registry.mark_terminal(&self.task_name, status, reason)).await;
    }
}

/// Leaf directory name of the task dir.
pub fn task_name_from_dir(task_dir: &std::path::Path) -> String {
    task_dir
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}

/// Up to five attempts with exponential backoff; logs and gives up.
async fn retry<F>(mut op: F)
where
    F: FnMut() -> RalphResult<()>,
{
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=5 {
        match op() {
            Ok(()) => return,
            Err(RalphError::SessionConflict(task, pid)) => {
                error!(%task, pid, "session conflict, not retrying");
                return;
            }
            Err(e) if attempt == 5 => {
                error!("registry operation failed after {attempt} attempts: {e}");
                return;
            }
            Err(e) => {
                warn!(attempt, "registry operation failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
