//! The orchestration decision tree.
//!
//! `Orchestrator::orchestrate` is the single entry point per run: it takes
//! the coordination lock, classifies the project, handles crash recovery,
//! and routes to exactly one outcome. Every exit path, including internal
//! errors, releases the lock and reports a structured result rather than
//! letting an error escape.

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    ConfigResolver, FileConfigResolver, NullFlowHandler, PhaseChangeEvent, PhaseFlowHandler,
    StatusWriter, StoryRequest, WorkflowExecutor,
};
use crate::config::Config;
use crate::detect::{ProjectState, detect_project_state};
use crate::errors::OrchestratorError;
use crate::gate::{GateEvaluator, GateVerdict};
use crate::handoff::{ContextManager, HandoffEndpointTo, PhaseOutput};
use crate::lock::LockManager;
use crate::safety::{
    backup_advice, check_dependencies, check_disk_space, check_uncommitted_work, protected_files,
};
use crate::session::{
    ActionType, FIRST_PHASE, ResumeOption, SessionState, SessionStore, WORKFLOW_PHASES,
};
use crate::surface::{DecisionPoint, SurfaceDecision, should_surface};

/// Resource name for the orchestration coordination lock.
pub const ORCHESTRATION_LOCK: &str = "orchestration";

const REQUIRED_TOOLS: &[&str] = &["git"];
const REQUIRED_DISK_MB: u64 = 100;

/// Objectives offered when an existing project gives no story to run.
pub const OBJECTIVE_OPTIONS: &[&str] = &["feature", "bug", "refactor", "debt"];

/// Inputs for one orchestration run.
#[derive(Debug, Clone, Default)]
pub struct OrchestrationContext {
    pub story: Option<String>,
    pub goal: Option<String>,
    /// Routes from this serialized state instead of detecting one. An
    /// unrecognized value is a fatal error, never a default branch.
    pub state_override: Option<String>,
}

/// The structured outcome every run produces.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub success: bool,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_state: Option<ProjectState>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestrationResult {
    fn routed(action: &str, state: ProjectState, data: Value) -> Self {
        Self {
            success: true,
            action: action.to_string(),
            project_state: Some(state),
            data,
            error: None,
        }
    }

    fn failure(action: &str, data: Value, error: Option<String>) -> Self {
        Self {
            success: false,
            action: action.to_string(),
            project_state: None,
            data,
            error,
        }
    }
}

pub struct Orchestrator {
    config: Config,
    lock: LockManager,
    session: SessionStore,
    gates: GateEvaluator,
    resolver: Box<dyn ConfigResolver>,
    flows: Box<dyn PhaseFlowHandler>,
    executor: Option<Box<dyn WorkflowExecutor>>,
    status_writers: Vec<Box<dyn StatusWriter>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let lock = LockManager::new(config.locks_dir.clone(), config.lock_ttl_secs);
        let session = SessionStore::new(config.session_file.clone(), config.crash_window_minutes);
        let gates = GateEvaluator::new(Some(config.gates_file.clone()));
        let resolver = Box::new(FileConfigResolver::new(config.config_file.clone()));
        Self {
            config,
            lock,
            session,
            gates,
            resolver,
            flows: Box::new(NullFlowHandler),
            executor: None,
            status_writers: Vec::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ConfigResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_flow_handler(mut self, flows: Box<dyn PhaseFlowHandler>) -> Self {
        self.flows = flows;
        self
    }

    pub fn with_executor(mut self, executor: Box<dyn WorkflowExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_status_writer(mut self, writer: Box<dyn StatusWriter>) -> Self {
        self.status_writers.push(writer);
        self
    }

    pub fn gates(&self) -> &GateEvaluator {
        &self.gates
    }

    /// Run the decision tree once. Never panics past this boundary and
    /// never leaves the coordination lock behind.
    pub async fn orchestrate(&mut self, ctx: OrchestrationContext) -> OrchestrationResult {
        // Snapshot before taking the lock: acquisition creates the locks
        // directory under the control dir, and that must not count as the
        // project having been initialized.
        let initialized = self.config.is_initialized();

        match self.lock.acquire_lock(ORCHESTRATION_LOCK) {
            Ok(true) => {}
            Ok(false) => return self.lock_failed_result(),
            Err(err) => {
                return OrchestrationResult::failure("error", Value::Null, Some(err.to_string()));
            }
        }

        let result = self.run_decision_tree(&ctx, initialized).await;
        self.release_lock_logged();

        match result {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "orchestration failed");
                OrchestrationResult::failure("error", Value::Null, Some(err.to_string()))
            }
        }
    }

    async fn run_decision_tree(
        &mut self,
        ctx: &OrchestrationContext,
        initialized: bool,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let stale = self.lock.cleanup_stale_locks();
        if stale > 0 {
            info!(count = stale, "removed stale locks");
        }

        let state = match &ctx.state_override {
            Some(raw) => raw.parse::<ProjectState>()?,
            None => detect_project_state(&self.config.project_dir, self.resolver.as_ref()),
        };
        debug!(state = %state, "project state resolved");

        // The session must be read before any cleanup of derived artifacts:
        // a file the session still references is not debris.
        let session = self.load_session_if_valid();
        self.remove_write_debris();

        let dependencies = check_dependencies(REQUIRED_TOOLS);
        if !dependencies.healthy {
            warn!(missing = ?dependencies.missing, "missing tools; continuing degraded");
        }
        let disk = check_disk_space(&self.config.project_dir, REQUIRED_DISK_MB);
        let mut probes = json!({ "dependencies": dependencies, "disk": disk });

        // Any readable session means interrupted work: surface the resume
        // prompt before routing anywhere else, with crash details attached
        // when the session also looks crashed.
        if let Some(session) = &session {
            let crash = self.session.detect_crash(session, Utc::now());
            if crash.is_crash {
                probes["crash"] = serde_json::to_value(&crash).unwrap_or(Value::Null);
            }
            let mut data = json!({
                "probes": probes,
                "session": {
                    "epic": session.epic.id.clone(),
                    "current_story": session.progress.current_story.clone(),
                    "current_phase": session.workflow.current_phase.clone(),
                },
                "resume_options": self
                    .session
                    .resume_options()
                    .iter()
                    .map(|o| json!({ "option": o.as_str(), "description": o.description() }))
                    .collect::<Vec<_>>(),
            });
            if crash.is_crash {
                data["crash"] = serde_json::to_value(&crash).unwrap_or(Value::Null);
            }
            return Ok(OrchestrationResult::routed("resume_prompt", state, data));
        }

        match state {
            ProjectState::NoConfig => Ok(self.route_no_config(state, initialized, probes)),
            ProjectState::Greenfield => {
                let outcome = self.flows.greenfield(&self.config.project_dir).await?;
                Ok(OrchestrationResult::routed(
                    &outcome.action,
                    state,
                    json!({ "probes": probes, "flow": outcome.data }),
                ))
            }
            ProjectState::ExistingNoDocs => {
                let outcome = self.flows.brownfield(&self.config.project_dir).await?;
                Ok(OrchestrationResult::routed(
                    &outcome.action,
                    state,
                    json!({ "probes": probes, "flow": outcome.data }),
                ))
            }
            ProjectState::ExistingWithDocs => match &ctx.story {
                Some(story) => {
                    self.execute_story(state, story, ctx.goal.as_deref(), &mut probes)
                        .await
                }
                None => Ok(OrchestrationResult::routed(
                    "ask_objective",
                    state,
                    json!({ "probes": probes, "options": OBJECTIVE_OPTIONS }),
                )),
            },
        }
    }

    /// NO_CONFIG is a one-way door: once the control directory exists the
    /// project has been initialized, and a broken config routes to repair.
    /// Re-offering onboarding here would clobber prior work.
    fn route_no_config(
        &self,
        state: ProjectState,
        initialized: bool,
        probes: Value,
    ) -> OrchestrationResult {
        if initialized {
            OrchestrationResult::routed(
                "config_repair",
                state,
                json!({
                    "probes": probes,
                    "veto_condition": "already_initialized",
                    "next_step": "repair_config",
                }),
            )
        } else {
            OrchestrationResult::routed(
                "onboarding",
                state,
                json!({ "probes": probes, "next_step": "run_init" }),
            )
        }
    }

    fn load_session_if_valid(&self) -> Option<SessionState> {
        if !self.session.exists() {
            return None;
        }
        match self.session.load() {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(error = %err, "session unreadable; treating as absent");
                None
            }
        }
    }

    /// Leftover temp files from interrupted atomic writes under the control
    /// directory. Runs strictly after the session load.
    fn remove_write_debris(&self) {
        for dir in [
            &self.config.control_dir,
            &self.config.workflow_state_dir,
            &self.config.handoffs_dir,
            &self.config.confidence_dir,
        ] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    async fn execute_story(
        &mut self,
        state: ProjectState,
        story: &str,
        goal: Option<&str>,
        probes: &mut Value,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let executor = self.executor.as_ref().ok_or_else(|| {
            OrchestratorError::Other(anyhow!(
                "No workflow executor is configured; cannot execute story '{story}'"
            ))
        })?;

        self.config
            .ensure_directories()
            .map_err(OrchestratorError::Other)?;

        // An existing session surfaced the resume prompt upstream, so this
        // run always starts a fresh record.
        let mut session_state = SessionState::new("epic-1", "Ad-hoc story execution", 1);
        let phase = session_state.workflow.current_phase.clone();
        let workflow_id = format!("wf-{}", Uuid::new_v4());

        session_state.record_phase_change(&phase, Some(story), None);
        self.session.save(&mut session_state)?;
        self.notify_phase_change(&PhaseChangeEvent {
            workflow_id: workflow_id.clone(),
            phase: phase.clone(),
            story: Some(story.to_string()),
            agent: None,
            timestamp: Utc::now(),
        });

        let request = StoryRequest {
            workflow_id: workflow_id.clone(),
            story: story.to_string(),
            phase: phase.clone(),
            goal: goal.map(str::to_string),
            project_dir: self.config.project_dir.clone(),
        };
        let outcome = executor.execute_story(request).await.map_err(|err| {
            OrchestratorError::ExecutorFailed {
                phase: phase.clone(),
                message: err.to_string(),
            }
        })?;

        // The executor ran arbitrarily long; prove we still coordinate
        // before touching shared state again.
        if !self.lock.is_lock_owner(ORCHESTRATION_LOCK) {
            warn!(resource = ORCHESTRATION_LOCK, "lock ownership lost; aborting");
            // No session write here: without the lock this process has no
            // business touching shared state.
            return Ok(OrchestrationResult::failure(
                "abort",
                json!({ "reason": "lock_lost", "verified": false }),
                Some(
                    OrchestratorError::LockOwnershipLost {
                        resource: ORCHESTRATION_LOCK.to_string(),
                        operation: "story_execution".to_string(),
                    }
                    .to_string(),
                ),
            ));
        }

        session_state.workflow.phase_results.insert(
            phase.clone(),
            serde_yaml::Value::Bool(outcome.success),
        );
        if outcome.success {
            session_state.record_action(ActionType::StoryCompleted, Some(story), Some(&phase));
        } else {
            session_state.record_action(ActionType::ErrorOccurred, Some(story), Some(&phase));
        }
        self.session.save(&mut session_state)?;

        let uncommitted = check_uncommitted_work(&self.config.project_dir);
        probes["uncommitted"] = serde_json::to_value(&uncommitted).unwrap_or(Value::Null);

        let mut data = json!({
            "probes": probes.clone(),
            "workflow_id": workflow_id,
            "story": story,
            "phase": phase,
            "executor_success": outcome.success,
        });

        let decisions = evaluate_decision_points(&outcome.result);
        if !decisions.is_empty() {
            let blocking = decisions
                .iter()
                .any(|d| d.decision.should_surface && d.decision.can_bypass == Some(false));
            data["decisions"] = serde_json::to_value(&decisions).unwrap_or(Value::Null);
            if blocking {
                // A non-bypassable decision stops the run before any gate or
                // handoff; the phase result stays recorded for the resume.
                data["halted"] = Value::Bool(true);
                return Ok(OrchestrationResult::routed("decision_required", state, data));
            }
        }

        if let Some(next_phase) = &outcome.next_phase {
            let from_idx = phase_index(&phase);
            let to_idx = phase_index(next_phase);
            let gate = self.gates.evaluate(from_idx, to_idx, &outcome.result);
            let blocked = gate.verdict == GateVerdict::Blocked;
            data["gate"] = serde_json::to_value(gate).unwrap_or(Value::Null);

            if blocked {
                data["halted"] = Value::Bool(true);
            } else {
                let mut manager = ContextManager::new(
                    &workflow_id,
                    self.config.workflow_state_dir.clone(),
                    self.config.handoffs_dir.clone(),
                    self.config.confidence_dir.clone(),
                    self.config.confidence_threshold,
                );
                manager.initialize().map_err(OrchestratorError::Other)?;
                let handoff = manager
                    .save_phase_output(PhaseOutput {
                        phase: from_idx,
                        agent: outcome.agent.clone().unwrap_or_else(|| "executor".to_string()),
                        action: Some("story_executed".to_string()),
                        task: Some(story.to_string()),
                        success: outcome.success,
                        result: outcome.result.clone(),
                        handoff_to: Some(HandoffEndpointTo {
                            phase: to_idx,
                            agent: outcome
                                .next_agent
                                .clone()
                                .unwrap_or_else(|| "executor".to_string()),
                        }),
                    })
                    .map_err(OrchestratorError::Other)?;
                data["handoff"] = serde_json::to_value(&handoff).unwrap_or(Value::Null);
                data["confidence"] =
                    serde_json::to_value(manager.delivery_confidence()).unwrap_or(Value::Null);
            }
        }

        Ok(OrchestrationResult {
            success: outcome.success,
            action: "story_executed".to_string(),
            project_state: Some(state),
            data,
            error: None,
        })
    }

    /// Apply one of the four resume outcomes to the recorded session.
    pub fn handle_resume(&mut self, choice: ResumeOption) -> OrchestrationResult {
        match self.lock.acquire_lock(ORCHESTRATION_LOCK) {
            Ok(true) => {}
            Ok(false) => return self.lock_failed_result(),
            Err(err) => {
                return OrchestrationResult::failure("error", Value::Null, Some(err.to_string()));
            }
        }
        let result = self.resume_inner(choice);
        self.release_lock_logged();
        result
    }

    fn lock_failed_result(&self) -> OrchestrationResult {
        let holder_pid = self
            .lock
            .holder(ORCHESTRATION_LOCK)
            .map(|info| info.pid);
        OrchestrationResult::failure(
            "lock_failed",
            json!({ "resource": ORCHESTRATION_LOCK, "holder_pid": holder_pid }),
            Some("Another orchestration run holds the lock".to_string()),
        )
    }

    fn resume_inner(&mut self, choice: ResumeOption) -> OrchestrationResult {
        let session = match self.session.load() {
            Ok(session) => session,
            Err(err) => {
                return OrchestrationResult::failure("error", Value::Null, Some(err.to_string()));
            }
        };

        match choice {
            ResumeOption::Continue => {
                let mut state = session;
                let story = state.progress.current_story.clone();
                let phase = state.workflow.current_phase.clone();
                state.record_action(ActionType::Go, story.as_deref(), Some(&phase));
                if let Err(err) = self.session.save(&mut state) {
                    return OrchestrationResult::failure("error", Value::Null, Some(err.to_string()));
                }
                OrchestrationResult {
                    success: true,
                    action: "resume_continue".to_string(),
                    project_state: None,
                    data: json!({
                        "phase": state.workflow.current_phase,
                        "story": state.progress.current_story,
                    }),
                    error: None,
                }
            }
            ResumeOption::Review => OrchestrationResult {
                success: true,
                action: "resume_review".to_string(),
                project_state: None,
                data: json!({
                    "epic": session.epic,
                    "progress": session.progress,
                    "workflow": {
                        "current_phase": session.workflow.current_phase,
                        "attempt_count": session.workflow.attempt_count,
                        "started_at": session.workflow.started_at,
                    },
                    "resume_instructions": session.resume_instructions,
                }),
                error: None,
            },
            ResumeOption::Restart => self.resume_restart(session),
            ResumeOption::Discard => match self.session.discard() {
                Ok(removed) => OrchestrationResult {
                    success: true,
                    action: "discard".to_string(),
                    project_state: None,
                    data: json!({ "removed": removed }),
                    error: None,
                },
                Err(err) => {
                    OrchestrationResult::failure("error", Value::Null, Some(err.to_string()))
                }
            },
        }
    }

    /// Restart re-runs the current story from the first phase, which throws
    /// away in-progress work. Uncommitted changes veto it outright; the
    /// session stays exactly as it was.
    fn resume_restart(&mut self, mut session: SessionState) -> OrchestrationResult {
        let uncommitted = check_uncommitted_work(&self.config.project_dir);
        if uncommitted.has_changes {
            let advice = backup_advice("force-restart", &uncommitted);
            let protected = protected_files(
                &serde_json::to_value(&session.context_snapshot).unwrap_or(Value::Null),
                &serde_json::to_value(&session.workflow.phase_results).unwrap_or(Value::Null),
            );
            return OrchestrationResult::failure(
                "restart_vetoed",
                json!({
                    "reason": "Restart would discard uncommitted work",
                    "veto_condition": "uncommitted_changes",
                    "files_affected": uncommitted.files,
                    "file_count": uncommitted.count,
                    "protected_files": protected,
                    "suggestion": "Commit or stash your changes, then restart",
                    "backup": advice,
                }),
                None,
            );
        }

        session.restart_current_story();
        if let Err(err) = self.session.save(&mut session) {
            return OrchestrationResult::failure("error", Value::Null, Some(err.to_string()));
        }
        OrchestrationResult {
            success: true,
            action: "restart".to_string(),
            project_state: None,
            data: json!({
                "phase": FIRST_PHASE,
                "story": session.progress.current_story,
            }),
            error: None,
        }
    }

    fn notify_phase_change(&self, event: &PhaseChangeEvent) {
        for writer in &self.status_writers {
            if let Err(err) = writer.record_phase_change(event) {
                warn!(writer = writer.name(), error = %err, "status writer failed");
            }
        }
    }

    fn release_lock_logged(&self) {
        match self.lock.release_lock(ORCHESTRATION_LOCK) {
            Ok(true) => debug!("orchestration lock released"),
            Ok(false) => debug!("orchestration lock already gone"),
            Err(err) => warn!(error = %err, "failed to release orchestration lock"),
        }
    }
}

#[derive(Debug, Serialize)]
struct EvaluatedDecision {
    id: String,
    question: String,
    #[serde(flatten)]
    decision: SurfaceDecision,
}

/// Evaluate any `decision_points` a phase result carries. Malformed entries
/// are skipped rather than failing the run.
fn evaluate_decision_points(result: &Value) -> Vec<EvaluatedDecision> {
    let Some(points) = result.get("decision_points").and_then(Value::as_array) else {
        return Vec::new();
    };
    points
        .iter()
        .filter_map(|raw| serde_json::from_value::<DecisionPoint>(raw.clone()).ok())
        .map(|point| {
            let decision = should_surface(&point);
            EvaluatedDecision {
                id: point.id,
                question: point.question,
                decision,
            }
        })
        .collect()
}

/// 1-based position of a phase in the workflow ordering; unknown names map
/// to 0 so the gate key still forms.
fn phase_index(phase: &str) -> u32 {
    WORKFLOW_PHASES
        .iter()
        .position(|p| *p == phase)
        .map(|i| i as u32 + 1)
        .unwrap_or(0)
}
