//! Workflow context, phase handoffs, and delivery confidence.
//!
//! One JSON state file per workflow under `<control>/workflow-state/`, plus
//! one handoff artifact per completed phase and a rolling confidence
//! artifact. A phase only ever receives context from phases before it; the
//! handoff package is the complete record of what crossed the boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

pub const HANDOFF_VERSION: &str = "1.0";
pub const WORKFLOW_STATE_VERSION: &str = "1.0";

const CONFIDENCE_FORMULA: &str =
    "0.25*test_coverage + 0.25*ac_completion + 0.20*risk_score_inv + 0.15*debt_score_inv + 0.15*regression_clear";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: u32,
    pub agent: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_phase: Option<u32>,
    #[serde(default)]
    pub phases: BTreeMap<u32, PhaseRecord>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEndpointFrom {
    pub phase: u32,
    pub agent: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEndpointTo {
    pub phase: u32,
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLog {
    pub count: usize,
    pub entries: Vec<Value>,
    #[serde(default)]
    pub source_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffPackage {
    pub version: String,
    pub workflow_id: String,
    pub generated_at: DateTime<Utc>,
    pub from: HandoffEndpointFrom,
    pub to: HandoffEndpointTo,
    #[serde(default)]
    pub context_snapshot: Value,
    pub decision_log: DecisionLog,
    pub evidence_links: Vec<String>,
    pub open_risks: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceComponents {
    pub test_coverage: f64,
    pub ac_completion: f64,
    pub risk_score_inv: f64,
    pub debt_score_inv: f64,
    pub regression_clear: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfidence {
    pub version: String,
    pub score: f64,
    pub threshold: f64,
    pub gate_passed: bool,
    pub formula: String,
    pub components: ConfidenceComponents,
}

/// Output a phase hands to the manager when it finishes.
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub phase: u32,
    pub agent: String,
    pub action: Option<String>,
    pub task: Option<String>,
    pub success: bool,
    pub result: Value,
    pub handoff_to: Option<HandoffEndpointTo>,
}

/// Context handed to a phase: every earlier phase record plus the handoffs
/// generated by those phases.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseContext {
    pub phases: Vec<PhaseRecord>,
    pub handoffs: Vec<HandoffPackage>,
}

pub struct ContextManager {
    workflow_id: String,
    state_dir: PathBuf,
    handoffs_dir: PathBuf,
    confidence_dir: PathBuf,
    confidence_threshold: f64,
    state: WorkflowState,
}

impl ContextManager {
    pub fn new(
        workflow_id: &str,
        state_dir: PathBuf,
        handoffs_dir: PathBuf,
        confidence_dir: PathBuf,
        confidence_threshold: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            state_dir,
            handoffs_dir,
            confidence_dir,
            confidence_threshold,
            state: WorkflowState {
                version: WORKFLOW_STATE_VERSION.to_string(),
                workflow_id: workflow_id.to_string(),
                status: WorkflowStatus::Running,
                created_at: now,
                updated_at: now,
                current_phase: None,
                phases: BTreeMap::new(),
                metadata: Value::Null,
                error: None,
            },
        }
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.workflow_id))
    }

    fn handoff_path(&self, phase: u32) -> PathBuf {
        self.handoffs_dir
            .join(format!("{}-phase-{phase}.handoff.json", self.workflow_id))
    }

    fn confidence_path(&self) -> PathBuf {
        self.confidence_dir
            .join(format!("{}.confidence.json", self.workflow_id))
    }

    /// Create the storage layout and persist the initial state, or reload an
    /// existing state for this workflow id.
    pub fn initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.handoffs_dir)?;
        std::fs::create_dir_all(&self.confidence_dir)?;
        let path = self.state_path();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read workflow state at {}", path.display()))?;
            self.state = serde_json::from_str(&raw).context("Workflow state is not valid JSON")?;
            debug!(workflow_id = %self.workflow_id, "reloaded workflow state");
        } else {
            self.persist_state()?;
            info!(workflow_id = %self.workflow_id, "workflow state initialized");
        }
        Ok(())
    }

    fn persist_state(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        write_json(&self.state_path(), &self.state)
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Record a finished phase. When the output names a handoff target, the
    /// handoff package and a fresh confidence artifact are persisted too.
    pub fn save_phase_output(&mut self, mut output: PhaseOutput) -> Result<Option<HandoffPackage>> {
        let record = PhaseRecord {
            phase: output.phase,
            agent: output.agent.clone(),
            action: output.action.clone(),
            task: output.task.clone(),
            success: output.success,
            completed_at: Utc::now(),
            result: output.result.clone(),
        };
        self.state.current_phase = Some(output.phase);
        self.state.phases.insert(output.phase, record);

        let handoff = if let Some(to) = output.handoff_to.take() {
            let package = self.build_handoff(&output, to);
            write_json(&self.handoff_path(output.phase), &package)?;
            Some(package)
        } else {
            None
        };

        let confidence = self.delivery_confidence();
        write_json(&self.confidence_path(), &confidence)?;
        self.persist_state()?;
        debug!(
            workflow_id = %self.workflow_id,
            phase = output.phase,
            handoff = handoff.is_some(),
            "phase output saved"
        );
        Ok(handoff)
    }

    fn build_handoff(&self, output: &PhaseOutput, to: HandoffEndpointTo) -> HandoffPackage {
        let result = &output.result;

        let entries: Vec<Value> = result
            .get("decisions")
            .or_else(|| result.get("decision_log"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let source_paths: Vec<String> = result
            .get("decision_sources")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let mut evidence_links: Vec<String> = Vec::new();
        let push_link = |link: &str, links: &mut Vec<String>| {
            if !link.is_empty() && !links.iter().any(|l| l == link) {
                links.push(link.to_string());
            }
        };
        if let Some(links) = result.get("evidence_links").and_then(Value::as_array) {
            for link in links.iter().filter_map(Value::as_str) {
                push_link(link, &mut evidence_links);
            }
        }
        if let Some(checks) = result
            .get("validation")
            .and_then(|v| v.get("checks"))
            .and_then(Value::as_array)
        {
            for check in checks {
                for key in ["path", "checklist"] {
                    if let Some(link) = check.get(key).and_then(Value::as_str) {
                        push_link(link, &mut evidence_links);
                    }
                }
            }
        }

        let mut open_risks: Vec<Value> = Vec::new();
        for key in ["open_risks", "risks", "risk_register"] {
            if let Some(risks) = result.get(key).and_then(Value::as_array) {
                open_risks.extend(risks.iter().cloned());
            }
        }

        HandoffPackage {
            version: HANDOFF_VERSION.to_string(),
            workflow_id: self.workflow_id.clone(),
            generated_at: Utc::now(),
            from: HandoffEndpointFrom {
                phase: output.phase,
                agent: output.agent.clone(),
                action: output.action.clone(),
                task: output.task.clone(),
            },
            to,
            context_snapshot: result.get("context_snapshot").cloned().unwrap_or(Value::Null),
            decision_log: DecisionLog {
                count: entries.len(),
                entries,
                source_paths,
            },
            evidence_links,
            open_risks,
        }
    }

    /// Everything phase `n` is allowed to see: records and handoffs from
    /// phases strictly before it.
    pub fn context_for_phase(&self, phase: u32) -> Result<PhaseContext> {
        let phases: Vec<PhaseRecord> = self
            .state
            .phases
            .values()
            .filter(|record| record.phase < phase)
            .cloned()
            .collect();
        let mut handoffs = Vec::new();
        for record in &phases {
            let path = self.handoff_path(record.phase);
            if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                let package: HandoffPackage =
                    serde_json::from_str(&raw).context("Handoff artifact is not valid JSON")?;
                handoffs.push(package);
            }
        }
        Ok(PhaseContext { phases, handoffs })
    }

    /// Compute delivery confidence over everything recorded so far.
    pub fn delivery_confidence(&self) -> DeliveryConfidence {
        let checks = self.all_validation_checks();
        let test_coverage = pass_fraction(&checks, None);
        let regression_clear = {
            let regression: Vec<&Value> = checks
                .iter()
                .filter(|c| c.get("type").and_then(Value::as_str) == Some("regression"))
                .copied()
                .collect();
            if regression.is_empty() {
                test_coverage
            } else {
                pass_fraction(&regression, None)
            }
        };

        let risk_count: usize = self
            .state
            .phases
            .values()
            .map(|record| {
                ["open_risks", "risks", "risk_register"]
                    .iter()
                    .filter_map(|key| record.result.get(key).and_then(Value::as_array))
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum();
        let risk_score_inv = 1.0 - (risk_count as f64 / 10.0).min(1.0);

        let debt_count: u64 = self
            .state
            .phases
            .values()
            .map(|record| {
                let result = &record.result;
                result
                    .get("technical_debt_count")
                    .and_then(Value::as_u64)
                    .unwrap_or_else(|| {
                        ["technical_debt", "todos", "hacks"]
                            .iter()
                            .filter_map(|key| result.get(key).and_then(Value::as_array))
                            .map(|a| a.len() as u64)
                            .sum()
                    })
            })
            .sum();
        let debt_score_inv = 1.0 - (debt_count as f64 / 10.0).min(1.0);

        let ac_completion = self.ac_completion();

        let components = ConfidenceComponents {
            test_coverage,
            ac_completion,
            risk_score_inv,
            debt_score_inv,
            regression_clear,
        };
        let score = 100.0
            * (0.25 * components.test_coverage
                + 0.25 * components.ac_completion
                + 0.20 * components.risk_score_inv
                + 0.15 * components.debt_score_inv
                + 0.15 * components.regression_clear);

        DeliveryConfidence {
            version: HANDOFF_VERSION.to_string(),
            score,
            threshold: self.confidence_threshold,
            gate_passed: score >= self.confidence_threshold,
            formula: CONFIDENCE_FORMULA.to_string(),
            components,
        }
    }

    fn all_validation_checks(&self) -> Vec<&Value> {
        self.state
            .phases
            .values()
            .filter_map(|record| {
                record
                    .result
                    .get("validation")
                    .and_then(|v| v.get("checks"))
                    .and_then(Value::as_array)
            })
            .flatten()
            .collect()
    }

    /// Acceptance-criteria completion, from the most specific evidence
    /// available down to plain phase success rate.
    fn ac_completion(&self) -> f64 {
        for record in self.state.phases.values().rev() {
            let result = &record.result;
            if let (Some(done), Some(total)) = (
                result.get("ac_completed").and_then(Value::as_u64),
                result.get("ac_total").and_then(Value::as_u64),
            ) {
                if total > 0 {
                    return done as f64 / total as f64;
                }
            }
            if let Some(criteria) = result.get("acceptance_criteria").and_then(Value::as_array) {
                if !criteria.is_empty() {
                    let done = criteria
                        .iter()
                        .filter(|c| c.get("done").and_then(Value::as_bool).unwrap_or(false))
                        .count();
                    return done as f64 / criteria.len() as f64;
                }
            }
        }
        let total = self.state.phases.len();
        if total == 0 {
            return 1.0;
        }
        let successful = self.state.phases.values().filter(|r| r.success).count();
        successful as f64 / total as f64
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.state.status = WorkflowStatus::Completed;
        self.state.error = None;
        self.persist_state()
    }

    pub fn mark_failed(&mut self, error: &str, phase: Option<u32>) -> Result<()> {
        self.state.status = WorkflowStatus::Failed;
        self.state.error = Some(error.to_string());
        if let Some(phase) = phase {
            self.state.current_phase = Some(phase);
        }
        self.persist_state()
    }

    /// Wipe recorded phases and start the workflow over. `keep_metadata`
    /// preserves the free-form metadata block across the reset.
    pub fn reset(&mut self, keep_metadata: bool) -> Result<()> {
        let metadata = if keep_metadata {
            self.state.metadata.clone()
        } else {
            Value::Null
        };
        let created_at = self.state.created_at;
        self.state = WorkflowState {
            version: WORKFLOW_STATE_VERSION.to_string(),
            workflow_id: self.workflow_id.clone(),
            status: WorkflowStatus::Running,
            created_at,
            updated_at: Utc::now(),
            current_phase: None,
            phases: BTreeMap::new(),
            metadata,
            error: None,
        };
        self.persist_state()
    }

    pub fn set_metadata(&mut self, metadata: Value) -> Result<()> {
        self.state.metadata = metadata;
        self.persist_state()
    }

    pub fn summary(&self) -> Value {
        json!({
            "workflow_id": self.state.workflow_id,
            "status": self.state.status,
            "current_phase": self.state.current_phase,
            "phases_recorded": self.state.phases.len(),
            "phases_successful": self.state.phases.values().filter(|r| r.success).count(),
            "confidence": self.delivery_confidence().score,
        })
    }

    /// A detached copy of the current state; mutating it does not touch the
    /// manager.
    pub fn export_state(&self) -> WorkflowState {
        self.state.clone()
    }

    pub fn import_state(&mut self, state: WorkflowState) -> Result<()> {
        self.state = state;
        self.state.workflow_id = self.workflow_id.clone();
        self.persist_state()
    }
}

fn pass_fraction(checks: &[&Value], default_if_empty: Option<f64>) -> f64 {
    if checks.is_empty() {
        return default_if_empty.unwrap_or(1.0);
    }
    let passed = checks
        .iter()
        .filter(|c| c.get("passed").and_then(Value::as_bool).unwrap_or(false))
        .count();
    passed as f64 / checks.len() as f64
}

fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
