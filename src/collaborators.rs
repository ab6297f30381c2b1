//! Collaborator contracts.
//!
//! The orchestration core decides; collaborators do. Everything with an
//! outer surface (task execution, flow presentation, config backends,
//! status side-channels) sits behind one of these traits so the decision
//! tree stays deterministic and testable without any of them present.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;

/// Resolves the project configuration document.
///
/// Resolution failure (missing, unparsable, empty) is meaningful to the
/// detector, so implementations report it as an `Err` rather than papering
/// over it with defaults.
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self) -> Result<serde_yaml::Mapping>;
}

/// Default resolver: a YAML mapping read from a single file.
pub struct FileConfigResolver {
    path: PathBuf,
}

impl FileConfigResolver {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ConfigResolver for FileConfigResolver {
    fn resolve(&self) -> Result<serde_yaml::Mapping> {
        crate::config::resolve_project_config(&self.path)
    }
}

/// A story-execution request handed to the workflow executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRequest {
    pub workflow_id: String,
    pub story: String,
    pub phase: String,
    pub goal: Option<String>,
    pub project_dir: PathBuf,
}

/// What a phase run produced, as reported by the executor.
///
/// `result` carries the executor's free-form evidence (decisions, validation
/// checks, risks) and is consumed by the gate evaluator and context manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub phase: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub next_phase: Option<String>,
    #[serde(default)]
    pub next_agent: Option<String>,
    #[serde(default)]
    pub result: Value,
}

/// Runs one story phase. The real implementation drives external task
/// agents; tests substitute a scripted one.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute_story(&self, request: StoryRequest) -> Result<ExecutionOutcome>;
}

/// Outcome of delegating to a flow handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

/// Entry flows for projects that are not yet mid-workflow.
#[async_trait]
pub trait PhaseFlowHandler: Send + Sync {
    async fn brownfield(&self, project_dir: &std::path::Path) -> Result<FlowOutcome>;
    async fn greenfield(&self, project_dir: &std::path::Path) -> Result<FlowOutcome>;
}

/// Handler used when no flow collaborator is wired in: surfaces the default
/// welcome actions and leaves the rest to the caller.
pub struct NullFlowHandler;

#[async_trait]
impl PhaseFlowHandler for NullFlowHandler {
    async fn brownfield(&self, _project_dir: &std::path::Path) -> Result<FlowOutcome> {
        Ok(FlowOutcome {
            action: "brownfield_welcome".to_string(),
            data: Value::Null,
        })
    }

    async fn greenfield(&self, _project_dir: &std::path::Path) -> Result<FlowOutcome> {
        Ok(FlowOutcome {
            action: "greenfield_surface".to_string(),
            data: Value::Null,
        })
    }
}

/// A phase-transition event pushed to status side-channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChangeEvent {
    pub workflow_id: String,
    pub phase: String,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Side-channel sink for phase-change events. Writer failures are reported
/// to the caller, which logs them; they never abort the phase.
pub trait StatusWriter: Send + Sync {
    fn name(&self) -> &str;
    fn record_phase_change(&self, event: &PhaseChangeEvent) -> Result<()>;
}

/// Discards every event.
pub struct NullStatusWriter;

impl StatusWriter for NullStatusWriter {
    fn name(&self) -> &str {
        "null"
    }

    fn record_phase_change(&self, _event: &PhaseChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// Appends events as JSON lines to a file.
pub struct FileStatusWriter {
    path: PathBuf,
}

impl FileStatusWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StatusWriter for FileStatusWriter {
    fn name(&self) -> &str {
        "file"
    }

    fn record_phase_change(&self, event: &PhaseChangeEvent) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn null_flow_handler_surfaces_default_actions() {
        let handler = NullFlowHandler;
        let dir = tempdir().unwrap();
        let brown = handler.brownfield(dir.path()).await.unwrap();
        assert_eq!(brown.action, "brownfield_welcome");
        let green = handler.greenfield(dir.path()).await.unwrap();
        assert_eq!(green.action, "greenfield_surface");
    }

    #[test]
    fn file_status_writer_appends_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.jsonl");
        let writer = FileStatusWriter::new(path.clone());
        for phase in ["validation", "development"] {
            writer
                .record_phase_change(&PhaseChangeEvent {
                    workflow_id: "wf-1".to_string(),
                    phase: phase.to_string(),
                    story: Some("story-1".to_string()),
                    agent: None,
                    timestamp: Utc::now(),
                })
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: PhaseChangeEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.phase, "validation");
    }

    #[test]
    fn file_config_resolver_errors_on_missing_file() {
        let dir = tempdir().unwrap();
        let resolver = FileConfigResolver::new(dir.path().join("config.yaml"));
        assert!(resolver.resolve().is_err());
    }
}
