//! Session-state persistence.
//!
//! One YAML record per project at `<control>/session-state.yaml`, written
//! atomically (temp + rename) so readers never observe a torn file. Schema
//! validation is a pure structural check that produces a report; it never
//! panics and never throws, because a corrupt session must degrade to
//! "no session" rather than wedge the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

use crate::errors::SessionError;

pub const SESSION_SCHEMA_VERSION: &str = "1.2";

/// Workflow phases in execution order.
pub const WORKFLOW_PHASES: &[&str] = &[
    "validation",
    "development",
    "self_healing",
    "quality_gate",
    "push",
    "checkpoint",
];

pub const FIRST_PHASE: &str = "validation";

/// Vocabulary of recorded session actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Go,
    Pause,
    Review,
    Abort,
    PhaseChange,
    EpicStarted,
    StoryStarted,
    StoryCompleted,
    CheckpointReached,
    ErrorOccurred,
}

const ACTION_TYPES: &[&str] = &[
    "GO",
    "PAUSE",
    "REVIEW",
    "ABORT",
    "PHASE_CHANGE",
    "EPIC_STARTED",
    "STORY_STARTED",
    "STORY_COMPLETED",
    "CHECKPOINT_REACHED",
    "ERROR_OCCURRED",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub total_stories: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub current_story: Option<String>,
    #[serde(default)]
    pub stories_done: Vec<String>,
    #[serde(default)]
    pub stories_pending: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub current_phase: String,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub phase_results: BTreeMap<String, serde_yaml::Value>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub last_executor: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    pub epic: Epic,
    #[serde(default)]
    pub progress: Progress,
    pub workflow: Workflow,
    #[serde(default)]
    pub last_action: Option<LastAction>,
    #[serde(default)]
    pub context_snapshot: ContextSnapshot,
    #[serde(default)]
    pub resume_instructions: Option<String>,
    /// Ephemeral per-session flags (e.g. `educational_mode`). These live in
    /// the session record only and never migrate to permanent config.
    #[serde(default)]
    pub overrides: BTreeMap<String, serde_yaml::Value>,
}

/// The YAML document wraps the record under a single `session_state` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_state: SessionState,
}

impl SessionState {
    pub fn new(epic_id: &str, epic_title: &str, total_stories: u32) -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_SCHEMA_VERSION.to_string(),
            last_updated: now,
            epic: Epic {
                id: epic_id.to_string(),
                title: epic_title.to_string(),
                total_stories,
            },
            progress: Progress::default(),
            workflow: Workflow {
                current_phase: FIRST_PHASE.to_string(),
                attempt_count: 0,
                phase_results: BTreeMap::new(),
                started_at: now,
            },
            last_action: Some(LastAction {
                action_type: ActionType::EpicStarted,
                timestamp: now,
                story: None,
                phase: None,
            }),
            context_snapshot: ContextSnapshot::default(),
            resume_instructions: None,
            overrides: BTreeMap::new(),
        }
    }

    pub fn record_action(&mut self, action_type: ActionType, story: Option<&str>, phase: Option<&str>) {
        self.last_action = Some(LastAction {
            action_type,
            timestamp: Utc::now(),
            story: story.map(str::to_string),
            phase: phase.map(str::to_string),
        });
    }

    pub fn record_phase_change(&mut self, phase: &str, story: Option<&str>, agent: Option<&str>) {
        if self.workflow.current_phase == phase {
            self.workflow.attempt_count += 1;
        } else {
            self.workflow.current_phase = phase.to_string();
            self.workflow.attempt_count = 0;
        }
        if let Some(story) = story {
            self.progress.current_story = Some(story.to_string());
        }
        if let Some(agent) = agent {
            self.context_snapshot.last_executor = Some(agent.to_string());
        }
        self.record_action(ActionType::PhaseChange, story, Some(phase));
    }

    /// Reset the workflow to the first phase for the current story. Progress
    /// and snapshot survive; phase results do not.
    pub fn restart_current_story(&mut self) {
        self.workflow.current_phase = FIRST_PHASE.to_string();
        self.workflow.attempt_count = 0;
        self.workflow.phase_results.clear();
        let story = self.progress.current_story.clone();
        self.record_action(ActionType::StoryStarted, story.as_deref(), Some(FIRST_PHASE));
    }

    pub fn session_override(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.overrides.get(key)
    }

    pub fn set_session_override(&mut self, key: &str, value: serde_yaml::Value) {
        self.overrides.insert(key.to_string(), value);
    }
}

/// Result of validating a raw session document.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Structurally validate a parsed session document.
pub fn validate_session_document(doc: &serde_yaml::Value) -> SchemaReport {
    let mut errors = Vec::new();

    let Some(state) = doc.get("session_state") else {
        return SchemaReport {
            valid: false,
            errors: vec!["Missing session_state object".to_string()],
        };
    };

    if state.get("version").and_then(|v| v.as_str()).is_none() {
        errors.push("Missing or invalid version".to_string());
    }

    match state.get("last_updated").and_then(|v| v.as_str()) {
        Some(ts) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
        _ => errors.push("Invalid last_updated timestamp".to_string()),
    }

    match state.get("epic") {
        Some(epic) if epic.is_mapping() => {
            if epic.get("id").and_then(|v| v.as_str()).is_none() {
                errors.push("epic is missing an id".to_string());
            }
        }
        _ => errors.push("Missing or invalid epic section".to_string()),
    }

    if !state.get("progress").map(|p| p.is_mapping()).unwrap_or(false) {
        errors.push("Missing or invalid progress section".to_string());
    }

    match state.get("workflow") {
        Some(wf) if wf.is_mapping() => {
            match wf.get("current_phase").and_then(|v| v.as_str()) {
                Some(phase) if WORKFLOW_PHASES.contains(&phase) => {}
                Some(phase) => errors.push(format!("Invalid workflow current_phase: {phase}")),
                None => errors.push("workflow is missing current_phase".to_string()),
            }
            if let Some(results) = wf.get("phase_results") {
                if !results.is_mapping() {
                    errors.push("workflow phase_results must be a mapping".to_string());
                }
            }
        }
        _ => errors.push("Missing or invalid workflow section".to_string()),
    }

    if let Some(action) = state.get("last_action") {
        match action.get("type").and_then(|v| v.as_str()) {
            Some(t) if ACTION_TYPES.contains(&t) => {}
            Some(t) => errors.push(format!("Invalid last_action type: {t}")),
            None => errors.push("last_action is missing a type".to_string()),
        }
    }

    SchemaReport {
        valid: errors.is_empty(),
        errors,
    }
}

/// Crash-detection verdict for an existing session.
#[derive(Debug, Clone, Serialize)]
pub struct CrashReport {
    pub is_crash: bool,
    pub minutes_since_update: i64,
    pub reason: Option<String>,
}

/// How an interrupted session may be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeOption {
    Continue,
    Review,
    Restart,
    Discard,
}

impl ResumeOption {
    pub const ALL: [ResumeOption; 4] = [
        ResumeOption::Continue,
        ResumeOption::Review,
        ResumeOption::Restart,
        ResumeOption::Discard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeOption::Continue => "continue",
            ResumeOption::Review => "review",
            ResumeOption::Restart => "restart",
            ResumeOption::Discard => "discard",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResumeOption::Continue => "Pick up at the recorded phase",
            ResumeOption::Review => "Show progress before deciding",
            ResumeOption::Restart => "Re-run the current story from the first phase",
            ResumeOption::Discard => "Delete the session and start fresh",
        }
    }
}

impl FromStr for ResumeOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|o| o.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown resume option: {s}"))
    }
}

/// File-backed store for the session record.
pub struct SessionStore {
    path: PathBuf,
    crash_window_minutes: i64,
}

impl SessionStore {
    pub fn new(path: PathBuf, crash_window_minutes: i64) -> Self {
        Self {
            path,
            crash_window_minutes,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load and validate the session record. A structurally invalid document
    /// surfaces as `SchemaInvalid` carrying every validation error; callers
    /// decide whether that means "treat as absent" or "report".
    pub fn load(&self) -> Result<SessionState, SessionError> {
        if !self.path.exists() {
            return Err(SessionError::NotFound {
                path: self.path.clone(),
            });
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| SessionError::ReadFailed {
            path: self.path.clone(),
            source,
        })?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let report = validate_session_document(&doc);
        if !report.valid {
            return Err(SessionError::SchemaInvalid {
                errors: report.errors,
            });
        }
        let document: SessionDocument = serde_yaml::from_value(doc)?;
        Ok(document.session_state)
    }

    /// Persist the record, bumping `last_updated`. Write goes to a sibling
    /// temp file first, then renames over the target.
    pub fn save(&self, state: &mut SessionState) -> Result<(), SessionError> {
        state.last_updated = Utc::now();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SessionError::WriteFailed {
                path: self.path.clone(),
                source,
            })?;
        }
        let document = SessionDocument {
            session_state: state.clone(),
        };
        let yaml = serde_yaml::to_string(&document)?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|source| SessionError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| SessionError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    pub fn discard(&self) -> Result<bool, SessionError> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path).map_err(|source| SessionError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;
        Ok(true)
    }

    /// Decide whether the session looks crashed: silent past the window
    /// while the workflow sits in a non-terminal phase. A session parked at
    /// the terminal phase or deliberately paused or aborted is idle, not
    /// crashed, no matter how old.
    pub fn detect_crash(&self, state: &SessionState, now: DateTime<Utc>) -> CrashReport {
        let minutes = now.signed_duration_since(state.last_updated).num_minutes();
        let terminal = WORKFLOW_PHASES
            .last()
            .is_some_and(|p| *p == state.workflow.current_phase);
        let in_flight = !terminal
            && !matches!(
                state.last_action.as_ref().map(|a| a.action_type),
                Some(ActionType::Pause) | Some(ActionType::Abort) | Some(ActionType::CheckpointReached)
            );
        if in_flight && minutes > self.crash_window_minutes {
            CrashReport {
                is_crash: true,
                minutes_since_update: minutes,
                reason: Some(format!(
                    "No update for {minutes} minutes while phase '{}' was in flight",
                    state.workflow.current_phase
                )),
            }
        } else {
            CrashReport {
                is_crash: false,
                minutes_since_update: minutes,
                reason: None,
            }
        }
    }

    pub fn resume_options(&self) -> Vec<ResumeOption> {
        ResumeOption::ALL.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> SessionStore {
        SessionStore::new(dir.join(".bosun/session-state.yaml"), 30)
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("epic-4", "Delivery hardening", 7);
        state.progress.current_story = Some("story-4-2".to_string());
        store.save(&mut state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.epic.id, "epic-4");
        assert_eq!(loaded.epic.total_stories, 7);
        assert_eq!(loaded.progress.current_story.as_deref(), Some("story-4-2"));
        assert_eq!(loaded.workflow.current_phase, "validation");
    }

    #[test]
    fn save_bumps_last_updated() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("epic-1", "t", 1);
        state.last_updated = Utc::now() - Duration::hours(2);
        store.save(&mut state).unwrap();
        let loaded = store.load().unwrap();
        assert!(Utc::now().signed_duration_since(loaded.last_updated) < Duration::minutes(1));
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(store.load(), Err(SessionError::NotFound { .. })));
    }

    #[test]
    fn load_rejects_document_without_session_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        std::fs::create_dir_all(dir.path().join(".bosun")).unwrap();
        std::fs::write(store.path(), "something_else: true\n").unwrap();
        match store.load() {
            Err(SessionError::SchemaInvalid { errors }) => {
                assert_eq!(errors, vec!["Missing session_state object".to_string()]);
            }
            other => panic!("Expected SchemaInvalid, got {other:?}"),
        }
    }

    #[test]
    fn validation_reports_bad_timestamp_and_bad_phase_together() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            r#"
session_state:
  version: "1.2"
  last_updated: "not-a-timestamp"
  epic: { id: e1, title: t, total_stories: 1 }
  progress: {}
  workflow:
    current_phase: daydreaming
    started_at: "2026-08-30T10:00:00Z"
"#,
        )
        .unwrap();
        let report = validate_session_document(&doc);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e == "Invalid last_updated timestamp"));
        assert!(report
            .errors
            .iter()
            .any(|e| e == "Invalid workflow current_phase: daydreaming"));
    }

    #[test]
    fn validation_rejects_unknown_action_type() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            r#"
session_state:
  version: "1.2"
  last_updated: "2026-08-30T10:00:00Z"
  epic: { id: e1, title: t, total_stories: 1 }
  progress: {}
  workflow:
    current_phase: development
    started_at: "2026-08-30T10:00:00Z"
  last_action:
    type: TELEPORT
    timestamp: "2026-08-30T10:00:00Z"
"#,
        )
        .unwrap();
        let report = validate_session_document(&doc);
        assert!(report.errors.iter().any(|e| e.contains("TELEPORT")));
    }

    #[test]
    fn crash_detected_after_window_while_in_flight() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("e", "t", 1);
        state.record_phase_change("development", Some("story-1"), Some("dev"));
        state.last_updated = Utc::now() - Duration::minutes(45);
        let report = store.detect_crash(&state, Utc::now());
        assert!(report.is_crash);
        assert!(report.minutes_since_update >= 45);
        assert!(report.reason.as_deref().unwrap().contains("development"));
    }

    #[test]
    fn no_crash_within_window() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("e", "t", 1);
        state.last_updated = Utc::now() - Duration::minutes(5);
        assert!(!store.detect_crash(&state, Utc::now()).is_crash);
    }

    #[test]
    fn terminal_checkpoint_phase_never_counts_as_crash() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("e", "t", 1);
        // The phase change into checkpoint is the last recorded action.
        state.record_phase_change("checkpoint", Some("story-1"), None);
        state.last_updated = Utc::now() - Duration::hours(6);
        let report = store.detect_crash(&state, Utc::now());
        assert!(!report.is_crash);
        assert!(report.minutes_since_update >= 360);
    }

    #[test]
    fn paused_session_never_counts_as_crash() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("e", "t", 1);
        state.record_action(ActionType::Pause, None, None);
        state.last_updated = Utc::now() - Duration::hours(6);
        assert!(!store.detect_crash(&state, Utc::now()).is_crash);
    }

    #[test]
    fn phase_change_to_same_phase_bumps_attempt_count() {
        let mut state = SessionState::new("e", "t", 1);
        state.record_phase_change("development", None, None);
        assert_eq!(state.workflow.attempt_count, 0);
        state.record_phase_change("development", None, None);
        assert_eq!(state.workflow.attempt_count, 1);
        state.record_phase_change("quality_gate", None, None);
        assert_eq!(state.workflow.attempt_count, 0);
    }

    #[test]
    fn restart_resets_workflow_but_keeps_progress() {
        let mut state = SessionState::new("e", "t", 3);
        state.progress.stories_done.push("story-1".to_string());
        state.record_phase_change("push", Some("story-2"), None);
        state
            .workflow
            .phase_results
            .insert("development".to_string(), serde_yaml::Value::from(true));

        state.restart_current_story();
        assert_eq!(state.workflow.current_phase, FIRST_PHASE);
        assert!(state.workflow.phase_results.is_empty());
        assert_eq!(state.progress.stories_done, vec!["story-1".to_string()]);
        assert_eq!(state.progress.current_story.as_deref(), Some("story-2"));
    }

    #[test]
    fn overrides_round_trip_but_stay_in_session_record() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("e", "t", 1);
        state.set_session_override("educational_mode", serde_yaml::Value::from(true));
        store.save(&mut state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(
            loaded.session_override("educational_mode"),
            Some(&serde_yaml::Value::from(true))
        );
    }

    #[test]
    fn resume_options_parse_from_strings() {
        for option in ResumeOption::ALL {
            assert_eq!(option.as_str().parse::<ResumeOption>().unwrap(), option);
        }
        assert!("panic".parse::<ResumeOption>().is_err());
    }

    #[test]
    fn discard_removes_the_record() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = SessionState::new("e", "t", 1);
        store.save(&mut state).unwrap();
        assert!(store.exists());
        assert!(store.discard().unwrap());
        assert!(!store.exists());
        assert!(!store.discard().unwrap());
    }
}
