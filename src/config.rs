use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Runtime configuration for Bosun.
///
/// This struct bridges the project layout with the runtime needs of the
/// orchestrator: it derives every control-directory path from the project
/// root and resolves the environment-tunable knobs once, up front.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub control_dir: PathBuf,
    pub config_file: PathBuf,
    pub gates_file: PathBuf,
    pub session_file: PathBuf,
    pub locks_dir: PathBuf,
    pub workflow_state_dir: PathBuf,
    pub handoffs_dir: PathBuf,
    pub confidence_dir: PathBuf,
    pub verbose: bool,
    /// Delivery-confidence gate threshold, in [0, 100].
    pub confidence_threshold: f64,
    /// Minutes of silence after which an in-flight session counts as crashed.
    pub crash_window_minutes: i64,
    /// Age in seconds after which an orchestration lock is considered stale.
    pub lock_ttl_secs: i64,
}

pub const CONTROL_DIR_NAME: &str = ".bosun";
pub const SESSION_FILE_NAME: &str = "session-state.yaml";

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 70.0;
const DEFAULT_CRASH_WINDOW_MINUTES: i64 = 30;
const DEFAULT_LOCK_TTL_SECS: i64 = 3600;

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let control_dir = project_dir.join(CONTROL_DIR_NAME);
        let config_file = control_dir.join("config.yaml");
        let gates_file = control_dir.join("gates.yaml");
        let session_file = control_dir.join(SESSION_FILE_NAME);
        let locks_dir = control_dir.join("locks");
        let workflow_state_dir = control_dir.join("workflow-state");
        let handoffs_dir = workflow_state_dir.join("handoffs");
        let confidence_dir = workflow_state_dir.join("confidence");

        let confidence_threshold = env_parse("BOSUN_CONFIDENCE_THRESHOLD")
            .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD)
            .clamp(0.0, 100.0);
        let crash_window_minutes =
            env_parse("BOSUN_CRASH_WINDOW_MINUTES").unwrap_or(DEFAULT_CRASH_WINDOW_MINUTES);
        let lock_ttl_secs = env_parse("BOSUN_LOCK_TTL_SECS").unwrap_or(DEFAULT_LOCK_TTL_SECS);

        Ok(Self {
            project_dir,
            control_dir,
            config_file,
            gates_file,
            session_file,
            locks_dir,
            workflow_state_dir,
            handoffs_dir,
            confidence_dir,
            verbose,
            confidence_threshold,
            crash_window_minutes,
            lock_ttl_secs,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.locks_dir).context("Failed to create locks directory")?;
        std::fs::create_dir_all(&self.handoffs_dir)
            .context("Failed to create handoffs directory")?;
        std::fs::create_dir_all(&self.confidence_dir)
            .context("Failed to create confidence directory")?;
        Ok(())
    }

    /// The control directory existing is the one-way-door marker: once a
    /// project has been initialized, broken config routes to repair, never
    /// back to onboarding.
    pub fn is_initialized(&self) -> bool {
        self.control_dir.exists()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Resolve the project configuration document at `config_file`.
///
/// Returns the parsed YAML mapping. An unreadable, unparsable, or empty
/// document is an error; callers treat it as the NO_CONFIG condition.
pub fn resolve_project_config(config_file: &Path) -> Result<serde_yaml::Mapping> {
    let raw = std::fs::read_to_string(config_file)
        .with_context(|| format!("Failed to read config at {}", config_file.display()))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&raw).context("Config file is not valid YAML")?;
    match doc {
        serde_yaml::Value::Mapping(map) if !map.is_empty() => Ok(map),
        _ => anyhow::bail!("Config file at {} is empty", config_file.display()),
    }
}
