//! Project-state detection.
//!
//! A pure decision table over filesystem probes plus one config resolution.
//! The detector never mutates anything; routing decisions belong to the
//! orchestrator.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::collaborators::ConfigResolver;
use crate::errors::OrchestratorError;

/// Manifests that mark a directory as an existing codebase.
const PACKAGE_MANIFESTS: &[&str] = &["package.json", "Cargo.toml", "pyproject.toml", "go.mod"];

/// The four orchestration entry states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectState {
    NoConfig,
    Greenfield,
    ExistingNoDocs,
    ExistingWithDocs,
}

impl ProjectState {
    pub const ALL: [ProjectState; 4] = [
        ProjectState::NoConfig,
        ProjectState::Greenfield,
        ProjectState::ExistingNoDocs,
        ProjectState::ExistingWithDocs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectState::NoConfig => "NO_CONFIG",
            ProjectState::Greenfield => "GREENFIELD",
            ProjectState::ExistingNoDocs => "EXISTING_NO_DOCS",
            ProjectState::ExistingWithDocs => "EXISTING_WITH_DOCS",
        }
    }

    pub fn valid_states() -> String {
        Self::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectState {
    type Err = OrchestratorError;

    /// Parsing an unrecognized state is fatal. States travel through
    /// serialized result records, and routing on a value outside the known
    /// set must stop the run rather than fall into a default branch.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownProjectState {
                state: s.to_string(),
                valid: Self::valid_states(),
            })
    }
}

/// Classify the project rooted at `project_dir`.
///
/// Decision order matters: the greenfield probe runs before config
/// resolution so an empty directory is never misread as a broken one.
pub fn detect_project_state(project_dir: &Path, resolver: &dyn ConfigResolver) -> ProjectState {
    if is_greenfield(project_dir) {
        return ProjectState::Greenfield;
    }

    match resolver.resolve() {
        Err(_) => ProjectState::NoConfig,
        Ok(map) if map.is_empty() => ProjectState::NoConfig,
        Ok(_) => {
            if project_dir.join("docs").join("architecture").exists() {
                ProjectState::ExistingWithDocs
            } else {
                ProjectState::ExistingNoDocs
            }
        }
    }
}

fn is_greenfield(project_dir: &Path) -> bool {
    let has_manifest = PACKAGE_MANIFESTS
        .iter()
        .any(|m| project_dir.join(m).exists());
    let has_git = project_dir.join(".git").exists();
    let has_docs = project_dir.join("docs").exists();
    !has_manifest && !has_git && !has_docs
}
