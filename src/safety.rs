//! Pre-operation safety checks.
//!
//! All probes here are advisory except lock-ownership verification, which
//! lives in the router. A probe that cannot run reports a warning and lets
//! the operation proceed; blocking work on a broken probe would turn every
//! environment quirk into an outage.

use git2::{Repository, StatusOptions};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::warn;

use crate::config::CONTROL_DIR_NAME;

/// Operations that rewrite or remove work and warrant a backup first.
const DESTRUCTIVE_OPERATIONS: &[&str] = &["delete", "reset", "discard", "force-restart"];

#[derive(Debug, Clone, Serialize)]
pub struct DiskCheck {
    pub safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_mb: Option<u64>,
    pub required_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Verify `required_mb` of free space under `path`. Fail-safe: if the probe
/// itself errors, the check passes with `warning: "check_failed"`.
pub fn check_disk_space(path: &Path, required_mb: u64) -> DiskCheck {
    match fs2::available_space(path) {
        Ok(bytes) => {
            let available_mb = bytes / (1024 * 1024);
            DiskCheck {
                safe: available_mb >= required_mb,
                available_mb: Some(available_mb),
                required_mb,
                warning: None,
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "disk space probe failed");
            DiskCheck {
                safe: true,
                available_mb: None,
                required_mb,
                warning: Some("check_failed".to_string()),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyCheck {
    pub healthy: bool,
    pub missing: Vec<String>,
}

/// Look for each named tool on PATH. Missing tools degrade the run; they
/// never block it.
pub fn check_dependencies(tools: &[&str]) -> DependencyCheck {
    let missing: Vec<String> = tools
        .iter()
        .filter(|tool| !tool_on_path(tool))
        .map(|t| (*t).to_string())
        .collect();
    DependencyCheck {
        healthy: missing.is_empty(),
        missing,
    }
}

fn tool_on_path(tool: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(tool);
        candidate.is_file()
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UncommittedWork {
    pub has_changes: bool,
    pub count: usize,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Uncommitted changes (staged, unstaged, untracked) in the repository at
/// `project_dir`. The control directory is orchestrator machinery, never
/// user work, so its entries are excluded. A directory that is not a git
/// repository reports no changes with a warning rather than an error.
pub fn check_uncommitted_work(project_dir: &Path) -> UncommittedWork {
    let repo = match Repository::open(project_dir) {
        Ok(repo) => repo,
        Err(err) => {
            return UncommittedWork {
                has_changes: false,
                count: 0,
                files: Vec::new(),
                warning: Some(format!("not a git repository: {}", err.message())),
            };
        }
    };

    let mut opts = StatusOptions::new();
    opts.include_untracked(true);
    match repo.statuses(Some(&mut opts)) {
        Ok(statuses) => {
            let control_prefix = format!("{CONTROL_DIR_NAME}/");
            let files: Vec<String> = statuses
                .iter()
                .filter(|entry| !entry.status().is_ignored())
                .filter_map(|entry| entry.path().map(str::to_string))
                .filter(|path| path != CONTROL_DIR_NAME && !path.starts_with(&control_prefix))
                .collect();
            UncommittedWork {
                has_changes: !files.is_empty(),
                count: files.len(),
                files,
                warning: None,
            }
        }
        Err(err) => {
            warn!(error = %err, "status probe failed");
            UncommittedWork {
                has_changes: false,
                count: 0,
                files: Vec::new(),
                warning: Some("check_failed".to_string()),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupSeverity {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupAdvice {
    pub recommend: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<BackupSeverity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Whether `operation` warrants a backup before running. Destructive
/// operations over uncommitted work are the high-severity case.
pub fn backup_advice(operation: &str, uncommitted: &UncommittedWork) -> BackupAdvice {
    if !DESTRUCTIVE_OPERATIONS.contains(&operation) {
        return BackupAdvice {
            recommend: false,
            severity: None,
            reason: None,
        };
    }
    if uncommitted.has_changes {
        BackupAdvice {
            recommend: true,
            severity: Some(BackupSeverity::High),
            reason: Some("uncommitted_changes".to_string()),
        }
    } else {
        BackupAdvice {
            recommend: true,
            severity: Some(BackupSeverity::Medium),
            reason: Some("destructive_operation".to_string()),
        }
    }
}

/// Files an operation must not touch, gathered from the session snapshot
/// and every recorded phase result.
pub fn protected_files(context_snapshot: &Value, phase_results: &Value) -> Vec<String> {
    let mut files = Vec::new();
    let push_unique = |path: &str, files: &mut Vec<String>| {
        if !path.is_empty() && !files.iter().any(|f| f == path) {
            files.push(path.to_string());
        }
    };

    if let Some(modified) = context_snapshot
        .get("files_modified")
        .and_then(Value::as_array)
    {
        for file in modified.iter().filter_map(Value::as_str) {
            push_unique(file, &mut files);
        }
    }

    if let Some(results) = phase_results.as_object() {
        for result in results.values() {
            let Some(implementation) = result.get("implementation") else {
                continue;
            };
            for key in ["files_created", "files_modified"] {
                if let Some(list) = implementation.get(key).and_then(Value::as_array) {
                    for file in list.iter().filter_map(Value::as_str) {
                        push_unique(file, &mut files);
                    }
                }
            }
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        repo
    }

    fn commit_all(dir: &Path, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn disk_check_passes_with_reasonable_requirement() {
        let dir = tempdir().unwrap();
        let check = check_disk_space(dir.path(), 1);
        assert!(check.safe);
        assert!(check.warning.is_none());
        assert!(check.available_mb.is_some());
    }

    #[test]
    fn disk_check_fails_safe_when_probe_errors() {
        let check = check_disk_space(Path::new("/nonexistent/definitely/missing"), 100);
        assert!(check.safe);
        assert_eq!(check.warning.as_deref(), Some("check_failed"));
        assert!(check.available_mb.is_none());
    }

    #[test]
    fn dependency_check_reports_missing_tools() {
        let check = check_dependencies(&["sh", "no-such-tool-xyzzy"]);
        assert!(!check.healthy);
        assert_eq!(check.missing, vec!["no-such-tool-xyzzy".to_string()]);
    }

    #[test]
    fn uncommitted_work_in_non_repo_is_graceful() {
        let dir = tempdir().unwrap();
        let work = check_uncommitted_work(dir.path());
        assert!(!work.has_changes);
        assert_eq!(work.count, 0);
        assert!(work.warning.is_some());
    }

    #[test]
    fn uncommitted_work_lists_dirty_files() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        commit_all(dir.path(), "initial");

        let clean = check_uncommitted_work(dir.path());
        assert!(!clean.has_changes);

        fs::write(dir.path().join("a.txt"), "two").unwrap();
        fs::write(dir.path().join("b.txt"), "new").unwrap();
        let dirty = check_uncommitted_work(dir.path());
        assert!(dirty.has_changes);
        assert_eq!(dirty.count, 2);
        assert!(dirty.files.contains(&"a.txt".to_string()));
        assert!(dirty.files.contains(&"b.txt".to_string()));
    }

    #[test]
    fn uncommitted_work_ignores_the_control_directory() {
        let dir = tempdir().unwrap();
        setup_repo(dir.path());
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        commit_all(dir.path(), "initial");

        // Run artifacts under the control dir must not dirty the tree.
        fs::create_dir_all(dir.path().join(".bosun/locks")).unwrap();
        fs::write(dir.path().join(".bosun/locks/orchestration.lock"), "{}").unwrap();
        fs::write(dir.path().join(".bosun/session-state.yaml"), "x").unwrap();
        let work = check_uncommitted_work(dir.path());
        assert!(!work.has_changes, "control dir leaked into {:?}", work.files);

        fs::write(dir.path().join("b.txt"), "new").unwrap();
        let dirty = check_uncommitted_work(dir.path());
        assert_eq!(dirty.files, vec!["b.txt".to_string()]);
    }

    #[test]
    fn backup_not_recommended_for_safe_operations() {
        let clean = UncommittedWork {
            has_changes: false,
            count: 0,
            files: vec![],
            warning: None,
        };
        let advice = backup_advice("status", &clean);
        assert!(!advice.recommend);
        assert!(advice.severity.is_none());
    }

    #[test]
    fn destructive_operation_severity_tracks_uncommitted_work() {
        let clean = UncommittedWork {
            has_changes: false,
            count: 0,
            files: vec![],
            warning: None,
        };
        let dirty = UncommittedWork {
            has_changes: true,
            count: 1,
            files: vec!["a.txt".to_string()],
            warning: None,
        };

        let medium = backup_advice("reset", &clean);
        assert!(medium.recommend);
        assert_eq!(medium.severity, Some(BackupSeverity::Medium));
        assert_eq!(medium.reason.as_deref(), Some("destructive_operation"));

        let high = backup_advice("discard", &dirty);
        assert_eq!(high.severity, Some(BackupSeverity::High));
        assert_eq!(high.reason.as_deref(), Some("uncommitted_changes"));
    }

    #[test]
    fn protected_files_merge_snapshot_and_phase_results() {
        let snapshot = json!({ "files_modified": ["src/lib.rs", "src/main.rs"] });
        let results = json!({
            "development": {
                "implementation": {
                    "files_created": ["src/new.rs"],
                    "files_modified": ["src/lib.rs"],
                }
            },
            "validation": { "summary": "no implementation key" },
        });
        let files = protected_files(&snapshot, &results);
        assert_eq!(files.len(), 3);
        assert!(files.contains(&"src/new.rs".to_string()));
        // Deduplicated across sources.
        assert_eq!(files.iter().filter(|f| *f == "src/lib.rs").count(), 1);
    }
}
