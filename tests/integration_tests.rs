//! Integration tests for the bosun binary.
//!
//! These drive the CLI end to end against temporary project directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a bosun Command
fn bosun() -> Command {
    cargo_bin_cmd!("bosun")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Project with config and architecture docs: EXISTING_WITH_DOCS.
fn init_documented_project(dir: &TempDir) {
    fs::write(dir.path().join("package.json"), "{}").unwrap();
    fs::create_dir_all(dir.path().join(".bosun")).unwrap();
    fs::write(
        dir.path().join(".bosun/config.yaml"),
        "project:\n  name: demo\n",
    )
    .unwrap();
    fs::create_dir_all(dir.path().join("docs/architecture")).unwrap();
}

/// In-flight session record, freshly updated.
fn write_session(dir: &TempDir) {
    fs::create_dir_all(dir.path().join(".bosun")).unwrap();
    fs::write(
        dir.path().join(".bosun/session-state.yaml"),
        format!(
            r#"
session_state:
  version: "1.2"
  last_updated: "{}"
  epic: {{ id: epic-4, title: Hardening, total_stories: 3 }}
  progress:
    current_story: story-2
    stories_done: [story-1]
    stories_pending: [story-3]
  workflow:
    current_phase: development
    attempt_count: 0
    phase_results: {{}}
    started_at: "2026-08-30T08:00:00Z"
  last_action:
    type: PHASE_CHANGE
    timestamp: "2026-08-30T08:00:00Z"
    story: story-2
    phase: development
"#,
            chrono::Utc::now().to_rfc3339()
        ),
    )
    .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_bosun_help() {
        bosun().arg("--help").assert().success();
    }

    #[test]
    fn test_bosun_version() {
        bosun().arg("--version").assert().success();
    }

    #[test]
    fn test_status_on_empty_directory() {
        let dir = create_temp_project();
        bosun()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("GREENFIELD"));
    }

    #[test]
    fn test_status_on_documented_project() {
        let dir = create_temp_project();
        init_documented_project(&dir);
        bosun()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("EXISTING_WITH_DOCS"));
    }
}

// =============================================================================
// Orchestration routing
// =============================================================================

mod orchestrate {
    use super::*;

    #[test]
    fn test_greenfield_routes_to_surface() {
        let dir = create_temp_project();
        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("greenfield_surface"));
    }

    #[test]
    fn test_documented_project_asks_for_objective() {
        let dir = create_temp_project();
        init_documented_project(&dir);
        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("ask_objective"))
            .stdout(predicate::str::contains("refactor"));
    }

    #[test]
    fn test_onboarding_then_config_repair_is_a_one_way_door() {
        let dir = create_temp_project();
        fs::write(dir.path().join("package.json"), "{}").unwrap();

        // No control dir yet: onboarding.
        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("onboarding"))
            .stdout(predicate::str::contains("run_init"));

        // The control dir now exists but its config is broken: repair,
        // never onboarding again.
        fs::create_dir_all(dir.path().join(".bosun")).unwrap();
        fs::write(dir.path().join(".bosun/config.yaml"), ": broken :::").unwrap();
        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("config_repair"))
            .stdout(predicate::str::contains("already_initialized"))
            .stdout(predicate::str::contains("onboarding").not());
    }

    #[test]
    fn test_unknown_state_override_fails_with_valid_set() {
        let dir = create_temp_project();
        bosun()
            .current_dir(dir.path())
            .args(["orchestrate", "--state", "QUANTUM"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("FATAL: Unknown project state: QUANTUM"))
            .stdout(predicate::str::contains("Valid states:"))
            .stdout(predicate::str::contains("EXISTING_WITH_DOCS"));
    }

    #[test]
    fn test_known_state_override_routes_directly() {
        let dir = create_temp_project();
        bosun()
            .current_dir(dir.path())
            .args(["orchestrate", "--state", "EXISTING_NO_DOCS"])
            .assert()
            .success()
            .stdout(predicate::str::contains("brownfield_welcome"));
    }

    #[test]
    fn test_existing_session_surfaces_resume_prompt() {
        let dir = create_temp_project();
        init_documented_project(&dir);
        write_session(&dir);

        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("resume_prompt"))
            .stdout(predicate::str::contains("story-2"))
            .stdout(predicate::str::contains("restart"))
            .stdout(predicate::str::contains("ask_objective").not());
    }

    #[test]
    fn test_held_lock_fails_the_run() {
        let dir = create_temp_project();
        let locks_dir = dir.path().join(".bosun/locks");
        fs::create_dir_all(&locks_dir).unwrap();
        let lock = serde_json::json!({
            "resource": "orchestration",
            "owner": "6f9b7f64-0000-4000-8000-000000000000",
            "pid": 999999,
            "acquired_at": chrono::Utc::now().to_rfc3339(),
        });
        fs::write(
            locks_dir.join("orchestration.lock"),
            serde_json::to_string(&lock).unwrap(),
        )
        .unwrap();

        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .failure()
            .stdout(predicate::str::contains("lock_failed"));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = create_temp_project();
        let locks_dir = dir.path().join(".bosun/locks");
        fs::create_dir_all(&locks_dir).unwrap();
        let stale = serde_json::json!({
            "resource": "orchestration",
            "owner": "6f9b7f64-0000-4000-8000-000000000000",
            "pid": 999999,
            "acquired_at": (chrono::Utc::now() - chrono::Duration::hours(3)).to_rfc3339(),
        });
        fs::write(
            locks_dir.join("orchestration.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        bosun()
            .current_dir(dir.path())
            .arg("orchestrate")
            .assert()
            .success();
    }
}

// =============================================================================
// Session and locks maintenance
// =============================================================================

mod maintenance {
    use super::*;

    #[test]
    fn test_resume_review_reports_progress() {
        let dir = create_temp_project();
        init_documented_project(&dir);
        write_session(&dir);

        bosun()
            .current_dir(dir.path())
            .args(["resume", "review"])
            .assert()
            .success()
            .stdout(predicate::str::contains("resume_review"))
            .stdout(predicate::str::contains("epic-4"))
            .stdout(predicate::str::contains("development"));
    }

    #[test]
    fn test_resume_rejects_unknown_choice() {
        let dir = create_temp_project();
        bosun()
            .current_dir(dir.path())
            .args(["resume", "teleport"])
            .assert()
            .failure();
    }

    #[test]
    fn test_session_discard() {
        let dir = create_temp_project();
        init_documented_project(&dir);
        write_session(&dir);

        bosun()
            .current_dir(dir.path())
            .args(["session", "discard"])
            .assert()
            .success();
        assert!(!dir.path().join(".bosun/session-state.yaml").exists());
    }

    #[test]
    fn test_locks_cleanup_reports_count() {
        let dir = create_temp_project();
        let locks_dir = dir.path().join(".bosun/locks");
        fs::create_dir_all(&locks_dir).unwrap();
        let stale = serde_json::json!({
            "resource": "orchestration",
            "owner": "6f9b7f64-0000-4000-8000-000000000000",
            "pid": 1,
            "acquired_at": (chrono::Utc::now() - chrono::Duration::hours(3)).to_rfc3339(),
        });
        fs::write(
            locks_dir.join("orchestration.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        bosun()
            .current_dir(dir.path())
            .args(["locks", "cleanup"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 stale lock(s) removed"));
        assert!(!locks_dir.join("orchestration.lock").exists());
    }
}
