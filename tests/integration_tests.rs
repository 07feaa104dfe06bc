//! Integration tests for cadence
//!
//! Library-level scenarios drive real run directories through the tick;
//! CLI tests exercise the binary end to end.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use cadence::campaign::WorkflowFileCampaign;
use cadence::orchestrator::{InitOptions, RunEngine, initialize_run};
use cadence::store::schema::backfill_attempt_id;
use cadence::{StateStore, TickReport};
use cadence_common::{RunContext, RunStatus, Task, TaskKind, TaskStatus, Workflow};

fn cadence() -> Command {
    cargo_bin_cmd!("cadence")
}

/// Create run `r1` under `dir` with `tasks` and an optional TOML config.
fn create_run(dir: &Path, tasks: Vec<Task>, config: Option<&str>) -> RunContext {
    let config_file = config.map(|body| {
        let path = dir.join("cadence.toml");
        fs::write(&path, body).unwrap();
        path
    });
    let options = InitOptions {
        run_id: Some("r1".to_string()),
        config_file,
        ..InitOptions::default()
    };
    let mut campaign = WorkflowFileCampaign::from_workflow(Workflow::new(tasks));
    initialize_run(dir, &mut campaign, &options).unwrap()
}

fn open(ctx: &RunContext) -> RunEngine {
    RunEngine::open(ctx.clone(), Box::new(WorkflowFileCampaign::empty())).unwrap()
}

fn step(ctx: &RunContext) -> TickReport {
    open(ctx).step_run().unwrap()
}

fn task_status(store: &StateStore, task_id: &str) -> TaskStatus {
    store.get_task("r1", task_id).unwrap().status
}

/// Evidence directory of the task's current attempt.
fn attempt_dir(ctx: &RunContext, store: &StateStore, task_id: &str) -> std::path::PathBuf {
    let task = store.get_task("r1", task_id).unwrap();
    let attempt = store
        .get_attempt(task.current_attempt_id.as_deref().unwrap())
        .unwrap();
    ctx.root.join(attempt.relative_path.unwrap())
}

// =============================================================================
// Tick scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[test]
    fn test_empty_run_completes_on_first_tick() {
        let dir = TempDir::new().unwrap();
        let ctx = create_run(dir.path(), vec![], None);

        let report = step(&ctx);
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.dispatched + report.simulated, 0);
    }

    #[test]
    fn test_dependency_chain_without_operators_is_simulated() {
        let dir = TempDir::new().unwrap();
        let ctx = create_run(
            dir.path(),
            vec![
                Task::new("t1", "First"),
                Task::new("t2", "Second").with_dependencies(&["t1"]),
            ],
            None,
        );
        let store = StateStore::open(&ctx.store_path()).unwrap();

        let first = step(&ctx);
        assert_eq!(first.status, RunStatus::Running);
        assert_eq!(first.simulated, 1);
        assert_eq!(task_status(&store, "t1"), TaskStatus::Completed);
        assert_eq!(task_status(&store, "t2"), TaskStatus::Pending);

        let second = step(&ctx);
        assert_eq!(task_status(&store, "t2"), TaskStatus::Completed);
        // All work finished and the campaign has nothing more to plan.
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(step(&ctx).status, RunStatus::Completed);
    }

    #[test]
    fn test_per_operator_limit_counts_active_attempts() {
        let dir = TempDir::new().unwrap();
        let config = "[operators.X]\ntype = \"hpc\"\nmax_concurrent = 2\n";
        let ctx = create_run(
            dir.path(),
            vec![Task::new("busy", "Busy").with_operator_key("X")],
            Some(config),
        );
        let store = StateStore::open(&ctx.store_path()).unwrap();

        let first = step(&ctx);
        assert_eq!(first.dispatched, 1);
        assert_eq!(store.count_active_attempts("r1").unwrap(), 1);

        let more: Vec<Task> = ["t1", "t2", "t3"]
            .iter()
            .map(|id| Task::new(id, id).with_operator_key("X"))
            .collect();
        store.add_workflow("r1", &Workflow::new(more)).unwrap();

        let report = step(&ctx);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.postponed, 2);
        assert_eq!(report.plan.ready, 2);
        assert_eq!(report.status, RunStatus::Running);
        assert_eq!(store.count_active_attempts("r1").unwrap(), 2);
        assert_eq!(task_status(&store, "t1"), TaskStatus::WaitingExternal);
        assert_eq!(task_status(&store, "t2"), TaskStatus::Pending);
    }

    #[test]
    fn test_tolerated_failure_still_completes_run() {
        let dir = TempDir::new().unwrap();
        let ctx = create_run(
            dir.path(),
            vec![
                Task::new("review", "Review")
                    .with_kind(TaskKind::Gate)
                    .with_allow_failure(true),
                Task::new("report", "Report"),
            ],
            None,
        );
        let store = StateStore::open(&ctx.store_path()).unwrap();

        let first = step(&ctx);
        assert_eq!(first.dispatched, 1);
        assert_eq!(task_status(&store, "review"), TaskStatus::WaitingExternal);

        let evidence = attempt_dir(&ctx, &store, "review");
        fs::write(
            evidence.join("status.json"),
            r#"{"status": "FAILED", "reason": "rejected"}"#,
        )
        .unwrap();

        let report = step(&ctx);
        assert_eq!(task_status(&store, "review"), TaskStatus::Failed);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[test]
    fn test_blocking_failure_fails_run_with_reason() {
        let dir = TempDir::new().unwrap();
        let ctx = create_run(
            dir.path(),
            vec![Task::new("review", "Review").with_kind(TaskKind::Gate)],
            None,
        );
        let store = StateStore::open(&ctx.store_path()).unwrap();
        step(&ctx);
        fs::write(
            attempt_dir(&ctx, &store, "review").join("status.json"),
            r#"{"status": "FAILED"}"#,
        )
        .unwrap();

        let report = step(&ctx);
        assert_eq!(report.status, RunStatus::Failed);
        let run = store.get_run("r1").unwrap();
        assert!(run.status_reason.unwrap().contains("review"));
    }

    #[test]
    fn test_moved_workspace_keeps_ticking() {
        let dir = TempDir::new().unwrap();
        let first_home = dir.path().join("ws_old");
        let second_home = dir.path().join("ws_new");
        let third_home = dir.path().join("ws_final");
        fs::create_dir_all(&first_home).unwrap();
        create_run(
            &first_home,
            vec![Task::new("review", "Review").with_kind(TaskKind::Gate)],
            None,
        );

        // Moved before the first dispatch.
        fs::rename(&first_home, &second_home).unwrap();
        let ctx = RunContext::new(&second_home, "r1");
        let report = step(&ctx);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.dispatch_failures, 0);
        let store = StateStore::open(&ctx.store_path()).unwrap();
        assert_eq!(task_status(&store, "review"), TaskStatus::WaitingExternal);
        drop(store);

        // Moved again while the attempt is in flight.
        fs::rename(&second_home, &third_home).unwrap();
        let ctx = RunContext::new(&third_home, "r1");
        let store = StateStore::open(&ctx.store_path()).unwrap();
        let evidence = attempt_dir(&ctx, &store, "review");
        assert!(evidence.starts_with(&third_home));
        fs::write(evidence.join("status.json"), r#"{"status": "COMPLETED"}"#).unwrap();

        let report = step(&ctx);
        assert_eq!(report.poll.transitions, 1);
        assert_eq!(task_status(&store, "review"), TaskStatus::Completed);
        assert_eq!(report.status, RunStatus::Completed);

        let run = open(&ctx).run().unwrap();
        assert_eq!(run.root, ctx.root.display().to_string());
    }

    #[test]
    fn test_retried_task_gets_sequential_attempt_indices() {
        let dir = TempDir::new().unwrap();
        let ctx = create_run(dir.path(), vec![Task::new("t1", "T1")], None);
        let store = StateStore::open(&ctx.store_path()).unwrap();

        for _ in 0..3 {
            store
                .create_attempt("r1", "t1", Some("hpc"), Some("hpc"), cadence_common::AttemptStatus::Failed)
                .unwrap();
        }
        let attempts = store.list_attempts_for_task("r1", "t1").unwrap();
        let indices: Vec<u32> = attempts.iter().map(|a| a.attempt_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        let task = store.get_task("r1", "t1").unwrap();
        assert_eq!(task.current_attempt_id.as_deref(), Some(attempts[2].attempt_id.as_str()));
    }
}

// =============================================================================
// Legacy store upgrade
// =============================================================================

mod legacy_upgrade {
    use super::*;

    fn write_v1_store(ctx: &RunContext) {
        fs::create_dir_all(&ctx.root).unwrap();
        let conn = rusqlite::Connection::open(ctx.store_path()).unwrap();
        conn.execute_batch(
            "
            CREATE TABLE runs (
                run_id TEXT PRIMARY KEY, workspace TEXT NOT NULL, root TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING', tags TEXT NOT NULL DEFAULT '[]',
                description TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL
            );
            CREATE TABLE tasks (
                run_id TEXT NOT NULL, task_id TEXT NOT NULL, name TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'compute', image TEXT,
                command TEXT NOT NULL DEFAULT '[]', env TEXT NOT NULL DEFAULT '{}',
                files TEXT NOT NULL DEFAULT '[]', resources TEXT NOT NULL DEFAULT '{}',
                dependencies TEXT NOT NULL DEFAULT '[]', operator_key TEXT,
                allow_failure INTEGER NOT NULL DEFAULT 0,
                allow_dependency_failure INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, task_id)
            );
            CREATE TABLE external_runs (
                task_id TEXT PRIMARY KEY, run_id TEXT NOT NULL, operator_type TEXT,
                external_id TEXT, status TEXT NOT NULL, operator_data TEXT NOT NULL DEFAULT '{}',
                relative_path TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL
            );
            INSERT INTO runs (run_id, workspace, root, status, created_at, updated_at)
                VALUES ('r1', '.', 'runs/r1', 'RUNNING', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z');
            INSERT INTO tasks (run_id, task_id, status, created_at, updated_at)
                VALUES ('r1', 'A', 'COMPLETED', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z');
            INSERT INTO tasks (run_id, task_id, dependencies, status, created_at, updated_at)
                VALUES ('r1', 'B', '[\"A\"]', 'PENDING', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z');
            INSERT INTO external_runs (task_id, run_id, operator_type, external_id, status,
                                       created_at, updated_at)
                VALUES ('A', 'r1', 'HumanOperator', 'ext-1', 'COMPLETED',
                        '2025-01-01T00:00:00Z', '2025-01-02T00:00:00Z');
            ",
        )
        .unwrap();
    }

    #[test]
    fn test_open_backfills_one_attempt_per_legacy_run() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(dir.path(), "r1");
        write_v1_store(&ctx);

        let store = StateStore::open(&ctx.store_path()).unwrap();
        let attempts = store.list_attempts_for_task("r1", "A").unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_index, 1);
        assert_eq!(attempts[0].attempt_id, backfill_attempt_id("r1", "A"));

        let a = store.get_task("r1", "A").unwrap();
        assert_eq!(a.current_attempt_id, Some(backfill_attempt_id("r1", "A")));
        let b = store.get_task("r1", "B").unwrap();
        assert!(b.current_attempt_id.is_none());
        assert!(store.list_attempts_for_task("r1", "B").unwrap().is_empty());
    }

    #[test]
    fn test_reopening_legacy_store_is_stable() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(dir.path(), "r1");
        write_v1_store(&ctx);

        let first = {
            let store = StateStore::open(&ctx.store_path()).unwrap();
            store.list_attempts_for_task("r1", "A").unwrap()
        };
        let store = StateStore::open(&ctx.store_path()).unwrap();
        let second = store.list_attempts_for_task("r1", "A").unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(second[0].attempt_id, backfill_attempt_id("r1", "A"));
        assert_eq!(
            store.get_task("r1", "A").unwrap().current_attempt_id,
            Some(second[0].attempt_id.clone())
        );
        assert!(store.list_attempts_for_task("r1", "B").unwrap().is_empty());
    }

    #[test]
    fn test_upgraded_run_finishes_remaining_work() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(dir.path(), "r1");
        write_v1_store(&ctx);

        let report = step(&ctx);
        assert_eq!(report.simulated, 1);
        assert_eq!(report.status, RunStatus::Completed);
    }
}

// =============================================================================
// CLI
// =============================================================================

mod cli {
    use super::*;

    const FAST_CONFIG: &str = "[driver]\npoll_interval_secs = 0\nlock_retry_secs = 0\n";

    fn write_workflow(dir: &TempDir, tasks: serde_json::Value) -> std::path::PathBuf {
        let path = dir.path().join("workflow.json");
        fs::write(&path, serde_json::json!({ "tasks": tasks }).to_string()).unwrap();
        path
    }

    #[test]
    fn test_help_and_version() {
        cadence().arg("--help").assert().success();
        cadence().arg("--version").assert().success();
    }

    #[test]
    fn test_init_then_status() {
        let dir = TempDir::new().unwrap();
        let workflow = write_workflow(
            &dir,
            serde_json::json!([{ "task_id": "prep" }, { "task_id": "sim", "dependencies": ["prep"] }]),
        );

        cadence()
            .args(["--workspace", dir.path().to_str().unwrap()])
            .args(["init", "--run-id", "r1", "--workflow", workflow.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created run"));
        assert!(dir.path().join("runs/r1/state-store").is_file());

        cadence()
            .args(["--workspace", dir.path().to_str().unwrap(), "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PENDING"))
            .stdout(predicate::str::contains("sim"));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().to_str().unwrap();
        cadence().args(["--workspace", ws, "init", "--run-id", "r1"]).assert().success();
        cadence()
            .args(["--workspace", ws, "init", "--run-id", "r1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_run_drives_workflow_to_completion() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("cadence.toml");
        fs::write(&config, FAST_CONFIG).unwrap();
        let workflow = write_workflow(
            &dir,
            serde_json::json!([
                { "task_id": "a" },
                { "task_id": "b", "dependencies": ["a"] },
                { "task_id": "c", "dependencies": ["b"] }
            ]),
        );

        cadence()
            .args(["--workspace", dir.path().to_str().unwrap(), "run"])
            .args(["--workflow", workflow.to_str().unwrap()])
            .args(["--config", config.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETED"));

        cadence()
            .args(["--workspace", dir.path().to_str().unwrap(), "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETED"));
    }

    #[test]
    fn test_step_json_report() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().to_str().unwrap();
        cadence().args(["--workspace", ws, "init", "--run-id", "r1"]).assert().success();

        let output = cadence()
            .args(["--workspace", ws, "step", "--run-id", "r1", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["status"], "COMPLETED");
        assert_eq!(report["run_id"], "r1");
    }

    #[test]
    fn test_external_task_completed_by_operator() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().to_str().unwrap();
        let workflow = write_workflow(
            &dir,
            serde_json::json!([{ "task_id": "sample", "kind": "external" }]),
        );
        cadence()
            .args(["--workspace", ws, "init", "--run-id", "r1"])
            .args(["--workflow", workflow.to_str().unwrap()])
            .assert()
            .success();

        cadence().args(["--workspace", ws, "step", "--run-id", "r1"]).assert().success();
        cadence()
            .args(["--workspace", ws, "status", "--run-id", "r1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("WAITING_EXTERNAL"));

        cadence()
            .args(["--workspace", ws, "external", "--run-id", "r1"])
            .args(["--task", "sample", "--status", "completed"])
            .assert()
            .success();
        cadence()
            .args(["--workspace", ws, "step", "--run-id", "r1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("COMPLETED"));
    }

    #[test]
    fn test_pause_resume_cancel() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path().to_str().unwrap();
        let workflow = write_workflow(
            &dir,
            serde_json::json!([{ "task_id": "review", "kind": "gate" }]),
        );
        cadence()
            .args(["--workspace", ws, "init", "--run-id", "r1"])
            .args(["--workflow", workflow.to_str().unwrap()])
            .assert()
            .success();

        cadence()
            .args(["--workspace", ws, "pause", "--run-id", "r1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("PAUSED"));
        cadence()
            .args(["--workspace", ws, "resume", "--run-id", "r1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("RUNNING"));
        cadence()
            .args(["--workspace", ws, "cancel", "--run-id", "r1", "--reason", "bad batch"])
            .assert()
            .success()
            .stdout(predicate::str::contains("CANCELLED"));
        cadence()
            .args(["--workspace", ws, "pause", "--run-id", "r1"])
            .assert()
            .failure();
    }

    #[test]
    fn test_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        cadence()
            .args(["--workspace", dir.path().to_str().unwrap()])
            .args(["step", "--run-id", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("missing"));
    }

    #[test]
    fn test_list_empty_workspace() {
        let dir = TempDir::new().unwrap();
        cadence()
            .args(["--workspace", dir.path().to_str().unwrap(), "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs found"));
    }
}
