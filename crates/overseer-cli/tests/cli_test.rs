//! Integration tests for the `overseer` binary's offline commands.
//!
//! Each test points the binary at a scratch SQLite file (and a scratch
//! config directory) so nothing touches the user's real data.

use std::path::Path;
use std::process::{Command, Output};

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use overseer_db::HistoryStore;
use overseer_db::config::DbConfig;
use overseer_db::models::{IterationResult, NewIterationRecord};

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn overseer(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_overseer"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env("RUST_LOG", "warn")
        .env_remove("OVERSEER_DATABASE_URL")
        .env_remove("OVERSEER_AGENT_BIN")
        .output()
        .expect("failed to run overseer binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn database_url(tmp: &TempDir) -> String {
    DbConfig::for_path(tmp.path().join("history.db")).database_url
}

async fn seed(tmp: &TempDir) {
    let store = HistoryStore::open(&DbConfig::new(database_url(tmp)))
        .await
        .expect("open history store");
    let started_at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    for (n, performer, result) in [
        (1, "task", IterationResult::Success),
        (2, "cleanup", IterationResult::NoProgress),
    ] {
        store
            .append(&NewIterationRecord {
                iteration_number: n,
                performer_name: performer.to_string(),
                performer_emoji: "🔨".to_string(),
                result,
                tasks_before: 3,
                tasks_after: 2,
                duration_seconds: 90.0,
                started_at,
                ended_at: started_at + chrono::Duration::seconds(90 * n),
                error_message: None,
            })
            .await
            .expect("append");
    }
    store.close().await;
}

// -----------------------------------------------------------------------
// history / stats
// -----------------------------------------------------------------------

#[tokio::test]
async fn stats_on_a_fresh_database() {
    let tmp = TempDir::new().unwrap();
    let url = database_url(&tmp);

    let output = overseer(tmp.path(), &["--database-url", &url, "stats"]);
    assert!(output.status.success(), "stats failed: {output:?}");
    let out = stdout(&output);
    assert!(out.contains("Total iterations: 0"), "unexpected output: {out}");
    assert!(tmp.path().join("history.db").exists());
}

#[tokio::test]
async fn history_lists_seeded_iterations() {
    let tmp = TempDir::new().unwrap();
    seed(&tmp).await;
    let url = database_url(&tmp);

    let output = overseer(tmp.path(), &["--database-url", &url, "history"]);
    assert!(output.status.success(), "history failed: {output:?}");
    let out = stdout(&output);
    assert!(out.contains("Iterations 1-2 of 2:"), "unexpected output: {out}");
    let cleanup = out.find("cleanup: no_progress").expect("cleanup line");
    let task = out.find("task: success").expect("task line");
    assert!(cleanup < task, "newest iteration should come first: {out}");

    let output = overseer(
        tmp.path(),
        &["--database-url", &url, "history", "--result", "success"],
    );
    let out = stdout(&output);
    assert!(out.contains("of 1:"), "unexpected output: {out}");
    assert!(!out.contains("cleanup"), "filter leaked: {out}");

    let output = overseer(tmp.path(), &["--database-url", &url, "stats"]);
    let out = stdout(&output);
    assert!(out.contains("Total iterations: 2"), "unexpected output: {out}");
    assert!(out.contains("Performers: cleanup, task"), "unexpected output: {out}");
}

#[tokio::test]
async fn history_rejects_unknown_result() {
    let tmp = TempDir::new().unwrap();
    let url = database_url(&tmp);

    let output = overseer(
        tmp.path(),
        &["--database-url", &url, "history", "--result", "exploded"],
    );
    assert!(!output.status.success());
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("invalid iteration result"), "unexpected stderr: {err}");
}

// -----------------------------------------------------------------------
// init / completions
// -----------------------------------------------------------------------

#[test]
fn init_writes_config_and_refuses_to_overwrite() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("overseer").join("config.toml");

    let output = overseer(tmp.path(), &["init"]);
    assert!(output.status.success(), "init failed: {output:?}");
    let contents = std::fs::read_to_string(&config_path).unwrap();
    assert!(contents.contains("[backlog]"), "unexpected config: {contents}");
    assert!(contents.contains("json-events"), "unexpected config: {contents}");

    let output = overseer(tmp.path(), &["init"]);
    assert!(!output.status.success());
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("already exists"), "unexpected stderr: {err}");

    let output = overseer(tmp.path(), &["init", "--force"]);
    assert!(output.status.success(), "init --force failed: {output:?}");
}

#[test]
fn completions_are_generated() {
    let tmp = TempDir::new().unwrap();
    let output = overseer(tmp.path(), &["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("overseer"));
}
