//! Shared test utilities for overseer integration tests.
//!
//! Each test gets its own SQLite file inside a temporary directory, so
//! tests can run in parallel without sharing a ledger. The directory is
//! removed when the returned [`TestDb`] is dropped.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tempfile::TempDir;

use overseer_db::HistoryStore;
use overseer_db::config::DbConfig;
use overseer_db::pool;

/// A migrated scratch database plus the directory that holds it.
pub struct TestDb {
    pub pool: SqlitePool,
    pub config: DbConfig,
    dir: TempDir,
}

impl TestDb {
    pub fn store(&self) -> HistoryStore {
        HistoryStore::new(self.pool.clone())
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub async fn teardown(self) {
        self.pool.close().await;
        drop(self.dir);
    }
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir for test database");
    let config = DbConfig::for_path(dir.path().join("history.db"));
    let pool = pool::connect_and_migrate(&config)
        .await
        .expect("migrations should succeed");
    TestDb { pool, config, dir }
}

/// Write an executable `/bin/sh` script that stands in for the agent.
///
/// `body` is everything after the shebang line. Returns the script path.
pub fn write_fake_agent(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write fake agent");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make fake agent executable");
    }

    path
}
