use std::env;
use std::path::PathBuf;

/// Database configuration.
///
/// Reads from the `OVERSEER_DATABASE_URL` environment variable, falling back
/// to a `history.db` file inside the data directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL (`sqlite://<path>`).
    pub database_url: String,
}

impl DbConfig {
    /// Environment variable holding an explicit database URL.
    pub const URL_ENV: &str = "OVERSEER_DATABASE_URL";

    /// Environment variable overriding the data directory.
    pub const DATA_DIR_ENV: &str = "OVERSEER_DATA_DIR";

    /// Build a config from the environment.
    ///
    /// Priority: `OVERSEER_DATABASE_URL`, then [`DbConfig::default_url`].
    pub fn from_env() -> Self {
        let database_url = env::var(Self::URL_ENV).unwrap_or_else(|_| Self::default_url());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Build a config pointing at a database file on disk.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self::new(format!("sqlite://{}", path.into().display()))
    }

    /// Directory holding overseer's persistent data.
    ///
    /// `$OVERSEER_DATA_DIR` when set, otherwise `~/.overseer`.
    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = env::var(Self::DATA_DIR_ENV) {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".overseer")
    }

    /// The URL used when nothing else is configured.
    pub fn default_url() -> String {
        format!("sqlite://{}", Self::data_dir().join("history.db").display())
    }

    /// Filesystem path of the database file, if the URL names one.
    ///
    /// Returns `None` for in-memory databases.
    pub fn database_path(&self) -> Option<PathBuf> {
        let rest = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().unwrap_or(rest);
        if path.is_empty() || path == ":memory:" {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
