//! Connection settings for the SQLite saver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for [`crate::SqliteSaver`].
///
/// Deserializable so it can live in an application settings file; every
/// field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSaverConfig {
    /// Database file. Created when missing.
    pub path: PathBuf,
    /// Upper bound of pooled connections.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
    /// How long to wait for a pooled connection.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Rows fetched per round trip while listing.
    pub page_size: u32,
}

impl Default for SqliteSaverConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoints.sqlite"),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            page_size: 64,
        }
    }
}

impl SqliteSaverConfig {
    /// Default settings for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SqliteSaverConfig::default();
        assert_eq!(config.path, PathBuf::from("checkpoints.sqlite"));
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.page_size, 64);
    }

    #[test]
    fn test_deserialize_partial_settings() {
        let config: SqliteSaverConfig = serde_json::from_value(serde_json::json!({
            "path": "/var/lib/agent/memory.sqlite",
            "busy_timeout": "250ms",
        }))
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/var/lib/agent/memory.sqlite"));
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builder() {
        let config = SqliteSaverConfig::new("a.sqlite")
            .with_max_connections(2)
            .with_page_size(3)
            .with_busy_timeout(Duration::from_secs(1));
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.page_size, 3);
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
    }
}
