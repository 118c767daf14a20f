use serde::{Deserialize, Serialize};

fn default_read_pool_size() -> usize {
    4
}

fn default_wal_mode() -> bool {
    true
}

fn default_poll_batch_size() -> usize {
    500
}

/// Options accepted when constructing a [`crate::pool::DbPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

impl PoolOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            read_pool_size: default_read_pool_size(),
            wal_mode: default_wal_mode(),
        }
    }

    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    pub fn read_pool_size(mut self, n: usize) -> Self {
        self.read_pool_size = n;
        self
    }

    pub fn wal_mode(mut self, yes: bool) -> Self {
        self.wal_mode = yes;
        self
    }

    /// Reader pool size clamped to at least one.
    pub fn clamped_read_pool_size(&self) -> usize {
        self.read_pool_size.max(1)
    }
}

/// Options for the CDC change tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerOptions {
    /// Retain journal rows younger than this many seconds; `None` disables
    /// retention pruning.
    #[serde(default)]
    pub retention_seconds: Option<f64>,
    #[serde(default = "default_changes_table")]
    pub changes_table: String,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
}

fn default_changes_table() -> String {
    "_sirannon_changes".to_string()
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            retention_seconds: None,
            changes_table: default_changes_table(),
            poll_batch_size: default_poll_batch_size(),
        }
    }
}

/// Identity and lifecycle descriptor for a single database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,
}
