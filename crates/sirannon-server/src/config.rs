//! Server configuration: layered TOML file plus `SIRANNON_`-prefixed
//! environment overrides, mirroring the `config` crate usage the workspace
//! already carries as a dependency.

use crate::error::{Error, Result};
use config::{Config as RawConfig, Environment, File};
use serde::Deserialize;
use sirannon_core::{DatabaseDescriptor, TrackerOptions};
use std::path::{Path, PathBuf};

fn default_bind_address() -> String {
    "127.0.0.1:7878".to_string()
}

/// One configured database: its connection descriptor, CDC tracker options,
/// and an optional migrations directory applied once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(flatten)]
    pub descriptor: DatabaseDescriptor,
    #[serde(default)]
    pub tracker: TrackerOptions,
    #[serde(default)]
    pub migrations_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            databases: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Builds configuration from an optional TOML file layered under
    /// environment variables prefixed `SIRANNON__` (double underscore as
    /// the nesting separator, e.g. `SIRANNON__BIND_ADDRESS`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            RawConfig::builder().set_default("bind_address", default_bind_address())?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        builder = builder.add_source(Environment::with_prefix("SIRANNON").separator("__"));

        let raw = builder.build().map_err(Error::Config)?;
        raw.try_deserialize().map_err(Error::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_when_no_file_given() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:7878");
        assert!(config.databases.is_empty());
    }

    #[test]
    fn loads_databases_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sirannon.toml");
        fs::write(
            &path,
            r#"
bind_address = "0.0.0.0:9000"

[[databases]]
id = "main"
path = "./data/main.db"
read_pool_size = 2

[databases.tracker]
poll_batch_size = 250
"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.databases[0].descriptor.id, "main");
        assert_eq!(config.databases[0].descriptor.read_pool_size, 2);
        assert_eq!(config.databases[0].tracker.poll_batch_size, 250);
    }
}
