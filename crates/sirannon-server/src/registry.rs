//! Opens and owns every configured database for the life of the process.
//!
//! Hooks are a programmatic extension point: the wire configuration
//! format has no way to name a Rust closure, so databases
//! opened from [`ServerConfig`] start with an empty [`HookRegistry`].
//! Embedders linking `sirannon-server` as a library can still populate one
//! before calling [`DatabaseRegistry::open`].

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use sirannon_core::{migrations, Database, HookRegistry};
use sirannon_protocol::DatabaseStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Every open [`Database`], keyed by its configured id.
pub struct DatabaseRegistry {
    databases: HashMap<String, Arc<Database>>,
}

impl DatabaseRegistry {
    /// Opens every database named in `config`, in listed order, running its
    /// migrations directory (if any) once the CDC tracker is attached. If
    /// any database fails to open, databases already opened in this call
    /// are closed best-effort before the error propagates.
    #[tracing::instrument(skip_all)]
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let mut databases = HashMap::new();

        for db_config in &config.databases {
            let id = db_config.descriptor.id.clone();
            let opened = Self::open_one(db_config).await;
            match opened {
                Ok(db) => {
                    info!(database = %id, "database ready");
                    databases.insert(id, Arc::new(db));
                }
                Err(e) => {
                    for (_, db) in databases.drain() {
                        let _ = db.close().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { databases })
    }

    async fn open_one(db_config: &crate::config::DatabaseConfig) -> Result<Database> {
        let db = Database::open(
            &db_config.descriptor,
            db_config.tracker.clone(),
            HookRegistry::new(),
        )
        .await
        .map_err(Error::Core)?;

        if let Some(dir) = &db_config.migrations_dir {
            if let Err(e) = migrations::run(db.pool(), dir).await {
                let _ = db.close().await;
                return Err(Error::Core(e));
            }
        }

        Ok(db)
    }

    /// Looks up a database by id, or an [`Error::UnknownDatabase`] if no
    /// database with that id was configured.
    pub fn get(&self, id: &str) -> Result<Arc<Database>> {
        self.databases
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownDatabase(id.to_string()))
    }

    /// Snapshot of every database's identity and pool state, for
    /// `GET /health/ready`.
    pub fn statuses(&self) -> Vec<DatabaseStatus> {
        let mut statuses: Vec<DatabaseStatus> = self
            .databases
            .values()
            .map(|db| DatabaseStatus {
                id: db.id().to_string(),
                path: db.pool().options().path.clone(),
                read_only: db.pool().options().read_only,
                closed: db.pool().is_closed(),
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Closes every database, isolating failures so one stuck database does
    /// not prevent the others from shutting down.
    #[tracing::instrument(skip_all)]
    pub async fn close_all(&self) {
        for (id, db) in &self.databases {
            if let Err(e) = db.close().await {
                tracing::warn!(database = %id, error = %e, "error closing database");
            }
        }
    }
}
