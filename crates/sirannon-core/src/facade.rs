//! `Database`: the single entry point composing the pool, executor,
//! change tracker, subscription manager, and hook registry for one
//! logical database.

use crate::config::{DatabaseDescriptor, PoolOptions, TrackerOptions};
use crate::error::Error;
use crate::executor::{self, execute_raw, ExecuteResult};
use crate::hooks::{HookEvent, HookRegistry};
use crate::pool::DbPool;
use crate::subscriptions::{start_polling, Callback, PollHandle, SubscriptionId, SubscriptionManager};
use crate::tracker::{ChangeTracker, ChangeEvent};
use crate::value::{Filter, Row, Value};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Owns every live piece of state for one database: connections,
/// CDC journal, subscriptions, and the hook chain observing all of it.
pub struct Database {
    id: String,
    pool: Arc<DbPool>,
    tracker: Arc<ChangeTracker>,
    subscriptions: SubscriptionManager,
    hooks: HookRegistry,
    poll_handle: AsyncMutex<Option<PollHandle>>,
}

impl Database {
    /// Opens the pool, runs the CDC bootstrap, and starts the background
    /// poll loop. Fires `beforeConnect` before opening and `databaseOpen`
    /// once the database is ready to serve requests; a rejection from
    /// either hook leaves nothing open.
    #[tracing::instrument(skip(descriptor, tracker_options, hooks), fields(database = %descriptor.id))]
    pub async fn open(
        descriptor: &DatabaseDescriptor,
        tracker_options: TrackerOptions,
        hooks: HookRegistry,
    ) -> Result<Self, Error> {
        let id = descriptor.id.clone();
        hooks
            .invoke(HookEvent::BeforeConnect, json!({ "database": id }))
            .await?;

        let pool_options = PoolOptions::new(descriptor.path.clone())
            .read_only(descriptor.read_only)
            .wal_mode(descriptor.wal_mode)
            .read_pool_size(descriptor.read_pool_size);
        let pool = Arc::new(DbPool::open(&id, pool_options).await?);

        let tracker = match ChangeTracker::new(&pool, tracker_options).await {
            Ok(t) => Arc::new(t),
            Err(e) => {
                let _ = pool.close().await;
                return Err(e);
            }
        };

        if let Err(e) = hooks
            .invoke(HookEvent::DatabaseOpen, json!({ "database": id }))
            .await
        {
            let _ = pool.close().await;
            return Err(e.into());
        }

        let subscriptions = SubscriptionManager::new();
        let handle = start_polling(pool.clone(), tracker.clone(), subscriptions.clone(), DEFAULT_POLL_INTERVAL);

        Ok(Self {
            id,
            pool,
            tracker,
            subscriptions,
            hooks,
            poll_handle: AsyncMutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &Arc<DbPool> {
        &self.pool
    }

    /// Runs `sql` and returns every matching row, reading from the pool's
    /// reader rotation. Fires `beforeQuery`/`afterQuery` around the call.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.hooks
            .invoke(HookEvent::BeforeQuery, json!({ "database": self.id, "sql": sql, "kind": "query" }))
            .await?;
        let mut reader = self.pool.acquire_reader().await?;
        let result = executor::query(&mut reader, sql, params).await;
        drop(reader);
        self.hooks
            .invoke(
                HookEvent::AfterQuery,
                json!({ "database": self.id, "sql": sql, "ok": result.is_ok() }),
            )
            .await?;
        result
    }

    /// Runs a mutating statement against the writer. Fires
    /// `beforeQuery`/`afterQuery` around the call the same way [`query`]
    /// does.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult, Error> {
        self.hooks
            .invoke(HookEvent::BeforeQuery, json!({ "database": self.id, "sql": sql, "kind": "execute" }))
            .await?;
        let mut writer = self.pool.acquire_writer().await?;
        let result = executor::execute(&mut writer, sql, params).await;
        drop(writer);
        self.hooks
            .invoke(
                HookEvent::AfterQuery,
                json!({ "database": self.id, "sql": sql, "ok": result.is_ok() }),
            )
            .await?;
        result
    }

    /// Runs a sequence of differing statements as one transaction; any
    /// failing statement rolls the whole sequence back.
    pub async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<Vec<ExecuteResult>, Error> {
        let mut writer = self.pool.acquire_writer().await?;
        execute_raw(&mut writer.conn, "BEGIN IMMEDIATE")
            .await
            .map_err(|source| crate::error::QueryError::new("BEGIN IMMEDIATE", source))?;

        let mut results = Vec::with_capacity(statements.len());
        for (sql, params) in statements {
            match executor::execute(&mut writer, sql, params).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    let _ = execute_raw(&mut writer.conn, "ROLLBACK").await;
                    return Err(e);
                }
            }
        }

        execute_raw(&mut writer.conn, "COMMIT")
            .await
            .map_err(|source| crate::error::QueryError::new("COMMIT", source))?;
        Ok(results)
    }

    /// Subscribes `callback` to row changes on `table` matching `filter`.
    /// Installs CDC triggers for `table` on first use. Fires
    /// `beforeSubscribe` before registration.
    pub async fn subscribe(
        &self,
        table: &str,
        filter: Option<Filter>,
        callback: Callback,
    ) -> Result<SubscriptionId, Error> {
        self.hooks
            .invoke(HookEvent::BeforeSubscribe, json!({ "database": self.id, "table": table }))
            .await?;
        self.tracker.install(&self.pool, table).await?;
        Ok(self.subscriptions.subscribe(table, filter, callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    /// Polls the CDC journal directly, bypassing the background timer;
    /// useful for tests and for flushing before [`close`].
    pub async fn poll_changes(&self) -> Result<Vec<ChangeEvent>, Error> {
        let events = self.tracker.poll(&self.pool).await?;
        self.subscriptions.dispatch(&events);
        Ok(events)
    }

    /// Writes a `VACUUM INTO` snapshot of this database under `dest_dir`,
    /// named from `timestamp`. See [`crate::backup::backup`].
    pub async fn backup(&self, dest_dir: &Path, timestamp: &str) -> Result<PathBuf, Error> {
        crate::backup::backup(&self.pool, dest_dir, timestamp).await
    }

    /// Stops the background poll loop, fires `databaseClose`, and closes
    /// the pool. Idempotent: a second call is a no-op since the pool's own
    /// close is idempotent and the poll handle is only taken once.
    pub async fn close(&self) -> Result<(), Error> {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.cancel();
        }
        self.hooks
            .invoke(HookEvent::DatabaseClose, json!({ "database": self.id }))
            .await?;
        self.pool.close().await
    }
}
