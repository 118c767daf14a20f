//! Change-data-capture: trigger installation and journal polling.
//!
//! Multi-column primary keys are concatenated with the ASCII Unit
//! Separator (`char(31)`), which cannot appear in ordinary primary-key
//! text and needs no escaping.

use crate::config::TrackerOptions;
use crate::error::Error;
use crate::pool::DbPool;
use crate::value::{Row, Value};
use serde_json::Value as Json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

const RETENTION_BATCH_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn as_sql(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    fn from_sql(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A decoded row mutation, post-journal.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub row: Option<Row>,
    pub old_row: Option<Row>,
    pub seq: i64,
    pub timestamp: f64,
}

impl ChangeEvent {
    /// For insert/update, the new image; for delete, the old image. This is
    /// the row subscription filters are matched against.
    pub fn effective_row(&self) -> Option<&Row> {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => self.row.as_ref(),
            ChangeKind::Delete => self.old_row.as_ref(),
        }
    }
}

struct TableColumns {
    columns: Vec<String>,
    pk_columns: Vec<String>,
}

async fn table_columns(pool: &DbPool, table: &str) -> Result<TableColumns, Error> {
    let mut writer = pool.acquire_writer().await?;
    let pragma = format!("PRAGMA table_info({table})");
    let rows: Vec<(i64, String, String, i64, Option<String>, i64)> =
        sqlx::query_as(&pragma).fetch_all(&mut writer.conn).await.map_err(|source| {
            crate::error::QueryError::new(pragma.clone(), source)
        })?;

    let mut columns = Vec::new();
    let mut pk: Vec<(i64, String)> = Vec::new();
    for (_cid, name, _ty, _notnull, _dflt, pk_index) in rows {
        columns.push(name.clone());
        if pk_index > 0 {
            pk.push((pk_index, name));
        }
    }
    pk.sort_by_key(|(idx, _)| *idx);
    let pk_columns = pk.into_iter().map(|(_, n)| n).collect();

    Ok(TableColumns { columns, pk_columns })
}

fn json_object_expr(prefix: &str, columns: &[String]) -> String {
    let args: Vec<String> = columns
        .iter()
        .map(|c| format!("'{c}', {prefix}.{c}"))
        .collect();
    format!("json_object({})", args.join(", "))
}

fn row_id_expr(prefix: &str, pk_columns: &[String]) -> String {
    if pk_columns.len() == 1 {
        format!("{prefix}.{}", pk_columns[0])
    } else {
        pk_columns
            .iter()
            .map(|c| format!("{prefix}.{c}"))
            .collect::<Vec<_>>()
            .join(" || char(31) || ")
    }
}

/// Tracks installed triggers and the per-database polling high-water mark.
pub struct ChangeTracker {
    options: TrackerOptions,
    installed: Mutex<HashSet<String>>,
    last_seq: AtomicI64,
}

impl ChangeTracker {
    /// Creates the journal table if absent and initializes the high-water
    /// mark to the current `MAX(seq)` so historical changes are not
    /// replayed.
    #[tracing::instrument(skip(pool), fields(database = %pool.database()))]
    pub async fn new(pool: &DbPool, options: TrackerOptions) -> Result<Self, Error> {
        let mut writer = pool.acquire_writer().await?;
        let ddl = journal_ddl(&options.changes_table);
        sqlx::raw_sql(&ddl)
            .execute(&mut writer.conn)
            .await
            .map_err(|source| crate::error::QueryError::new(ddl.clone(), source))?;

        let max_seq: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(seq) FROM {}",
            options.changes_table
        ))
        .fetch_one(&mut writer.conn)
        .await
        .map_err(|source| crate::error::QueryError::new("SELECT MAX(seq)", source))?;

        Ok(Self {
            options,
            installed: Mutex::new(HashSet::new()),
            last_seq: AtomicI64::new(max_seq.unwrap_or(0)),
        })
    }

    pub fn changes_table(&self) -> &str {
        &self.options.changes_table
    }

    pub fn last_seq(&self) -> i64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub fn is_installed(&self, table: &str) -> bool {
        self.installed.lock().unwrap().contains(table)
    }

    /// Installs `AFTER` triggers for `table` if not already installed.
    /// Idempotent via `IF NOT EXISTS`; records the table in memory to avoid
    /// reissuing DDL.
    #[tracing::instrument(skip(self, pool), fields(database = %pool.database(), table))]
    pub async fn install(&self, pool: &DbPool, table: &str) -> Result<(), Error> {
        if self.is_installed(table) {
            return Ok(());
        }

        let cols = table_columns(pool, table).await?;
        if cols.pk_columns.is_empty() {
            // Fall back to SQLite's implicit rowid when no explicit PK exists.
            let rowid_cols = vec!["rowid".to_string()];
            self.install_with_pk(pool, table, &cols.columns, &rowid_cols).await?;
        } else {
            self.install_with_pk(pool, table, &cols.columns, &cols.pk_columns).await?;
        }

        self.installed.lock().unwrap().insert(table.to_string());
        debug!("CDC triggers installed");
        Ok(())
    }

    async fn install_with_pk(
        &self,
        pool: &DbPool,
        table: &str,
        columns: &[String],
        pk_columns: &[String],
    ) -> Result<(), Error> {
        let changes_table = &self.options.changes_table;
        let new_json = json_object_expr("NEW", columns);
        let old_json = json_object_expr("OLD", columns);
        let row_id_new = row_id_expr("NEW", pk_columns);
        let row_id_old = row_id_expr("OLD", pk_columns);

        let ddl = format!(
            r#"
CREATE TRIGGER IF NOT EXISTS _sirannon_trg_{table}_ins AFTER INSERT ON {table} BEGIN
    INSERT INTO {changes_table}(table_name, operation, row_id, old_data, new_data)
    VALUES ('{table}', 'INSERT', {row_id_new}, NULL, {new_json});
END;

CREATE TRIGGER IF NOT EXISTS _sirannon_trg_{table}_upd AFTER UPDATE ON {table} BEGIN
    INSERT INTO {changes_table}(table_name, operation, row_id, old_data, new_data)
    VALUES ('{table}', 'UPDATE', {row_id_new}, {old_json}, {new_json});
END;

CREATE TRIGGER IF NOT EXISTS _sirannon_trg_{table}_del AFTER DELETE ON {table} BEGIN
    INSERT INTO {changes_table}(table_name, operation, row_id, old_data, new_data)
    VALUES ('{table}', 'DELETE', {row_id_old}, {old_json}, NULL);
END;
"#
        );

        let mut writer = pool.acquire_writer().await?;
        sqlx::raw_sql(&ddl)
            .execute(&mut writer.conn)
            .await
            .map_err(|source| crate::error::QueryError::new(ddl.clone(), source))?;
        Ok(())
    }

    /// Polls for change rows above the high-water mark, in ascending `seq`
    /// order, advancing the mark even past rows that fail to parse.
    #[tracing::instrument(skip(self, pool), fields(database = %pool.database()))]
    pub async fn poll(&self, pool: &DbPool) -> Result<Vec<ChangeEvent>, Error> {
        let since = self.last_seq();
        let sql = format!(
            "SELECT seq, table_name, operation, row_id, changed_at, old_data, new_data FROM {} WHERE seq > ? ORDER BY seq ASC LIMIT ?",
            self.options.changes_table
        );

        let mut reader = pool.acquire_reader().await?;
        let rows: Vec<(i64, String, String, Json, f64, Option<String>, Option<String>)> =
            sqlx::query_as(&sql)
                .bind(since)
                .bind(self.options.poll_batch_size as i64)
                .fetch_all(&mut reader.conn)
                .await
                .map_err(|source| crate::error::QueryError::new(sql.clone(), source))?;
        drop(reader);

        let mut events = Vec::with_capacity(rows.len());
        let mut max_seq = since;
        for (seq, table, operation, _row_id, changed_at, old_data, new_data) in rows {
            max_seq = max_seq.max(seq);
            let Some(kind) = ChangeKind::from_sql(&operation) else {
                warn!(seq, operation, "unknown CDC operation, skipping");
                continue;
            };
            let old_row = match old_data.as_deref().map(parse_row) {
                Some(Ok(r)) => Some(r),
                Some(Err(e)) => {
                    warn!(seq, error = %e, "failed to parse old_data, skipping row");
                    continue;
                }
                None => None,
            };
            let row = match new_data.as_deref().map(parse_row) {
                Some(Ok(r)) => Some(r),
                Some(Err(e)) => {
                    warn!(seq, error = %e, "failed to parse new_data, skipping row");
                    continue;
                }
                None => None,
            };
            events.push(ChangeEvent {
                kind,
                table,
                row,
                old_row,
                seq,
                timestamp: changed_at,
            });
        }

        self.last_seq.store(max_seq, Ordering::SeqCst);

        if let Some(retention) = self.options.retention_seconds {
            self.prune(pool, retention).await?;
        }

        Ok(events)
    }

    /// Deletes journal rows older than `retention` seconds, bounded to
    /// avoid stalling the poll cycle.
    async fn prune(&self, pool: &DbPool, retention_seconds: f64) -> Result<(), Error> {
        let sql = format!(
            "DELETE FROM {changes_table} WHERE seq IN (SELECT seq FROM {changes_table} WHERE changed_at < (unixepoch('subsec') - ?) LIMIT ?)",
            changes_table = self.options.changes_table
        );
        let mut writer = pool.acquire_writer().await?;
        sqlx::query(&sql)
            .bind(retention_seconds)
            .bind(RETENTION_BATCH_LIMIT)
            .execute(&mut writer.conn)
            .await
            .map_err(|source| crate::error::QueryError::new(sql.clone(), source))?;
        Ok(())
    }
}

fn journal_ddl(changes_table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {changes_table} (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT,
    operation TEXT,
    row_id,
    changed_at REAL DEFAULT (unixepoch('subsec')),
    old_data TEXT,
    new_data TEXT
)
"#
    )
}

fn parse_row(data: &str) -> Result<Row, serde_json::Error> {
    let value: Json = serde_json::from_str(data)?;
    let obj = value.as_object().cloned().unwrap_or_default();
    Ok(obj
        .into_iter()
        .map(|(k, v)| (k, Value::from_json(&v)))
        .collect())
}
