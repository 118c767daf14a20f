//! Stateless query/execute primitives over a pooled connection handle.
//!
//! Every call touches the connection's [`crate::stmt_cache::StatementCache`]
//! so cache occupancy stays observable independent of sqlx's own internal
//! statement cache.

use crate::error::{Error, QueryError};
use crate::pool::ConnHandle;
use crate::value::{Row, Value};
use sqlx::{Column, Row as SqlxRow, SqliteConnection};

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for p in params {
        query = match p {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(i) => query.bind(*i),
            Value::Real(r) => query.bind(*r),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Blob(b) => query.bind(b.as_slice()),
        };
    }
    query
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Row {
    row.columns()
        .iter()
        .map(|col| {
            let name = col.name().to_string();
            let value = decode_column(row, col.ordinal());
            (name, value)
        })
        .collect()
}

fn decode_column(row: &sqlx::sqlite::SqliteRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Value::Integer(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Value::Real(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return Value::Text(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
        return Value::Blob(v);
    }
    Value::Null
}

/// Result of [`execute`]: rows affected and the last insert rowid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResult {
    pub changes: u64,
    pub last_insert_row_id: i64,
}

/// Run `sql` against `handle`, returning every matching row.
pub async fn query(handle: &mut ConnHandle, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
    handle.statements.touch(sql);
    let q = bind_params(sqlx::query(sql), params);
    let rows = q
        .fetch_all(&mut handle.conn)
        .await
        .map_err(|source| QueryError::new(sql, source))?;
    Ok(rows.iter().map(decode_row).collect())
}

/// Run `sql` against `handle`, returning at most one row.
pub async fn query_one(
    handle: &mut ConnHandle,
    sql: &str,
    params: &[Value],
) -> Result<Option<Row>, Error> {
    handle.statements.touch(sql);
    let q = bind_params(sqlx::query(sql), params);
    let row = q
        .fetch_optional(&mut handle.conn)
        .await
        .map_err(|source| QueryError::new(sql, source))?;
    Ok(row.as_ref().map(decode_row))
}

/// Run a mutating statement against `handle`.
pub async fn execute(
    handle: &mut ConnHandle,
    sql: &str,
    params: &[Value],
) -> Result<ExecuteResult, Error> {
    handle.statements.touch(sql);
    let q = bind_params(sqlx::query(sql), params);
    let result = q
        .execute(&mut handle.conn)
        .await
        .map_err(|source| QueryError::new(sql, source))?;
    Ok(ExecuteResult {
        changes: result.rows_affected(),
        last_insert_row_id: result.last_insert_rowid(),
    })
}

/// Run the same statement over an array of parameter tuples inside one
/// transaction, returning per-row results. On any row failure the
/// transaction rolls back and the error propagates.
pub async fn execute_batch(
    handle: &mut ConnHandle,
    sql: &str,
    param_rows: &[Vec<Value>],
) -> Result<Vec<ExecuteResult>, Error> {
    execute_raw(&mut handle.conn, "BEGIN IMMEDIATE")
        .await
        .map_err(|source| QueryError::new("BEGIN IMMEDIATE", source))?;

    let mut results = Vec::with_capacity(param_rows.len());
    for params in param_rows {
        handle.statements.touch(sql);
        let q = bind_params(sqlx::query(sql), params);
        match q.execute(&mut handle.conn).await {
            Ok(result) => results.push(ExecuteResult {
                changes: result.rows_affected(),
                last_insert_row_id: result.last_insert_rowid(),
            }),
            Err(source) => {
                let _ = execute_raw(&mut handle.conn, "ROLLBACK").await;
                return Err(QueryError::new(sql, source).into());
            }
        }
    }

    execute_raw(&mut handle.conn, "COMMIT")
        .await
        .map_err(|source| QueryError::new("COMMIT", source))?;
    Ok(results)
}

/// Run raw, unparameterized SQL (used for transaction control and DDL).
pub async fn execute_raw(conn: &mut SqliteConnection, sql: &str) -> Result<(), sqlx::Error> {
    sqlx::query(sql).execute(conn).await.map(|_| ())
}
