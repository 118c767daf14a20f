//! Per-database connection pool: one writer handle (absent if read-only)
//! plus an ordered sequence of reader handles, round-robin selected, so
//! WAL-mode readers never contend with the single writer.

use crate::config::PoolOptions;
use crate::error::{Error, PoolError};
use crate::stmt_cache::StatementCache;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::ConnectOptions;
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// One pooled connection plus its logical statement cache.
pub struct ConnHandle {
    pub conn: SqliteConnection,
    pub statements: StatementCache,
}

/// A database connection pool: at most one writer, `read_pool_size` readers.
pub struct DbPool {
    database: String,
    options: PoolOptions,
    writer: Option<Mutex<ConnHandle>>,
    readers: Vec<Mutex<ConnHandle>>,
    next_reader: AtomicUsize,
    closed: AtomicBool,
}

async fn open_reader(path: &str) -> Result<SqliteConnection, sqlx::Error> {
    let mut conn = SqliteConnectOptions::from_str(path)?
        .read_only(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .connect()
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut conn)
        .await?;
    Ok(conn)
}

async fn open_writer(path: &str, wal_mode: bool) -> Result<SqliteConnection, sqlx::Error> {
    let mut opts = SqliteConnectOptions::from_str(path)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if wal_mode {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }
    let mut conn = opts.connect().await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut conn)
        .await?;
    if wal_mode {
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&mut conn)
            .await?;
    }
    Ok(conn)
}

impl DbPool {
    /// Opens the writer first (unless read-only), then `read_pool_size`
    /// readers (clamped to at least one). If any open fails partway, all
    /// previously opened handles are closed best-effort and the original
    /// error propagates.
    #[tracing::instrument(skip_all, fields(database = %database.as_ref()))]
    pub async fn open(database: impl AsRef<str>, options: PoolOptions) -> Result<Self, Error> {
        let database = database.as_ref().to_string();
        let reader_count = options.clamped_read_pool_size();

        let writer = if options.read_only {
            None
        } else {
            match open_writer(&options.path, options.wal_mode).await {
                Ok(conn) => Some(conn),
                Err(source) => {
                    return Err(PoolError::Open {
                        database: database.clone(),
                        source,
                    }
                    .into())
                }
            }
        };

        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            match open_reader(&options.path).await {
                Ok(conn) => readers.push(conn),
                Err(source) => {
                    // Best-effort cleanup of everything opened so far.
                    for mut r in readers {
                        let _ = r.close().await;
                    }
                    if let Some(mut w) = writer {
                        let _ = w.close().await;
                    }
                    return Err(PoolError::Open {
                        database: database.clone(),
                        source,
                    }
                    .into());
                }
            }
        }

        debug!(readers = readers.len(), writer = writer.is_some(), "pool opened");

        Ok(Self {
            database,
            options,
            writer: writer.map(|conn| {
                Mutex::new(ConnHandle {
                    conn,
                    statements: StatementCache::new(),
                })
            }),
            readers: readers
                .into_iter()
                .map(|conn| {
                    Mutex::new(ConnHandle {
                        conn,
                        statements: StatementCache::new(),
                    })
                })
                .collect(),
            next_reader: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(PoolError::Closed {
                database: self.database.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Returns the next reader by round-robin over a monotonic index.
    pub async fn acquire_reader(&self) -> Result<MutexGuard<'_, ConnHandle>, Error> {
        self.check_open()?;
        if self.readers.is_empty() {
            return Err(PoolError::Closed {
                database: self.database.clone(),
            }
            .into());
        }
        let idx = self.next_reader.fetch_add(1, Ordering::SeqCst) % self.readers.len();
        Ok(self.readers[idx].lock().await)
    }

    /// Returns the single writer handle; fails on a read-only pool.
    pub async fn acquire_writer(&self) -> Result<MutexGuard<'_, ConnHandle>, Error> {
        self.check_open()?;
        match &self.writer {
            Some(w) => Ok(w.lock().await),
            None => Err(PoolError::ReadOnly {
                database: self.database.clone(),
            }
            .into()),
        }
    }

    /// Idempotent close: closes every reader then the writer, accumulating
    /// errors into a single aggregate report with the count.
    #[tracing::instrument(skip_all, fields(database = %self.database))]
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = 0usize;
        for reader in &self.readers {
            let mut guard = reader.lock().await;
            if let Err(e) = guard.conn.close_with(Vec::new()).await {
                warn!(error = %e, "error closing reader");
                errors += 1;
            }
        }
        if let Some(writer) = &self.writer {
            let mut guard = writer.lock().await;
            if let Err(e) = guard.conn.close_with(Vec::new()).await {
                warn!(error = %e, "error closing writer");
                errors += 1;
            }
        }

        if errors > 0 {
            return Err(PoolError::CloseAggregate {
                database: self.database.clone(),
                count: errors,
            }
            .into());
        }
        Ok(())
    }
}
