use thiserror::Error;

/// Connection pool failures: acquisition from a closed pool, writer
/// acquisition on a read-only pool, or an open failure during construction.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool for {database} is closed")]
    Closed { database: String },

    #[error("database {database} is read-only; no writer handle exists")]
    ReadOnly { database: String },

    #[error("failed to open connection for {database}: {source}")]
    Open {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("{count} error(s) occurred while closing pool for {database}")]
    CloseAggregate { database: String, count: usize },
}

/// SQL engine failures; always carries the offending SQL text for diagnostics.
#[derive(Debug, Error)]
#[error("query failed: {source} (sql: {sql})")]
pub struct QueryError {
    pub sql: String,
    #[source]
    pub source: sqlx::Error,
}

impl QueryError {
    pub fn new(sql: impl Into<String>, source: sqlx::Error) -> Self {
        Self {
            sql: sql.into(),
            source,
        }
    }
}

/// Schema migration failures; carries the offending version when known.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration directory does not exist or is not a directory: {path}")]
    MissingDirectory { path: String },

    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    #[error("migration file {name} is empty")]
    EmptyFile { name: String },

    #[error("migration {version} ({name}) failed: {source}")]
    Failed {
        version: i64,
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to read migration directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Backup/restore failures.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("destination path contains control characters: {path}")]
    IllegalPath { path: String },

    #[error("backup destination already exists: {path}")]
    AlreadyExists { path: String },

    #[error("failed to create backup directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("VACUUM INTO failed: {source}")]
    VacuumInto {
        #[source]
        source: sqlx::Error,
    },
}

/// Transport-level failures surfaced to WebSocket/HTTP clients.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("operation {op} is not supported over this transport")]
    Unsupported { op: String },
}

/// Connection-level failures (WebSocket handshake/mid-flight disconnects).
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection failed during handshake: {reason}")]
    Handshake { reason: String },

    #[error("connection dropped mid-flight: {reason}")]
    Dropped { reason: String },
}

/// A pending request exceeded its deadline.
#[derive(Debug, Error)]
#[error("request {id} timed out after {millis}ms")]
pub struct TimeoutError {
    pub id: String,
    pub millis: u64,
}

/// A `beforeX` hook vetoed the operation, or a handler otherwise failed.
#[derive(Debug, Error)]
#[error("hook {event} rejected the operation: {reason}")]
pub struct HookError {
    pub event: &'static str,
    pub reason: String,
}

/// The aggregate error taxonomy for sirannon-core. Named error kinds carry
/// machine-readable codes via [`Error::code`] for the wire protocol.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("database {0} is closed")]
    DatabaseClosed(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),
}

impl Error {
    /// Machine-readable error code carried in `{type:'error', error:{code,
    /// message}}` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Pool(_) => "POOL_ERROR",
            Error::Query(_) => "QUERY_ERROR",
            Error::Migration(_) => "MIGRATION_ERROR",
            Error::Backup(_) => "BACKUP_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Hook(_) => "HOOK_ERROR",
            Error::DatabaseClosed(_) => "DATABASE_CLOSED",
            Error::UnknownDatabase(_) => "UNKNOWN_DATABASE",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
