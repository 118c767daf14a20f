//! Versioned, transactional schema evolution.

use crate::error::{Error, MigrationError};
use crate::executor::execute_raw;
use crate::pool::DbPool;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;

static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_(\w+)\.sql$").expect("static regex is valid"));

/// A discovered migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub path: PathBuf,
}

/// Outcome of [`run`]: files applied this run, and how many were skipped
/// because they were already recorded as applied.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub applied: Vec<MigrationFile>,
    pub skipped: usize,
}

const TRACKING_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _sirannon_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at REAL
)
"#;

fn scan_directory(dir: &Path) -> Result<Vec<MigrationFile>, Error> {
    if !dir.is_dir() {
        return Err(MigrationError::MissingDirectory {
            path: dir.to_string_lossy().into_owned(),
        }
        .into());
    }

    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|source| MigrationError::Io {
        path: dir.to_string_lossy().into_owned(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| MigrationError::Io {
            path: dir.to_string_lossy().into_owned(),
            source,
        })?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(caps) = FILENAME_RE.captures(file_name) else {
            continue;
        };
        let version: i64 = caps[1].parse().expect("regex guarantees digits");
        let name = caps[2].to_string();

        let contents = std::fs::read_to_string(entry.path()).map_err(|source| MigrationError::Io {
            path: entry.path().to_string_lossy().into_owned(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Err(MigrationError::EmptyFile { name: file_name.to_string() }.into());
        }

        files.push(MigrationFile {
            version,
            name,
            path: entry.path(),
        });
    }

    files.sort_by_key(|f| f.version);

    for window in files.windows(2) {
        if window[0].version == window[1].version {
            return Err(MigrationError::DuplicateVersion {
                version: window[0].version,
                first: file_basename(&window[0].path),
                second: file_basename(&window[1].path),
            }
            .into());
        }
    }

    Ok(files)
}

fn file_basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Apply all pending migrations found under `dir` to `pool`'s writer.
#[tracing::instrument(skip(pool), fields(database = %pool.database()))]
pub async fn run(pool: &DbPool, dir: &Path) -> Result<MigrationReport, Error> {
    let files = scan_directory(dir)?;

    let mut writer = pool.acquire_writer().await?;
    execute_raw(&mut writer.conn, TRACKING_TABLE_DDL)
        .await
        .map_err(|source| MigrationError::Failed {
            version: 0,
            name: "_sirannon_migrations".to_string(),
            source,
        })?;

    let applied_versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM _sirannon_migrations")
        .fetch_all(&mut writer.conn)
        .await
        .map_err(|source| MigrationError::Failed {
            version: 0,
            name: "_sirannon_migrations".to_string(),
            source,
        })?;

    let pending: Vec<&MigrationFile> = files
        .iter()
        .filter(|f| !applied_versions.contains(&f.version))
        .collect();
    let skipped = files.len() - pending.len();

    if pending.is_empty() {
        return Ok(MigrationReport {
            applied: Vec::new(),
            skipped,
        });
    }

    execute_raw(&mut writer.conn, "BEGIN IMMEDIATE")
        .await
        .map_err(|source| MigrationError::Failed {
            version: pending[0].version,
            name: pending[0].name.clone(),
            source,
        })?;

    let mut applied = Vec::with_capacity(pending.len());
    for file in &pending {
        let sql = std::fs::read_to_string(&file.path).map_err(|source| MigrationError::Io {
            path: file.path.to_string_lossy().into_owned(),
            source,
        })?;

        let result: Result<(), sqlx::Error> = async {
            sqlx::raw_sql(&sql).execute(&mut writer.conn).await?;
            sqlx::query("INSERT INTO _sirannon_migrations(version, name, applied_at) VALUES (?, ?, unixepoch('subsec'))")
                .bind(file.version)
                .bind(&file.name)
                .execute(&mut writer.conn)
                .await?;
            Ok(())
        }
        .await;

        if let Err(source) = result {
            let _ = execute_raw(&mut writer.conn, "ROLLBACK").await;
            return Err(MigrationError::Failed {
                version: file.version,
                name: file.name.clone(),
                source,
            }
            .into());
        }
        applied.push((*file).clone());
    }

    execute_raw(&mut writer.conn, "COMMIT")
        .await
        .map_err(|source| MigrationError::Failed {
            version: pending.last().unwrap().version,
            name: pending.last().unwrap().name.clone(),
            source,
        })?;

    info!(applied = applied.len(), skipped, "migrations applied");
    Ok(MigrationReport { applied, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use std::fs;
    use tempfile::tempdir;

    async fn open_pool(dir: &tempfile::TempDir, name: &str) -> DbPool {
        let path = dir.path().join(format!("{name}.db")).to_string_lossy().into_owned();
        DbPool::open(name, PoolOptions::new(path)).await.unwrap()
    }

    #[tokio::test]
    async fn applies_in_version_order_then_skips_on_rerun() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "migrate").await;

        let migrations_dir = tempdir().unwrap();
        fs::write(migrations_dir.path().join("001_a.sql"), "CREATE TABLE a(x INTEGER);").unwrap();
        fs::write(migrations_dir.path().join("002_b.sql"), "CREATE TABLE b(x INTEGER);").unwrap();
        fs::write(migrations_dir.path().join("010_c.sql"), "CREATE TABLE c(x INTEGER);").unwrap();
        fs::write(migrations_dir.path().join("notes.txt"), "ignored").unwrap();

        let report = run(&pool, migrations_dir.path()).await.unwrap();
        assert_eq!(
            report.applied.iter().map(|f| f.version).collect::<Vec<_>>(),
            vec![1, 2, 10]
        );
        assert_eq!(report.skipped, 0);

        let report2 = run(&pool, migrations_dir.path()).await.unwrap();
        assert!(report2.applied.is_empty());
        assert_eq!(report2.skipped, 3);
    }

    #[tokio::test]
    async fn duplicate_version_reports_both_filenames() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "migrate_dup").await;

        let migrations_dir = tempdir().unwrap();
        fs::write(migrations_dir.path().join("002_b.sql"), "CREATE TABLE b(x INTEGER);").unwrap();
        fs::write(migrations_dir.path().join("002_d.sql"), "CREATE TABLE d(x INTEGER);").unwrap();

        let err = run(&pool, migrations_dir.path()).await.unwrap_err();
        match err {
            Error::Migration(MigrationError::DuplicateVersion { version, first, second }) => {
                assert_eq!(version, 2);
                let names = [first, second];
                assert!(names.contains(&"002_b.sql".to_string()));
                assert!(names.contains(&"002_d.sql".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "migrate_empty").await;

        let migrations_dir = tempdir().unwrap();
        fs::write(migrations_dir.path().join("001_a.sql"), "   \n").unwrap();

        let err = run(&pool, migrations_dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Migration(MigrationError::EmptyFile { .. })));
    }

    #[tokio::test]
    async fn missing_directory_errors() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "migrate_missing").await;
        let err = run(&pool, Path::new("/no/such/directory")).await.unwrap_err();
        assert!(matches!(err, Error::Migration(MigrationError::MissingDirectory { .. })));
    }

    #[tokio::test]
    async fn failing_statement_rolls_back_whole_batch() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "migrate_fail").await;

        let migrations_dir = tempdir().unwrap();
        fs::write(migrations_dir.path().join("001_a.sql"), "CREATE TABLE a(x INTEGER);").unwrap();
        fs::write(migrations_dir.path().join("002_bad.sql"), "NOT VALID SQL;").unwrap();

        let err = run(&pool, migrations_dir.path()).await.unwrap_err();
        match err {
            Error::Migration(MigrationError::Failed { version, .. }) => assert_eq!(version, 2),
            other => panic!("unexpected error: {other:?}"),
        }

        // Table `a` from the first statement should have rolled back too.
        let mut writer = pool.acquire_writer().await.unwrap();
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='a'",
        )
        .fetch_optional(&mut writer.conn)
        .await
        .unwrap();
        assert!(exists.is_none());
    }
}
