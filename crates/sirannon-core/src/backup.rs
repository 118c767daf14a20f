//! Point-in-time backups via `VACUUM INTO`.

use crate::error::{BackupError, Error};
use crate::pool::DbPool;
use std::path::{Path, PathBuf};
use tracing::info;

/// Produces `backup-<timestamp>.db` under `dest_dir` using `VACUUM INTO`,
/// where `<timestamp>` is an ISO-8601 instant with `:` and `.` replaced by
/// `-` so the filename is portable across filesystems.
#[tracing::instrument(skip(pool), fields(database = %pool.database()))]
pub async fn backup(pool: &DbPool, dest_dir: &Path, timestamp: &str) -> Result<PathBuf, Error> {
    if timestamp.contains(|c: char| c.is_control()) {
        return Err(BackupError::IllegalPath {
            path: timestamp.to_string(),
        }
        .into());
    }

    let file_name = format!(
        "backup-{}.db",
        timestamp.replace(':', "-").replace('.', "-")
    );
    let dest_path = dest_dir.join(&file_name);

    if dest_path.exists() {
        return Err(BackupError::AlreadyExists {
            path: dest_path.to_string_lossy().into_owned(),
        }
        .into());
    }

    std::fs::create_dir_all(dest_dir).map_err(|source| BackupError::CreateDir {
        path: dest_dir.to_string_lossy().into_owned(),
        source,
    })?;

    let dest_str = dest_path.to_string_lossy().into_owned();
    if dest_str.contains(|c: char| c.is_control()) {
        return Err(BackupError::IllegalPath { path: dest_str }.into());
    }

    let mut writer = pool.acquire_writer().await?;
    let sql = format!("VACUUM INTO '{}'", dest_str.replace('\'', "''"));
    let result = sqlx::raw_sql(&sql).execute(&mut writer.conn).await;

    if let Err(source) = result {
        // VACUUM INTO can leave a partial file behind on failure.
        let _ = std::fs::remove_file(&dest_path);
        return Err(BackupError::VacuumInto { source }.into());
    }

    info!(path = %dest_str, "backup written");
    Ok(dest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::executor::execute;
    use tempfile::tempdir;

    async fn open_pool(dir: &tempfile::TempDir, name: &str) -> DbPool {
        let path = dir.path().join(format!("{name}.db")).to_string_lossy().into_owned();
        DbPool::open(name, PoolOptions::new(path)).await.unwrap()
    }

    #[tokio::test]
    async fn backup_writes_a_queryable_copy() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "src").await;
        {
            let mut writer = pool.acquire_writer().await.unwrap();
            execute(&mut writer, "CREATE TABLE t(x INTEGER)", &[]).await.unwrap();
            execute(&mut writer, "INSERT INTO t(x) VALUES (1)", &[]).await.unwrap();
        }

        let dest_dir = tempdir().unwrap();
        let path = backup(&pool, dest_dir.path(), "2026-07-30T12:00:00.500Z").await.unwrap();
        assert!(path.exists());
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "backup-2026-07-30T12-00-00-500Z.db"
        );

        let copy_pool = DbPool::open(
            "copy",
            PoolOptions::new(path.to_string_lossy().into_owned()).read_pool_size(1),
        )
        .await
        .unwrap();
        let mut reader = copy_pool.acquire_reader().await.unwrap();
        let rows = crate::executor::query(&mut reader, "SELECT x FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn backup_refuses_to_overwrite_existing_destination() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "src2").await;
        let dest_dir = tempdir().unwrap();

        backup(&pool, dest_dir.path(), "2026-07-30T00-00-00").await.unwrap();
        let err = backup(&pool, dest_dir.path(), "2026-07-30T00-00-00").await.unwrap_err();
        assert!(matches!(err, Error::Backup(BackupError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn backup_rejects_control_characters_in_timestamp() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir, "src3").await;
        let dest_dir = tempdir().unwrap();
        let err = backup(&pool, dest_dir.path(), "evil\u{0}stamp").await.unwrap_err();
        assert!(matches!(err, Error::Backup(BackupError::IllegalPath { .. })));
    }
}
