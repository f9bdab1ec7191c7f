//! SQLite 检查点存储（需要 `async-sqlite` feature）
//!
//! 每个快照一行，(run_id, version) 为主键；单条条件 INSERT 即原子写入，
//! 已有同号或更新版本时不插入，视为版本已被其他写者占用。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::core::RunId;

impl From<sqlx::Error> for CheckpointError {
    fn from(e: sqlx::Error) -> Self {
        CheckpointError::Storage(e.to_string())
    }
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CheckpointError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                run_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, version)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let body = serde_json::to_string(checkpoint)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        let inserted = sqlx::query(
            "INSERT INTO checkpoints (run_id, version, status, iteration, body, created_at)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM checkpoints WHERE run_id = ? AND version >= ?)",
        )
        .bind(checkpoint.run_id())
        .bind(checkpoint.version as i64)
        .bind(checkpoint.status().as_str())
        .bind(checkpoint.iteration() as i64)
        .bind(body)
        .bind(checkpoint.created_at.to_rfc3339())
        .bind(checkpoint.run_id())
        .bind(checkpoint.version as i64)
        .execute(&self.pool)
        .await;
        let conflict = || CheckpointError::VersionConflict {
            run_id: checkpoint.run_id().to_string(),
            version: checkpoint.version,
        };
        match inserted {
            Ok(r) if r.rows_affected() == 0 => Err(conflict()),
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(conflict()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT body FROM checkpoints WHERE run_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.get("body");
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let result = sqlx::query(
            "DELETE FROM checkpoints WHERE run_id = ? AND version NOT IN (
                SELECT version FROM checkpoints WHERE run_id = ? ORDER BY version DESC LIMIT ?
            )",
        )
        .bind(run_id)
        .bind(run_id)
        .bind(keep_last.max(1) as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let rows = sqlx::query("SELECT DISTINCT run_id FROM checkpoints ORDER BY run_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("run_id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Budgets, Run};
    use crate::memory::ConversationState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_latest_and_prune() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::new(tmp.path().join("cp.db")).await.unwrap();
        for v in 1..=3 {
            let run = Run::new("r1".into(), Budgets::default());
            store
                .save(&Checkpoint::new(v, run, ConversationState::new("sys")))
                .await
                .unwrap();
        }
        assert_eq!(store.load("r1").await.unwrap().unwrap().version, 3);
        let dup = Checkpoint::new(3, Run::new("r1".into(), Budgets::default()), ConversationState::new("sys"));
        assert!(matches!(
            store.save(&dup).await,
            Err(CheckpointError::VersionConflict { version: 3, .. })
        ));
        assert_eq!(store.prune("r1", 1).await.unwrap(), 2);
        assert!(store.load("r2").await.unwrap().is_none());
        assert_eq!(store.list_runs().await.unwrap(), vec!["r1".to_string()]);
    }
}
