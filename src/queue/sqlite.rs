//! SQLite 任务队列（需要 `async-sqlite` feature）
//!
//! 认领使用单条条件 UPDATE（`WHERE status = 'pending'`）并检查 rows_affected，
//! 多进程共享同一数据库时也只有一个 worker 能拿到任务。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::broadcast;

use crate::queue::{
    QueueError, TaskId, TaskInput, TaskNotification, TaskOutput, TaskQueue, TaskRecord, TaskStatus,
    NOTIFICATION_CAPACITY,
};

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}

/// 每次 claim_next 尝试的候选数
const CLAIM_CANDIDATES: i64 = 8;

pub struct SqliteTaskQueue {
    pool: SqlitePool,
    notification_tx: broadcast::Sender<TaskNotification>,
}

impl SqliteTaskQueue {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, QueueError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                input TEXT NOT NULL,
                status TEXT NOT NULL,
                owner TEXT,
                output TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                claimed_at INTEGER,
                finished_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at)")
            .execute(&pool)
            .await?;

        let (notification_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            pool,
            notification_tx,
        })
    }

    fn row_to_record(row: &SqliteRow) -> Result<TaskRecord, QueueError> {
        let id: String = row.get("id");
        let corrupt = |what: &str, e: String| QueueError::Storage(format!("task {id}: bad {what}: {e}"));
        let input: TaskInput = serde_json::from_str(&row.get::<String, _>("input"))
            .map_err(|e| corrupt("input", e.to_string()))?;
        let status_raw: String = row.get("status");
        let status = TaskStatus::parse(&status_raw)
            .ok_or_else(|| corrupt("status", status_raw.clone()))?;
        let output: Option<TaskOutput> = match row.get::<Option<String>, _>("output") {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| corrupt("output", e.to_string()))?),
            None => None,
        };
        Ok(TaskRecord {
            id: id.clone(),
            input,
            status,
            owner: row.get("owner"),
            output,
            error: row.get("error"),
            created_at: row.get("created_at"),
            claimed_at: row.get("claimed_at"),
            finished_at: row.get("finished_at"),
        })
    }

    async fn finish(
        &self,
        task_id: &str,
        owner: &str,
        status: TaskStatus,
        output: Option<TaskOutput>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let output_json = output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, output = ?, error = ?, finished_at = ?
             WHERE id = ? AND owner = ? AND status = 'claimed'",
        )
        .bind(status.as_str())
        .bind(output_json)
        .bind(&error)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(task_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self
                .get(task_id)
                .await?
                .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
            return Err(QueueError::NotOwned {
                task_id: task_id.to_string(),
                owner: owner.to_string(),
                status: current.status,
            });
        }

        let _ = self.notification_tx.send(TaskNotification {
            task_id: task_id.to_string(),
            status,
            output,
            error,
        });
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn submit(&self, input: TaskInput) -> Result<TaskId, QueueError> {
        let task = TaskRecord::new(input);
        let input_json =
            serde_json::to_string(&task.input).map_err(|e| QueueError::Storage(e.to_string()))?;
        sqlx::query("INSERT INTO tasks (id, input, status, created_at) VALUES (?, ?, ?, ?)")
            .bind(&task.id)
            .bind(input_json)
            .bind(task.status.as_str())
            .bind(task.created_at)
            .execute(&self.pool)
            .await?;
        Ok(task.id)
    }

    async fn claim(&self, task_id: &str, owner: &str) -> Result<TaskRecord, QueueError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'claimed', owner = ?, claimed_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(owner)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        let record = self
            .get(task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if result.rows_affected() == 1 {
            Ok(record)
        } else {
            Err(QueueError::ClaimConflict(task_id.to_string()))
        }
    }

    async fn claim_next(&self, owner: &str) -> Result<Option<TaskRecord>, QueueError> {
        loop {
            let candidates: Vec<String> = sqlx::query(
                "SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at, rowid LIMIT ?",
            )
            .bind(CLAIM_CANDIDATES)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| r.get("id"))
            .collect();
            if candidates.is_empty() {
                return Ok(None);
            }
            for id in &candidates {
                match self.claim(id, owner).await {
                    Ok(record) => return Ok(Some(record)),
                    Err(QueueError::ClaimConflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn complete(&self, task_id: &str, owner: &str, output: TaskOutput) -> Result<(), QueueError> {
        self.finish(task_id, owner, TaskStatus::Done, Some(output), None)
            .await
    }

    async fn fail(&self, task_id: &str, owner: &str, error: String) -> Result<(), QueueError> {
        self.finish(task_id, owner, TaskStatus::Error, None, Some(error))
            .await
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, QueueError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notification_tx.subscribe()
    }
}
