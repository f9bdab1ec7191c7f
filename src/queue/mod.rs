//! 任务队列与 worker 池
//!
//! 核心功能：
//! - 任务记录按 task-id 存储，状态单调推进 pending → claimed → done / error
//! - 认领是原子的条件更新：同一任务并发认领只有一个成功，其余得到 ClaimConflict
//! - 终态通知（broadcast），供调用方等待结果

pub mod worker;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::core::{AgentError, RunId, RunStatus};

pub use worker::{TaskHandler, WorkerConfig, WorkerPool};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteTaskQueue;

/// 任务 ID
pub type TaskId = String;

/// 通知通道容量
const NOTIFICATION_CAPACITY: usize = 256;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待认领
    Pending,
    /// 已被某个 worker 认领
    Claimed,
    /// 已完成（运行本身可能是挂起/中止，见 TaskOutput）
    Done,
    /// 执行出错
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// 任务输入：新运行，或对已有运行的恢复（人工确认 / 崩溃恢复）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    Start {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
    Resume {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
    },
}

impl TaskInput {
    pub fn start(text: impl Into<String>) -> Self {
        Self::Start {
            text: text.into(),
            instruction: None,
        }
    }

    pub fn resume(run_id: impl Into<RunId>, reply: Option<&str>) -> Self {
        Self::Resume {
            run_id: run_id.into(),
            reply: reply.map(str::to_string),
        }
    }
}

/// 任务执行产物
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub run_id: RunId,
    pub run_status: RunStatus,
    #[serde(default)]
    pub final_text: Option<String>,
    /// 挂起时给人看的提示
    #[serde(default)]
    pub pending_prompt: Option<String>,
}

/// 任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub input: TaskInput,
    pub status: TaskStatus,
    /// 只能通过原子认领设置
    pub owner: Option<String>,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub claimed_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TaskRecord {
    pub fn new(input: TaskInput) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            input,
            status: TaskStatus::Pending,
            owner: None,
            output: None,
            error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            claimed_at: None,
            finished_at: None,
        }
    }
}

/// 任务终态通知
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task {0} was claimed by another worker")]
    ClaimConflict(TaskId),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {task_id} is {status:?} and not owned by {owner}")]
    NotOwned {
        task_id: TaskId,
        owner: String,
        status: TaskStatus,
    },
    #[error("task queue storage error: {0}")]
    Storage(String),
}

impl From<QueueError> for AgentError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::ClaimConflict(id) => AgentError::ClaimConflict(id),
            other => AgentError::Persistence(other.to_string()),
        }
    }
}

/// 任务队列 trait
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, input: TaskInput) -> Result<TaskId, QueueError>;

    /// 原子认领指定任务；已被认领返回 ClaimConflict
    async fn claim(&self, task_id: &str, owner: &str) -> Result<TaskRecord, QueueError>;

    /// 认领最早的待处理任务；没有则返回 None
    async fn claim_next(&self, owner: &str) -> Result<Option<TaskRecord>, QueueError>;

    async fn complete(&self, task_id: &str, owner: &str, output: TaskOutput) -> Result<(), QueueError>;

    async fn fail(&self, task_id: &str, owner: &str, error: String) -> Result<(), QueueError>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, QueueError>;

    fn subscribe(&self) -> broadcast::Receiver<TaskNotification>;
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    /// 提交顺序
    order: Vec<TaskId>,
}

/// 内存任务队列：所有状态变更在同一把锁内完成（compare-and-set）
pub struct InMemoryTaskQueue {
    inner: Mutex<Inner>,
    notification_tx: broadcast::Sender<TaskNotification>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        let (notification_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            notification_tx,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn finish(
        &self,
        task_id: &str,
        owner: &str,
        status: TaskStatus,
        output: Option<TaskOutput>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Claimed || task.owner.as_deref() != Some(owner) {
            return Err(QueueError::NotOwned {
                task_id: task_id.to_string(),
                owner: owner.to_string(),
                status: task.status,
            });
        }
        task.status = status;
        task.output = output.clone();
        task.error = error.clone();
        task.finished_at = Some(chrono::Utc::now().timestamp_millis());
        drop(inner);

        let _ = self.notification_tx.send(TaskNotification {
            task_id: task_id.to_string(),
            status,
            output,
            error,
        });
        Ok(())
    }
}

fn claim_locked(task: &mut TaskRecord, owner: &str) -> Result<TaskRecord, QueueError> {
    if task.status != TaskStatus::Pending {
        return Err(QueueError::ClaimConflict(task.id.clone()));
    }
    task.status = TaskStatus::Claimed;
    task.owner = Some(owner.to_string());
    task.claimed_at = Some(chrono::Utc::now().timestamp_millis());
    Ok(task.clone())
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn submit(&self, input: TaskInput) -> Result<TaskId, QueueError> {
        let task = TaskRecord::new(input);
        let task_id = task.id.clone();
        let mut inner = self.inner.lock().await;
        inner.order.push(task_id.clone());
        inner.tasks.insert(task_id.clone(), task);
        tracing::debug!(%task_id, "task submitted");
        Ok(task_id)
    }

    async fn claim(&self, task_id: &str, owner: &str) -> Result<TaskRecord, QueueError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        claim_locked(task, owner)
    }

    async fn claim_next(&self, owner: &str) -> Result<Option<TaskRecord>, QueueError> {
        let mut guard = self.inner.lock().await;
        let Inner { tasks, order } = &mut *guard;
        for id in order.iter() {
            if let Some(task) = tasks.get_mut(id) {
                if task.status == TaskStatus::Pending {
                    return claim_locked(task, owner).map(Some);
                }
            }
        }
        Ok(None)
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
        Ok(self.inner.lock().await.tasks.get(task_id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notification_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn output(run_id: &str) -> TaskOutput {
        TaskOutput {
            run_id: run_id.into(),
            run_status: RunStatus::Completed,
            final_text: Some("done".into()),
            pending_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_task_queue_basic() {
        let queue = InMemoryTaskQueue::new();
        let mut notifications = queue.subscribe();
        let task_id = queue.submit(TaskInput::start("Write a report")).await.unwrap();

        let task = queue.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let claimed = queue.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, task_id);
        assert_eq!(claimed.owner.as_deref(), Some("w1"));
        assert!(queue.claim_next("w2").await.unwrap().is_none());

        queue.complete(&task_id, "w1", output("run_1")).await.unwrap();
        let task = queue.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let n = notifications.recv().await.unwrap();
        assert_eq!(n.task_id, task_id);
        assert_eq!(n.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let task_id = queue.submit(TaskInput::start("x")).await.unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let task_id = task_id.clone();
                tokio::spawn(async move { queue.claim(&task_id, &format!("w{i}")).await })
            })
            .collect();
        let mut wins = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(QueueError::ClaimConflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((wins, conflicts), (1, 7));
    }

    #[tokio::test]
    async fn test_only_owner_may_finish() {
        let queue = InMemoryTaskQueue::new();
        let task_id = queue.submit(TaskInput::resume("run_1", Some("yes"))).await.unwrap();
        assert!(matches!(
            queue.fail(&task_id, "w1", "boom".into()).await,
            Err(QueueError::NotOwned { .. })
        ));
        queue.claim(&task_id, "w1").await.unwrap();
        assert!(queue.fail(&task_id, "w2", "boom".into()).await.is_err());
        queue.fail(&task_id, "w1", "boom".into()).await.unwrap();
        let task = queue.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_claim_conflict_maps_to_agent_error() {
        let err: AgentError = QueueError::ClaimConflict("t".into()).into();
        assert!(matches!(err, AgentError::ClaimConflict(_)));
    }
}
