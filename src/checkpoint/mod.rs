//! 检查点存储：按 run-id 保存不可变、带版本的运行快照
//!
//! - save 对调用方是原子的：读者看不到写了一半的快照
//! - save 是条件创建：版本不大于已存的最新版本时返回 VersionConflict，绝不覆盖。
//!   两个恢复者从同一快照出发时只有先写下一版本的一方能继续
//! - load 对没有快照的运行返回 None（不是错误），调用方从头开始
//! - 损坏的快照只让该运行的恢复失败，不影响其他运行

pub mod file;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::{AgentError, Run, RunId, RunStatus};
use crate::memory::ConversationState;

pub use file::FileCheckpointStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 一次运行在某个时刻的完整快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 同一运行内单调递增
    pub version: u64,
    pub run: Run,
    pub conversation: ConversationState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(version: u64, run: Run, conversation: ConversationState) -> Self {
        Self {
            version,
            run,
            conversation,
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    pub fn iteration(&self) -> u32 {
        self.run.iteration
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint for run {run_id} is corrupted: {reason}")]
    Corrupted { run_id: RunId, reason: String },
    #[error("checkpoint version {version} of run {run_id} is already taken")]
    VersionConflict { run_id: RunId, version: u64 },
    #[error("invalid run id: {0}")]
    InvalidRunId(String),
    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<CheckpointError> for AgentError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::Corrupted { run_id, reason } => {
                AgentError::CheckpointCorruption { run_id, reason }
            }
            CheckpointError::VersionConflict { run_id, .. } => AgentError::ClaimConflict(run_id),
            other => AgentError::Persistence(other.to_string()),
        }
    }
}

/// 检查点存储 trait
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 写入新版本；不大于已存最新版本时返回 VersionConflict
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// 最新快照；不存在时返回 None
    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 删除旧版本，只保留最近 keep_last 个（至少 1 个）；返回删除数量
    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError>;

    /// 有快照的全部运行
    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError>;
}

/// 内存检查点存储（测试与单进程使用）
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: RwLock<HashMap<RunId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某运行的全部已保存版本（升序）
    pub async fn versions(&self, run_id: &str) -> Vec<u64> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|v| v.iter().map(|c| c.version).collect())
            .unwrap_or_default()
    }

    /// 指定版本的快照
    pub async fn load_version(&self, run_id: &str, version: u64) -> Option<Checkpoint> {
        self.runs
            .read()
            .await
            .get(run_id)
            .and_then(|v| v.iter().find(|c| c.version == version).cloned())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut runs = self.runs.write().await;
        let versions = runs.entry(checkpoint.run_id().to_string()).or_default();
        if versions.last().is_some_and(|c| c.version >= checkpoint.version) {
            return Err(CheckpointError::VersionConflict {
                run_id: checkpoint.run_id().to_string(),
                version: checkpoint.version,
            });
        }
        versions.push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let mut runs = self.runs.write().await;
        let Some(versions) = runs.get_mut(run_id) else {
            return Ok(0);
        };
        let keep = keep_last.max(1);
        let excess = versions.len().saturating_sub(keep);
        versions.drain(..excess);
        Ok(excess)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
