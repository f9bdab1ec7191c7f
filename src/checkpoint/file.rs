//! 文件检查点存储：`<dir>/<run_id>/<version>.json`
//!
//! 先写临时文件再以硬链接发布：读者只会看到完整的快照，
//! 目标文件已存在时链接失败（不覆盖），由此实现跨进程的版本抢占。

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::core::RunId;

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CheckpointError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.dir.join(run_id))
    }

    /// 目录下的全部版本号（升序）
    async fn versions(&self, run_dir: &Path) -> Result<Vec<u64>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(run_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(v) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn version_path(run_dir: &Path, version: u64) -> PathBuf {
        run_dir.join(format!("{version:020}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let run_dir = self.run_dir(checkpoint.run_id())?;
        tokio::fs::create_dir_all(&run_dir).await?;
        // 已裁剪的旧版本号也不能复用
        if self
            .versions(&run_dir)
            .await?
            .last()
            .is_some_and(|&latest| latest > checkpoint.version)
        {
            return Err(CheckpointError::VersionConflict {
                run_id: checkpoint.run_id().to_string(),
                version: checkpoint.version,
            });
        }
        let body = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        let target = Self::version_path(&run_dir, checkpoint.version);
        let tmp = run_dir.join(format!(".{}.{}.tmp", checkpoint.version, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &body).await?;
        let published = tokio::fs::hard_link(&tmp, &target).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CheckpointError::VersionConflict {
                    run_id: checkpoint.run_id().to_string(),
                    version: checkpoint.version,
                });
            }
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(run_id = %checkpoint.run_id(), version = checkpoint.version, "checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let run_dir = self.run_dir(run_id)?;
        let Some(&latest) = self.versions(&run_dir).await?.last() else {
            return Ok(None);
        };
        let raw = tokio::fs::read(Self::version_path(&run_dir, latest)).await?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?;
        if checkpoint.run_id() != run_id {
            return Err(CheckpointError::Corrupted {
                run_id: run_id.to_string(),
                reason: format!("snapshot belongs to run {}", checkpoint.run_id()),
            });
        }
        Ok(Some(checkpoint))
    }

    async fn prune(&self, run_id: &str, keep_last: usize) -> Result<usize, CheckpointError> {
        let run_dir = self.run_dir(run_id)?;
        let versions = self.versions(&run_dir).await?;
        let excess = versions.len().saturating_sub(keep_last.max(1));
        for v in &versions[..excess] {
            tokio::fs::remove_file(Self::version_path(&run_dir, *v)).await?;
        }
        Ok(excess)
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Budgets, Run};
    use crate::memory::{ConversationState, Entry};
    use tempfile::TempDir;

    fn checkpoint(run_id: &str, version: u64) -> Checkpoint {
        let mut conversation = ConversationState::new("sys");
        conversation.append(Entry::user(format!("turn {version}"))).unwrap();
        Checkpoint::new(version, Run::new(run_id.to_string(), Budgets::default()), conversation)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        assert!(store.load("run_a").await.unwrap().is_none());
        store.save(&checkpoint("run_a", 1)).await.unwrap();
        store.save(&checkpoint("run_a", 2)).await.unwrap();
        let loaded = store.load("run_a").await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint_like(&loaded, "run_a", 2));
        assert_eq!(store.list_runs().await.unwrap(), vec!["run_a"]);
    }

    fn checkpoint_like(loaded: &Checkpoint, run_id: &str, version: u64) -> Checkpoint {
        // created_at 与 Run.created_at 由保存时决定，比较其余字段
        let mut expected = checkpoint(run_id, version);
        expected.created_at = loaded.created_at;
        expected.run.created_at = loaded.run.created_at;
        expected
    }

    #[tokio::test]
    async fn test_corruption_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        store.save(&checkpoint("good", 1)).await.unwrap();
        store.save(&checkpoint("bad", 1)).await.unwrap();
        tokio::fs::write(tmp.path().join("bad").join(format!("{:020}.json", 1)), b"{\"version\":")
            .await
            .unwrap();
        assert!(matches!(
            store.load("bad").await,
            Err(CheckpointError::Corrupted { .. })
        ));
        assert!(store.load("good").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_writer_of_a_version_loses() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        store.save(&checkpoint("run_a", 1)).await.unwrap();
        let err = store.save(&checkpoint("run_a", 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::VersionConflict { version: 1, .. }));

        // 不留临时文件
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(tmp.path().join("run_a")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![format!("{:020}.json", 1)]);

        store.save(&checkpoint("run_a", 3)).await.unwrap();
        store.prune("run_a", 1).await.unwrap();
        assert!(matches!(
            store.save(&checkpoint("run_a", 2)).await,
            Err(CheckpointError::VersionConflict { version: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_prune_and_invalid_ids() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(tmp.path());
        for v in 1..=5 {
            store.save(&checkpoint("r", v)).await.unwrap();
        }
        assert_eq!(store.prune("r", 2).await.unwrap(), 3);
        assert_eq!(store.load("r").await.unwrap().unwrap().version, 5);
        assert!(matches!(
            store.load("../etc").await,
            Err(CheckpointError::InvalidRunId(_))
        ));
    }
}
