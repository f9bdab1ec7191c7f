//! Worker 池
//!
//! count 个 worker 共享一个队列与一个任务处理器：认领 → 执行 → 记录结果 → 继续。
//! 关闭信号触发后不再认领新任务，进行中的运行执行完毕再退出。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::core::{AgentError, ShutdownManager};
use crate::queue::{QueueError, TaskInput, TaskOutput, TaskQueue};

/// 任务处理器（由 Runtime 实现）
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, input: &TaskInput) -> Result<TaskOutput, AgentError>;
}

/// Worker 池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    /// 队列为空时的轮询间隔
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 2,
            poll_interval_ms: 200,
        }
    }
}

/// Worker 池
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn TaskQueue>, handler: Arc<dyn TaskHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// 启动全部 worker；返回的句柄在关闭后结束
    pub fn start(&self, shutdown: &ShutdownManager) -> Vec<JoinHandle<()>> {
        (0..self.config.count.max(1))
            .map(|i| {
                let worker = Worker {
                    name: format!("worker-{i}"),
                    queue: Arc::clone(&self.queue),
                    handler: Arc::clone(&self.handler),
                    poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Worker {
    name: String,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    poll_interval: Duration,
    shutdown: ShutdownManager,
}

impl Worker {
    async fn run(self) {
        tracing::info!(worker = %self.name, "worker started");
        let token = self.shutdown.token();
        while !token.is_cancelled() {
            let task = match self.queue.claim_next(&self.name).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
                // 其他 worker 抢先：直接回到队列
                Err(QueueError::ClaimConflict(_)) => continue,
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "claim failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            tracing::info!(worker = %self.name, task_id = %task.id, "task claimed");
            let recorded = match self.handler.handle(&task.input).await {
                Ok(output) => self.queue.complete(&task.id, &self.name, output).await,
                Err(e) => {
                    tracing::warn!(worker = %self.name, task_id = %task.id, error = %e, "task failed");
                    self.queue.fail(&task.id, &self.name, e.to_string()).await
                }
            };
            if let Err(e) = recorded {
                tracing::error!(worker = %self.name, task_id = %task.id, error = %e, "failed to record task result");
            }
        }
        tracing::info!(worker = %self.name, reason = ?self.shutdown.reason(), "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStatus, ShutdownReason};
    use crate::queue::{InMemoryTaskQueue, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, input: &TaskInput) -> Result<TaskOutput, AgentError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            match input {
                TaskInput::Start { text, .. } if text == "explode" => {
                    Err(AgentError::Persistence("disk gone".into()))
                }
                TaskInput::Start { text, .. } => Ok(TaskOutput {
                    run_id: format!("run_{text}"),
                    run_status: RunStatus::Completed,
                    final_text: Some(text.clone()),
                    pending_prompt: None,
                }),
                TaskInput::Resume { run_id, .. } => Err(AgentError::RunNotFound(run_id.clone())),
            }
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let mut ids = Vec::new();
        for text in ["a", "b", "explode", "c"] {
            ids.push(queue.submit(TaskInput::start(text)).await.unwrap());
        }
        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new(
            queue.clone(),
            handler.clone(),
            WorkerConfig {
                count: 3,
                poll_interval_ms: 5,
            },
        );
        let shutdown = ShutdownManager::new();
        let mut notifications = queue.subscribe();
        let handles = pool.start(&shutdown);

        for _ in 0..ids.len() {
            notifications.recv().await.unwrap();
        }
        assert_eq!(shutdown.drain(ShutdownReason::QueueDrained, handles).await, 0);

        assert_eq!(handler.count.load(Ordering::SeqCst), 4);
        let failed = queue.get(&ids[2]).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        let done = queue.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.output.unwrap().final_text.as_deref(), Some("a"));
    }
}
