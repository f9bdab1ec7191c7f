//! Worker 池关闭
//!
//! 所有 worker 共享一个 CancellationToken：触发后不再认领新任务，进行中的运行执行完毕。
//! 关闭原因只记录第一次（信号先到时，之后的 drain 不会覆盖它）。

use std::sync::{Arc, OnceLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// 提交的任务全部结束
    QueueDrained,
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
}

/// Worker 池的关闭信号
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// worker 在认领前检查、空闲时等待的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason.clone()).is_ok() {
            tracing::info!(?reason, "worker pool shutting down");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 触发关闭并等待全部 worker 退出（进行中的运行会先结束）；返回 panic 的 worker 数
    pub async fn drain(&self, reason: ShutdownReason, workers: Vec<JoinHandle<()>>) -> usize {
        self.shutdown(reason);
        let mut panicked = 0;
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "worker did not exit cleanly");
                panicked += 1;
            }
        }
        panicked
    }

    /// Ctrl+C 与 SIGTERM 触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminated);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        assert_eq!(manager.reason(), None);

        manager.shutdown(ShutdownReason::Interrupted);
        manager.shutdown(ShutdownReason::QueueDrained);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Interrupted));
    }

    #[tokio::test]
    async fn test_drain_waits_for_workers_and_counts_panics() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let polite = tokio::spawn(async move {
            token.cancelled().await;
            // 模拟进行中的运行收尾
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let broken: JoinHandle<()> = tokio::spawn(async { panic!("worker bug") });

        let panicked = manager
            .drain(ShutdownReason::QueueDrained, vec![polite, broken])
            .await;

        assert_eq!(panicked, 1);
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(manager.reason(), Some(ShutdownReason::QueueDrained));
    }
}
