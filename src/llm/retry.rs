//! 模型调用重试：有界指数退避，只重试瞬时错误

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{LlmError, ModelClient, ModelReply, ModelRequest};

/// 重试配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待时间：base * 2^(attempt-1)，不超过 max
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// 带重试的模型客户端装饰器
pub struct RetryingModel {
    inner: Arc<dyn ModelClient>,
    config: RetryConfig,
}

impl RetryingModel {
    pub fn new(inner: Arc<dyn ModelClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl ModelClient for RetryingModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        let max = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.complete(request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max => {
                    tracing::error!(model = self.inner.name(), attempts = attempt, error = %e, "model retries exhausted");
                    return Err(LlmError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.config.delay_for(attempt);
                    tracing::warn!(
                        model = self.inner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::memory::ConversationState;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(10), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let model = Arc::new(ScriptedModel::new().then_final("ok").with_transient_failures(2));
        let retrying = RetryingModel::new(model.clone(), fast());
        let state = ConversationState::new("sys");
        let reply = retrying.complete(ModelRequest::new(&state, &[])).await.unwrap();
        assert_eq!(reply, ModelReply::text("ok"));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let model = Arc::new(ScriptedModel::failing(LlmError::Transport("connection reset".into())));
        let retrying = RetryingModel::new(model.clone(), fast());
        let state = ConversationState::new("sys");
        let err = retrying.complete(ModelRequest::new(&state, &[])).await.unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let model = Arc::new(ScriptedModel::failing(LlmError::Rejected("bad key".into())));
        let retrying = RetryingModel::new(model.clone(), fast());
        let state = ConversationState::new("sys");
        let err = retrying.complete(ModelRequest::new(&state, &[])).await.unwrap_err();
        assert_eq!(err, LlmError::Rejected("bad key".into()));
        assert_eq!(model.call_count(), 1);
    }
}
