//! 工具执行器
//!
//! 每次调用在独立任务上运行并施加超时：超时、panic、工具错误统一转成 AgentError，
//! 批内并行度由信号量限制；每次调用输出结构化审计日志（JSON）。
//! 超时后任务不会被强行终止，只是结果不再等待。
//! self_limited 的工具（delegate）等待到结束，由其自身预算收口。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::memory::ActionCall;
use crate::tools::{ToolError, ToolRegistry};

/// 工具执行器
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64, max_parallel: usize) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行单个调用；输出 JSON 审计日志
    pub async fn execute(&self, call: &ActionCall) -> Result<Value, AgentError> {
        let start = Instant::now();
        let result = self.run(call).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(AgentError::ToolExecution(ToolError::Timeout { .. })) => (false, "timeout"),
            Err(AgentError::ToolExecution(ToolError::Panicked { .. })) => (false, "panic"),
            Err(AgentError::ToolValidation(_)) => (false, "invalid"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.call_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    /// 并发执行一波相互独立的调用，结果与输入顺序一致
    pub async fn execute_wave(&self, calls: &[&ActionCall]) -> Vec<Result<Value, AgentError>> {
        join_all(calls.iter().map(|call| self.execute(call))).await
    }

    async fn run(&self, call: &ActionCall) -> Result<Value, AgentError> {
        let tool = self.registry.resolve(&call.name)?;
        self.registry.validate(tool.as_ref(), &call.args)?;
        let limit = tool.timeout().unwrap_or(self.timeout);

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ToolError::Failed("executor is shut down".into()))?;
        let args = call.args.clone();
        let task_tool = Arc::clone(&tool);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            task_tool.execute(args).await
        });

        let joined = if tool.self_limited() {
            Ok(handle.await)
        } else {
            timeout(limit, handle).await
        };
        match joined {
            Ok(Ok(result)) => result.map_err(AgentError::from),
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "task cancelled".to_string()
                };
                Err(ToolError::Panicked {
                    tool: call.name.clone(),
                    message,
                }
                .into())
            }
            Err(_) => Err(ToolError::Timeout {
                tool: call.name.clone(),
                secs: limit.as_secs(),
            }
            .into()),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }
        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("late"))
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
            panic!("boom")
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        registry.register(PanickyTool);
        ToolExecutor::new(Arc::new(registry), 5, 2)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_typed() {
        let err = executor()
            .execute(&ActionCall::new("c1", "fly", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolExecution(ToolError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn test_timeout_and_panic_are_contained() {
        let exec = executor();
        let err = exec
            .execute(&ActionCall::new("c1", "slow", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolExecution(ToolError::Timeout { .. })));

        let err = exec
            .execute(&ActionCall::new("c2", "panicky", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::ToolExecution(ToolError::Panicked { ref message, .. }) if message == "boom"
        ));
    }

    #[tokio::test]
    async fn test_wave_preserves_order() {
        let exec = executor();
        let a = ActionCall::new("a", "echo", json!({"text": "first"}));
        let b = ActionCall::new("b", "echo", json!({"text": "second"}));
        let results = exec.execute_wave(&[&a, &b]).await;
        assert_eq!(results[0].as_ref().unwrap(), &json!("first"));
        assert_eq!(results[1].as_ref().unwrap(), &json!("second"));
    }
}
