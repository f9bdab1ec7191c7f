//! Saga：按顺序执行的多步外部操作，失败时逆序补偿
//!
//! - 步骤严格按顺序执行；第一个失败步骤之前已成功的步骤按逆序补偿
//! - 失败步骤本身不补偿（它没有完成）
//! - 补偿失败只记录日志，不阻止更早步骤的补偿；最终结果仍报告原始失败

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// Saga 中的一个步骤
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> Result<(), String>;

    /// 撤销 execute 已产生的效果
    async fn compensate(&self) -> Result<(), String>;
}

/// 补偿失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
}

/// Saga 结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SagaOutcome {
    Completed,
    FailedAtStep {
        /// 失败步骤的下标（从 0 开始）
        index: usize,
        step: String,
        error: String,
        /// 实际执行了补偿的步骤（按执行顺序，即逆序）
        compensated: Vec<String>,
        compensation_failures: Vec<CompensationFailure>,
    },
}

impl SagaOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Saga：有序步骤列表
#[derive(Default)]
pub struct Saga {
    steps: Vec<Arc<dyn SagaStep>>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn step_arc(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(&self) -> SagaOutcome {
        for (index, step) in self.steps.iter().enumerate() {
            let Err(error) = step.execute().await else {
                tracing::debug!(step = %step.name(), "saga step completed");
                continue;
            };
            tracing::warn!(step = %step.name(), index, %error, "saga step failed, compensating");

            let mut compensated = Vec::with_capacity(index);
            let mut compensation_failures = Vec::new();
            for done in self.steps[..index].iter().rev() {
                match done.compensate().await {
                    Ok(()) => compensated.push(done.name().to_string()),
                    Err(e) => {
                        tracing::error!(step = %done.name(), error = %e, "compensation failed");
                        compensation_failures.push(CompensationFailure {
                            step: done.name().to_string(),
                            error: e,
                        });
                    }
                }
            }
            return SagaOutcome::FailedAtStep {
                index,
                step: step.name().to_string(),
                error,
                compensated,
                compensation_failures,
            };
        }
        SagaOutcome::Completed
    }
}
