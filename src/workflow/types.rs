//! 工作流类型定义
//!
//! 计划（Plan）、步骤（PlanStep）、步骤状态与工作流错误

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PlanId = String;
pub type StepId = String;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖满足
    #[default]
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 重试耗尽后失败
    Failed,
    /// 依赖失败，不再执行
    Skipped,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// 计划整体状态（由步骤状态推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// 已执行次数（含重试）
    #[serde(default)]
    pub attempts: u32,
}

impl PlanStep {
    pub fn new(id: impl Into<StepId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
        }
    }
}

/// 计划：任务与按声明顺序排列的步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub task: String,
    pub steps: Vec<PlanStep>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn status(&self) -> PlanStatus {
        if self.steps.iter().all(|s| s.status == StepStatus::Completed) {
            return PlanStatus::Completed;
        }
        if self.steps.iter().all(|s| s.status.is_finished()) {
            return PlanStatus::Failed;
        }
        if self.steps.iter().all(|s| s.status == StepStatus::Pending) {
            PlanStatus::Pending
        } else {
            PlanStatus::Running
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

/// 工作流错误类型
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("plan not found: {0}")]
    PlanNotFound(PlanId),
    #[error("step not found: {0}")]
    StepNotFound(StepId),
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("cyclic dependency detected")]
    CyclicDependency,
    #[error("invalid workflow configuration: {0}")]
    InvalidConfiguration(String),
    #[error("plan storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for WorkflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_status_is_derived_from_steps() {
        let mut plan = Plan {
            id: "p".into(),
            task: "t".into(),
            steps: vec![PlanStep::new("a", "A"), PlanStep::new("b", "B")],
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(plan.status(), PlanStatus::Pending);
        plan.steps[0].status = StepStatus::Completed;
        assert_eq!(plan.status(), PlanStatus::Running);
        plan.steps[1].status = StepStatus::Skipped;
        assert_eq!(plan.status(), PlanStatus::Failed);
        plan.steps[1].status = StepStatus::Completed;
        assert_eq!(plan.status(), PlanStatus::Completed);
    }
}
