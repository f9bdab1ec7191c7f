//! 运行状态：Run、预算、终止状态与对调用方可见的 RunResult
//!
//! 终止状态一旦写入即不可再改；预算在每次进入 Thinking 前检查。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::{ActionCall, ConversationState};
use crate::safety::RiskTier;

/// 运行 ID
pub type RunId = String;

pub fn new_run_id() -> RunId {
    format!("run_{}", uuid::Uuid::new_v4())
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    /// 挂起：等待确认或补充参数
    AwaitingConfirmation,
    Completed,
    Failed,
    AbortedBudget,
    AbortedStuck,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::AbortedBudget | Self::AbortedStuck
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AbortedBudget => "aborted_budget",
            Self::AbortedStuck => "aborted_stuck",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 超出的预算类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Iterations,
    WallClock,
    CostUnits,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Iterations => "max iterations reached",
            Self::WallClock => "wall-clock deadline passed",
            Self::CostUnits => "cost units exhausted",
        };
        f.write_str(s)
    }
}

/// 单次运行的资源预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub max_iterations: u32,
    /// 活跃执行时间上限（毫秒）；挂起等待人工的时间不计入
    pub max_wall_clock_ms: Option<u64>,
    pub max_cost_units: Option<u64>,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_wall_clock_ms: Some(300_000),
            max_cost_units: None,
        }
    }
}

impl Budgets {
    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_wall_clock(mut self, limit: Duration) -> Self {
        self.max_wall_clock_ms = Some(limit.as_millis() as u64);
        self
    }

    pub fn with_max_cost_units(mut self, units: u64) -> Self {
        self.max_cost_units = Some(units);
        self
    }

    pub fn unbounded_wall_clock(mut self) -> Self {
        self.max_wall_clock_ms = None;
        self
    }
}

/// 已执行或被拦截的有风险动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub call_id: String,
    pub action: String,
    pub tier: RiskTier,
    pub confirmed: bool,
}

/// 一次循环执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub status: RunStatus,
    pub iteration: u32,
    pub budgets: Budgets,
    pub cost_units: u64,
    /// 之前各执行段累计的活跃时间
    pub active_elapsed_ms: u64,
    #[serde(default)]
    pub risk_flags: Vec<RiskFlag>,
    #[serde(default)]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: RunId, budgets: Budgets) -> Self {
        Self {
            run_id,
            status: RunStatus::Active,
            iteration: 0,
            budgets,
            cost_units: 0,
            active_elapsed_ms: 0,
            risk_flags: Vec::new(),
            failure: None,
            created_at: Utc::now(),
        }
    }

    /// 状态迁移；终止状态不可离开
    pub fn transition(&mut self, to: RunStatus) -> Result<(), AgentError> {
        if self.status.is_terminal() {
            return Err(AgentError::InvalidRunState {
                run_id: self.run_id.clone(),
                actual: self.status,
                expected: "a non-terminal status",
            });
        }
        self.status = to;
        Ok(())
    }

    /// 本执行段开始前累计时间 + 本段已用时间
    pub fn elapsed(&self, segment: Duration) -> Duration {
        Duration::from_millis(self.active_elapsed_ms) + segment
    }

    pub fn deadline_passed(&self, segment: Duration) -> bool {
        self.budgets
            .max_wall_clock_ms
            .is_some_and(|limit| self.elapsed(segment) >= Duration::from_millis(limit))
    }

    /// 检查全部预算，返回首个超出的类型
    pub fn exceeded_budget(&self, segment: Duration) -> Option<BudgetKind> {
        if self.iteration >= self.budgets.max_iterations {
            return Some(BudgetKind::Iterations);
        }
        if self.deadline_passed(segment) {
            return Some(BudgetKind::WallClock);
        }
        if let Some(max) = self.budgets.max_cost_units {
            if self.cost_units >= max {
                return Some(BudgetKind::CostUnits);
            }
        }
        None
    }
}

/// 挂起时需要调用方提供的输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingInput {
    /// 高风险动作等待确认
    Confirmation { reason: String, actions: Vec<ActionCall> },
    /// 缺少必填参数
    Clarification {
        action: String,
        missing_fields: Vec<String>,
    },
}

impl PendingInput {
    pub fn prompt(&self) -> String {
        match self {
            Self::Confirmation { reason, .. } => format!("Confirmation required: {reason}"),
            Self::Clarification { action, missing_fields } => format!(
                "Action '{action}' needs more information: {}",
                missing_fields.join(", ")
            ),
        }
    }
}

/// 运行结果：状态 + 最终文本 / 待确认提示 / 结构化失败原因 三者之一
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub iterations: u32,
    pub final_text: Option<String>,
    pub pending: Option<PendingInput>,
    pub failure: Option<String>,
    pub cost_units: u64,
    pub conversation: ConversationState,
}

impl RunResult {
    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::AwaitingConfirmation
    }
}
