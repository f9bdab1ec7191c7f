//! 运行时错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：能表达为「给模型的信息」的错误就地转成对话记录，
//! 其余错误以带类型的终止状态结束运行。

use thiserror::Error;

use crate::core::state::{BudgetKind, RunId, RunStatus};
use crate::llm::LlmError;
use crate::memory::{ConversationError, OutcomeErrorKind};
use crate::tools::{ToolError, ValidationError};

/// 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型调用失败（瞬时错误会先按退避重试）
    #[error("Model invocation failed: {0}")]
    ModelInvocation(#[from] LlmError),

    #[error("Tool validation failed: {0}")]
    ToolValidation(#[from] ValidationError),

    #[error("Tool execution failed: {0}")]
    ToolExecution(#[from] ToolError),

    /// 安全闸门要求确认或补充参数，运行挂起
    #[error("Blocked by safety gate: {0}")]
    SafetyBlocked(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(BudgetKind),

    #[error("Stuck: identical action batch repeated {0} times")]
    StuckDetected(usize),

    /// 只对该次恢复致命，不影响其他运行
    #[error("Checkpoint for run {run_id} is corrupted: {reason}")]
    CheckpointCorruption { run_id: RunId, reason: String },

    /// 抢占失败：任务已被其他 worker 认领
    #[error("Task {0} was claimed by another worker")]
    ClaimConflict(String),

    #[error("Conversation invariant violated: {0}")]
    Conversation(#[from] ConversationError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Run {run_id} is {actual}, expected {expected}")]
    InvalidRunState {
        run_id: RunId,
        actual: RunStatus,
        expected: &'static str,
    },

    #[error("Config error: {0}")]
    Config(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 转成错误结果写回对话，循环继续
    FeedBackToModel(OutcomeErrorKind),
    /// 挂起运行，等待人工输入
    Suspend,
    /// 重试模型调用
    RetryModel,
    /// 以指定终止状态结束运行
    Terminate(RunStatus),
    /// 放弃本次抢占，回到队列重新认领
    RetryClaim,
    /// 放弃本次恢复（不影响其他运行）
    AbortResume,
}
