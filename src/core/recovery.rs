//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction：工具失败与校验问题写回对话，
//! 确认需求挂起运行，模型不可达 / 预算耗尽 / 检查点损坏则以终止状态结束。

use crate::core::{AgentError, RecoveryAction, RunStatus};
use crate::llm::LlmError;
use crate::memory::OutcomeErrorKind;

/// 传播策略的唯一决策点
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::ModelInvocation(LlmError::RetriesExhausted { .. }) => {
                RecoveryAction::Terminate(RunStatus::Failed)
            }
            AgentError::ModelInvocation(e) if e.is_transient() => RecoveryAction::RetryModel,
            AgentError::ModelInvocation(_) => RecoveryAction::Terminate(RunStatus::Failed),
            AgentError::ToolValidation(_) => {
                RecoveryAction::FeedBackToModel(OutcomeErrorKind::Validation)
            }
            AgentError::ToolExecution(e) => RecoveryAction::FeedBackToModel(e.outcome_kind()),
            AgentError::SafetyBlocked(_) => RecoveryAction::Suspend,
            AgentError::BudgetExceeded(_) => RecoveryAction::Terminate(RunStatus::AbortedBudget),
            AgentError::StuckDetected(_) => RecoveryAction::Terminate(RunStatus::AbortedStuck),
            AgentError::CheckpointCorruption { .. } | AgentError::RunNotFound(_) => {
                RecoveryAction::AbortResume
            }
            AgentError::ClaimConflict(_) => RecoveryAction::RetryClaim,
            AgentError::InvalidRunState { .. } => RecoveryAction::AbortResume,
            AgentError::Conversation(_) | AgentError::Persistence(_) | AgentError::Config(_) => {
                RecoveryAction::Terminate(RunStatus::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BudgetKind;
    use crate::tools::ToolError;

    #[test]
    fn test_tool_failures_are_fed_back() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolExecution(ToolError::Failed("disk busy".into()));
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::FeedBackToModel(OutcomeErrorKind::Execution)
        );
        let err = AgentError::ToolExecution(ToolError::UnknownTool("fly".into()));
        assert_eq!(
            engine.handle(&err),
            RecoveryAction::FeedBackToModel(OutcomeErrorKind::UnknownTool)
        );
    }

    #[test]
    fn test_model_errors() {
        let engine = RecoveryEngine::new();
        let transient = AgentError::ModelInvocation(LlmError::Transport("reset".into()));
        assert_eq!(engine.handle(&transient), RecoveryAction::RetryModel);
        let exhausted = AgentError::ModelInvocation(LlmError::RetriesExhausted {
            attempts: 3,
            last: "reset".into(),
        });
        assert_eq!(
            engine.handle(&exhausted),
            RecoveryAction::Terminate(RunStatus::Failed)
        );
    }

    #[test]
    fn test_terminal_mappings() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&AgentError::BudgetExceeded(BudgetKind::Iterations)),
            RecoveryAction::Terminate(RunStatus::AbortedBudget)
        );
        assert_eq!(
            engine.handle(&AgentError::StuckDetected(3)),
            RecoveryAction::Terminate(RunStatus::AbortedStuck)
        );
        assert_eq!(
            engine.handle(&AgentError::ClaimConflict("t1".into())),
            RecoveryAction::RetryClaim
        );
        assert_eq!(
            engine.handle(&AgentError::SafetyBlocked("delete".into())),
            RecoveryAction::Suspend
        );
    }
}
