//! 核心层：错误分类与恢复策略、运行状态、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{
    new_run_id, BudgetKind, Budgets, PendingInput, RiskFlag, Run, RunId, RunResult, RunStatus,
};
