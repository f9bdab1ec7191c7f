//! 记忆层：单次运行的对话状态（只追加日志）与压缩协作者

pub mod compaction;
pub mod conversation;

pub use compaction::{Compactor, TokenEstimator, TruncatingCompactor};
pub use conversation::{
    canonical_args, ActionCall, ActionOutcome, CallId, ConversationError, ConversationState, Entry,
    OutcomeError, OutcomeErrorKind, OutcomeResult,
};
