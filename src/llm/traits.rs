//! 模型客户端抽象
//!
//! 输入：完整对话 + 当前允许的动作目录；输出：最终文本或一批动作请求（每个带唯一 call-id）。
//! 所有后端（OpenAI 兼容 / Scripted / Mock）实现 ModelClient。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{ActionCall, ConversationState};
use crate::tools::ActionSpec;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid model reply: {0}")]
    InvalidReply(String),
    /// 重试耗尽（由 RetryingModel 产生）
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl LlmError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_) | Self::Timeout(_))
    }
}

/// 单次模型调用的输入
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub conversation: &'a ConversationState,
    pub catalogue: &'a [ActionSpec],
    /// 预算耗尽后的收尾调用：只允许纯文本回答
    pub final_answer_only: bool,
}

impl<'a> ModelRequest<'a> {
    pub fn new(conversation: &'a ConversationState, catalogue: &'a [ActionSpec]) -> Self {
        Self {
            conversation,
            catalogue,
            final_answer_only: false,
        }
    }

    pub fn final_answer(conversation: &'a ConversationState) -> Self {
        Self {
            conversation,
            catalogue: &[],
            final_answer_only: true,
        }
    }
}

/// 模型回复内容
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyContent {
    Final(String),
    Actions(Vec<ActionCall>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub content: ReplyContent,
    /// 本次调用消耗的资源单位（如 token 数）
    pub cost_units: u64,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: ReplyContent::Final(text.into()),
            cost_units: 0,
        }
    }

    pub fn actions(calls: Vec<ActionCall>) -> Self {
        Self {
            content: ReplyContent::Actions(calls),
            cost_units: 0,
        }
    }

    pub fn with_cost(mut self, units: u64) -> Self {
        self.cost_units = units;
        self
    }
}

/// 模型客户端 trait
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError>;

    /// 后端名称（用于日志）
    fn name(&self) -> &str {
        "model"
    }
}
