//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。对话记录转成 chat 消息：
//! Instruction + 动作目录 → system；动作请求 → assistant JSON；动作结果 → user 观察。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::protocol::{parse_model_output, render_catalogue, render_request};
use crate::llm::{LlmError, ModelClient, ModelReply, ModelRequest};
use crate::memory::Entry;

const FINAL_ANSWER_PROMPT: &str =
    "The resource budget for this task is exhausted. Answer now in plain text with what you have; do not request any action.";

/// OpenAI 兼容客户端
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用
    total_tokens: AtomicU64,
}

impl OpenAiModel {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            total_tokens: AtomicU64::new(0),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    fn to_openai_messages(
        &self,
        request: &ModelRequest<'_>,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(request.conversation.len() + 1);
        for entry in request.conversation.entries() {
            let message = match entry {
                Entry::Instruction { text } => {
                    let mut system = text.clone();
                    if !request.catalogue.is_empty() {
                        system.push_str("\n\n");
                        system.push_str(&render_catalogue(request.catalogue));
                    }
                    ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(system)
                            .build()?,
                    )
                }
                Entry::UserText { text } => user_message(text.clone())?,
                Entry::AssistantText { text } => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(text.clone())
                        .build()?,
                ),
                Entry::ActionRequest { calls } => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(render_request(calls))
                        .build()?,
                ),
                Entry::ActionOutcome(outcome) => {
                    let tool = request
                        .conversation
                        .call(&outcome.call_id)
                        .map(|c| c.name.as_str())
                        .unwrap_or("unknown");
                    user_message(format!("Observation from {tool}: {}", outcome.summary()))?
                }
            };
            messages.push(message);
        }
        if request.final_answer_only {
            messages.push(user_message(FINAL_ANSWER_PROMPT.to_string())?);
        }
        Ok(messages)
    }
}

fn user_message(content: String) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    Ok(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?,
    ))
}

fn map_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let lower = api.message.to_lowercase();
            if lower.contains("rate limit") || lower.contains("overloaded") {
                LlmError::RateLimited(api.message)
            } else {
                LlmError::Rejected(api.message)
            }
        }
        OpenAIError::InvalidArgument(msg) => LlmError::Rejected(msg),
        other => LlmError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ModelClient for OpenAiModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        let messages = self.to_openai_messages(&request).map_err(map_error)?;
        let req = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(map_error)?;

        let response = self.client.chat().create(req).await.map_err(map_error)?;

        let cost = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens + u.completion_tokens) as u64)
            .unwrap_or(0);
        self.total_tokens.fetch_add(cost, Ordering::Relaxed);

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        tracing::debug!(model = %self.model, tokens = cost, "model reply received");

        let content = if request.final_answer_only {
            crate::llm::ReplyContent::Final(content.trim().to_string())
        } else {
            parse_model_output(&content)
        };
        Ok(ModelReply {
            content,
            cost_units: cost,
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}
