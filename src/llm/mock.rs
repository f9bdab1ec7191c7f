//! 测试与演示用模型（无需 API）
//!
//! - ScriptedModel：按对话中已有的模型回合数选择回复，恢复后的运行与未中断的运行看到相同回复
//! - MockModel：把用户任务交给 echo 工具，再把观察结果作为最终回复

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{LlmError, ModelClient, ModelReply, ModelRequest, ReplyContent};
use crate::memory::{ActionCall, ConversationState, Entry};

#[derive(Debug, Clone)]
enum ScriptStep {
    Final(String),
    Actions(Vec<(String, Value)>),
}

/// 一次被记录的模型请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub turn: usize,
    pub conversation: ConversationState,
    pub catalogue: Vec<String>,
    pub final_answer_only: bool,
}

/// 确定性脚本模型
#[derive(Debug, Default)]
pub struct ScriptedModel {
    steps: Vec<ScriptStep>,
    repeat_last: bool,
    always_fail: Option<LlmError>,
    transient_failures: AtomicU32,
    forced_answer: Option<String>,
    cost_per_turn: u64,
    requests: Mutex<Vec<RecordedRequest>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次都请求同一个动作
    pub fn repeating(name: &str, args: Value) -> Self {
        let mut model = Self::new().then_action(name, args);
        model.repeat_last = true;
        model
    }

    /// 每次调用都失败
    pub fn failing(err: LlmError) -> Self {
        Self {
            always_fail: Some(err),
            ..Self::default()
        }
    }

    pub fn then_final(mut self, text: &str) -> Self {
        self.steps.push(ScriptStep::Final(text.to_string()));
        self
    }

    pub fn then_action(self, name: &str, args: Value) -> Self {
        self.then_actions(vec![(name, args)])
    }

    /// 同一回合请求多个动作
    pub fn then_actions(mut self, calls: Vec<(&str, Value)>) -> Self {
        self.steps.push(ScriptStep::Actions(
            calls.into_iter().map(|(n, a)| (n.to_string(), a)).collect(),
        ));
        self
    }

    /// 前 n 次调用返回瞬时错误
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// 预算耗尽收尾调用的回答
    pub fn with_forced_answer(mut self, text: &str) -> Self {
        self.forced_answer = Some(text.to_string());
        self
    }

    pub fn with_cost_per_turn(mut self, units: u64) -> Self {
        self.cost_per_turn = units;
        self
    }

    /// 累计调用次数（含失败）
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }
        if self.take_transient_failure() {
            return Err(LlmError::Transport("simulated outage".into()));
        }

        let turn = request.conversation.model_turns();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                turn,
                conversation: request.conversation.clone(),
                catalogue: request.catalogue.iter().map(|s| s.name.clone()).collect(),
                final_answer_only: request.final_answer_only,
            });
        }

        if request.final_answer_only {
            let text = self
                .forced_answer
                .clone()
                .unwrap_or_else(|| "Budget exhausted before the task was finished.".to_string());
            return Ok(ModelReply::text(text).with_cost(self.cost_per_turn));
        }

        let step = match self.steps.get(turn) {
            Some(step) => step,
            None if self.repeat_last && !self.steps.is_empty() => &self.steps[self.steps.len() - 1],
            None => {
                return Err(LlmError::InvalidReply(format!(
                    "script exhausted at turn {turn}"
                )))
            }
        };
        let content = match step {
            ScriptStep::Final(text) => ReplyContent::Final(text.clone()),
            ScriptStep::Actions(calls) => ReplyContent::Actions(
                calls
                    .iter()
                    .enumerate()
                    .map(|(i, (name, args))| {
                        ActionCall::new(format!("call_{turn}_{i}"), name.clone(), args.clone())
                    })
                    .collect(),
            ),
        };
        Ok(ModelReply {
            content,
            cost_units: self.cost_per_turn,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 演示客户端：先调用 echo，再返回观察结果
#[derive(Debug, Default)]
pub struct MockModel;

#[async_trait]
impl ModelClient for MockModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
        let entries = request.conversation.entries();
        if let Some(Entry::ActionOutcome(outcome)) = entries.last() {
            return Ok(ModelReply::text(outcome.summary()));
        }
        if request.final_answer_only || !request.catalogue.iter().any(|s| s.name == "echo") {
            return Ok(ModelReply::text("Nothing to do."));
        }
        let task = request
            .conversation
            .last_user_text()
            .map(|(_, t)| t)
            .unwrap_or("(no input)");
        let turn = request.conversation.model_turns();
        Ok(ModelReply::actions(vec![ActionCall::new(
            format!("call_{turn}_0"),
            "echo",
            json!({ "text": format!("Echo from Mock: {task}") }),
        )]))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ActionOutcome;

    #[tokio::test]
    async fn test_scripted_reply_follows_model_turns() {
        let model = ScriptedModel::new()
            .then_action("check_disk", json!({}))
            .then_final("done");
        let mut state = ConversationState::new("sys");
        state.append(Entry::user("disk is full")).unwrap();

        let reply = model.complete(ModelRequest::new(&state, &[])).await.unwrap();
        let ReplyContent::Actions(calls) = reply.content else {
            panic!("expected actions");
        };
        assert_eq!(calls[0].call_id, "call_0_0");
        state.append(Entry::ActionRequest { calls }).unwrap();
        state
            .append(Entry::ActionOutcome(ActionOutcome::success("call_0_0", json!("95%"))))
            .unwrap();

        let reply = model.complete(ModelRequest::new(&state, &[])).await.unwrap();
        assert_eq!(reply.content, ReplyContent::Final("done".into()));
        assert_eq!(model.requests().len(), 2);
        assert_eq!(model.requests()[1].turn, 1);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_an_error() {
        let model = ScriptedModel::new();
        let state = ConversationState::new("sys");
        let err = model.complete(ModelRequest::new(&state, &[])).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
