//! 对话状态：单次运行的只追加日志
//!
//! Entry 为不可变记录；ConversationState 在追加时校验调用配对不变量：
//! 每个 ActionOutcome 必须对应一个此前未配对的 call-id，上一批请求全部配对前不得发出新批次。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 调用 ID（在单次运行内唯一）
pub type CallId = String;

/// 重放批次 call-id 的分隔标记
const REPLAY_MARK: &str = "#r";

/// 一次具名、带参数的动作请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub call_id: CallId,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ActionCall {
    pub fn new(call_id: impl Into<CallId>, name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            args,
        }
    }

    /// 确认后重放：沿用名称与参数，换新的 call-id（后缀为重放时的对话长度，保证唯一）
    pub fn replayed(&self, at: usize) -> Self {
        let base = self
            .call_id
            .split_once(REPLAY_MARK)
            .map(|(b, _)| b)
            .unwrap_or(&self.call_id);
        Self {
            call_id: format!("{base}{REPLAY_MARK}{at}"),
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }

    pub fn is_replay(&self) -> bool {
        self.call_id.contains(REPLAY_MARK)
    }

    /// 签名：名称 + 规范化参数（serde_json 的 Map 按键排序，序列化结果即规范形式）
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, canonical_args(&self.args))
    }
}

/// 将参数规范化为稳定字符串；Null 与空对象视为相同
pub fn canonical_args(args: &Value) -> String {
    match args {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// 失败结果的分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeErrorKind {
    UnknownTool,
    Validation,
    Execution,
    Timeout,
    /// 高风险动作等待人工确认（合成结果，动作未执行）
    ConfirmationRequired,
    /// 缺少必填参数，等待补充（合成结果，动作未执行）
    ClarificationRequired,
    /// 同批次其他动作被拦截，本动作暂缓（合成结果，动作未执行）
    Deferred,
    /// 截止时间已到，未开始执行
    NotExecuted,
}

impl OutcomeErrorKind {
    /// 是否为安全闸门产生的挂起信号
    pub fn is_suspension_signal(self) -> bool {
        matches!(
            self,
            Self::ConfirmationRequired | Self::ClarificationRequired | Self::Deferred
        )
    }

    /// 工具是否真正被调用过
    pub fn was_executed(self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: OutcomeErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
}

/// 动作结果：成功载荷或错误载荷
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum OutcomeResult {
    Success(Value),
    Error(OutcomeError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub call_id: CallId,
    pub result: OutcomeResult,
}

impl ActionOutcome {
    pub fn success(call_id: impl Into<CallId>, payload: Value) -> Self {
        Self {
            call_id: call_id.into(),
            result: OutcomeResult::Success(payload),
        }
    }

    pub fn error(call_id: impl Into<CallId>, kind: OutcomeErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            result: OutcomeResult::Error(OutcomeError {
                kind,
                message: message.into(),
                missing_fields: Vec::new(),
            }),
        }
    }

    pub fn clarification(call_id: impl Into<CallId>, missing: Vec<String>) -> Self {
        let message = format!("missing required arguments: {}", missing.join(", "));
        Self {
            call_id: call_id.into(),
            result: OutcomeResult::Error(OutcomeError {
                kind: OutcomeErrorKind::ClarificationRequired,
                message,
                missing_fields: missing,
            }),
        }
    }

    pub fn error_kind(&self) -> Option<OutcomeErrorKind> {
        match &self.result {
            OutcomeResult::Success(_) => None,
            OutcomeResult::Error(e) => Some(e.kind),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, OutcomeResult::Success(_))
    }

    /// 供日志与模型阅读的简短文本
    pub fn summary(&self) -> String {
        match &self.result {
            OutcomeResult::Success(Value::String(s)) => s.clone(),
            OutcomeResult::Success(v) => v.to_string(),
            OutcomeResult::Error(e) => format!("Error[{:?}]: {}", e.kind, e.message),
        }
    }
}

/// 对话状态中的一条记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entry {
    /// 固定角色文本，仅允许作为第一条
    Instruction { text: String },
    UserText { text: String },
    /// 最终回复（不再触发动作）
    AssistantText { text: String },
    ActionRequest { calls: Vec<ActionCall> },
    ActionOutcome(ActionOutcome),
}

impl Entry {
    pub fn user(text: impl Into<String>) -> Self {
        Entry::UserText { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Entry::AssistantText { text: text.into() }
    }

    /// 可读文本（用于 token 估算与文本协议）
    pub fn render_text(&self) -> String {
        match self {
            Entry::Instruction { text } | Entry::UserText { text } | Entry::AssistantText { text } => {
                text.clone()
            }
            Entry::ActionRequest { calls } => calls
                .iter()
                .map(ActionCall::signature)
                .collect::<Vec<_>>()
                .join("; "),
            Entry::ActionOutcome(o) => o.summary(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversationError {
    #[error("the first entry must be the instruction")]
    MissingInstruction,
    #[error("instruction may only appear as the first entry")]
    MisplacedInstruction,
    #[error("action request must contain at least one call")]
    EmptyRequest,
    #[error("duplicate call id: {0}")]
    DuplicateCallId(CallId),
    #[error("outcome for unknown or already answered call id: {0}")]
    UnmatchedOutcome(CallId),
    #[error("previous action batch still has {0} pending call(s)")]
    PendingCalls(usize),
}

/// 只追加的对话日志；索引在反序列化时重建并重新校验
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Entry>", into = "Vec<Entry>")]
pub struct ConversationState {
    entries: Vec<Entry>,
    /// call_id -> 所在 ActionRequest 的下标
    #[serde(skip)]
    calls: HashMap<CallId, usize>,
    /// 尚未收到结果的 call_id（按请求顺序）
    #[serde(skip)]
    pending: Vec<CallId>,
}

impl ConversationState {
    /// 以 Instruction 作为首条记录创建对话
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            entries: vec![Entry::Instruction {
                text: instruction.into(),
            }],
            calls: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn instruction(&self) -> Option<&str> {
        match self.entries.first() {
            Some(Entry::Instruction { text }) => Some(text),
            _ => None,
        }
    }

    /// 追加一条记录；违反配对不变量时拒绝且不修改状态
    pub fn append(&mut self, entry: Entry) -> Result<(), ConversationError> {
        if self.entries.is_empty() && !matches!(entry, Entry::Instruction { .. }) {
            return Err(ConversationError::MissingInstruction);
        }
        match &entry {
            Entry::Instruction { .. } => {
                if !self.entries.is_empty() {
                    return Err(ConversationError::MisplacedInstruction);
                }
            }
            Entry::ActionRequest { calls } => {
                if calls.is_empty() {
                    return Err(ConversationError::EmptyRequest);
                }
                if !self.pending.is_empty() {
                    return Err(ConversationError::PendingCalls(self.pending.len()));
                }
                let mut seen = HashSet::new();
                for call in calls {
                    if self.calls.contains_key(&call.call_id) || !seen.insert(call.call_id.as_str()) {
                        return Err(ConversationError::DuplicateCallId(call.call_id.clone()));
                    }
                }
                let idx = self.entries.len();
                for call in calls {
                    self.calls.insert(call.call_id.clone(), idx);
                    self.pending.push(call.call_id.clone());
                }
            }
            Entry::ActionOutcome(outcome) => {
                let pos = self
                    .pending
                    .iter()
                    .position(|id| id == &outcome.call_id)
                    .ok_or_else(|| ConversationError::UnmatchedOutcome(outcome.call_id.clone()))?;
                self.pending.remove(pos);
            }
            Entry::UserText { .. } | Entry::AssistantText { .. } => {}
        }
        self.entries.push(entry);
        Ok(())
    }

    /// 当前批次中尚未配对的调用（按请求顺序）
    pub fn pending_calls(&self) -> Vec<ActionCall> {
        self.pending
            .iter()
            .filter_map(|id| self.call(id).cloned())
            .collect()
    }

    pub fn has_pending_calls(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 按 call-id 查找原始请求
    pub fn call(&self, call_id: &str) -> Option<&ActionCall> {
        let idx = *self.calls.get(call_id)?;
        match &self.entries[idx] {
            Entry::ActionRequest { calls } => calls.iter().find(|c| c.call_id == call_id),
            _ => None,
        }
    }

    /// 最近一次 ActionRequest 的下标与调用列表
    pub fn last_request(&self) -> Option<(usize, &[ActionCall])> {
        self.entries.iter().enumerate().rev().find_map(|(i, e)| match e {
            Entry::ActionRequest { calls } => Some((i, calls.as_slice())),
            _ => None,
        })
    }

    /// 某个请求批次收到的结果（按追加顺序）
    pub fn outcomes_for(&self, request_idx: usize) -> Vec<&ActionOutcome> {
        let ids: HashSet<&str> = match self.entries.get(request_idx) {
            Some(Entry::ActionRequest { calls }) => calls.iter().map(|c| c.call_id.as_str()).collect(),
            _ => return Vec::new(),
        };
        self.entries[request_idx + 1..]
            .iter()
            .filter_map(|e| match e {
                Entry::ActionOutcome(o) if ids.contains(o.call_id.as_str()) => Some(o),
                _ => None,
            })
            .collect()
    }

    /// 已真正执行过的批次签名（按时间顺序）；被挂起的批次不计入
    pub fn executed_batch_signatures(&self) -> Vec<String> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                Entry::ActionRequest { calls } => {
                    let outcomes = self.outcomes_for(i);
                    let suspended = outcomes
                        .iter()
                        .any(|o| o.error_kind().is_some_and(OutcomeErrorKind::is_suspension_signal));
                    if suspended || outcomes.len() < calls.len() {
                        None
                    } else {
                        Some(
                            calls
                                .iter()
                                .map(ActionCall::signature)
                                .collect::<Vec<_>>()
                                .join(";"),
                        )
                    }
                }
                _ => None,
            })
            .collect()
    }

    /// 模型已产出的回合数（最终回复 + 非重放的请求批次）
    pub fn model_turns(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| match e {
                Entry::AssistantText { .. } => true,
                Entry::ActionRequest { calls } => !calls.first().is_some_and(ActionCall::is_replay),
                _ => false,
            })
            .count()
    }

    /// 最近一条用户文本及其下标
    pub fn last_user_text(&self) -> Option<(usize, &str)> {
        self.entries.iter().enumerate().rev().find_map(|(i, e)| match e {
            Entry::UserText { text } => Some((i, text.as_str())),
            _ => None,
        })
    }

    /// 用压缩后的记录整体替换；新记录须自身满足不变量
    pub fn replace_with(&mut self, entries: Vec<Entry>) -> Result<(), ConversationError> {
        *self = Self::try_from(entries)?;
        Ok(())
    }

    pub fn count_outcomes(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::ActionOutcome(_)))
            .count()
    }

    pub fn count_calls(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e {
                Entry::ActionRequest { calls } => calls.len(),
                _ => 0,
            })
            .sum()
    }
}

impl TryFrom<Vec<Entry>> for ConversationState {
    type Error = ConversationError;

    fn try_from(entries: Vec<Entry>) -> Result<Self, Self::Error> {
        let mut state = ConversationState::default();
        for entry in entries {
            state.append(entry)?;
        }
        Ok(state)
    }
}

impl From<ConversationState> for Vec<Entry> {
    fn from(state: ConversationState) -> Self {
        state.entries
    }
}
