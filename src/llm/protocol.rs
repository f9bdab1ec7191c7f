//! 文本协议：把动作目录渲染进系统提示，并从模型文本中解析动作批次
//!
//! 模型以 JSON 请求动作：`{"actions":[{"tool":..,"args":..}]}` 或单个 `{"tool":..,"args":..}`；
//! 其余输出一律视为最终回复。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ReplyContent;
use crate::memory::ActionCall;
use crate::tools::ActionSpec;

/// 单个动作请求（模型视角，无 call-id）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    /// 动作名称，必须出自目录
    pub tool: String,
    /// 动作参数
    #[serde(default)]
    pub args: Value,
}

/// 一批相互独立的动作请求
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActionBatch {
    pub actions: Vec<ToolCall>,
}

pub fn new_call_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &id[..12])
}

/// 渲染动作目录与输出格式说明
pub fn render_catalogue(catalogue: &[ActionSpec]) -> String {
    let mut out = String::from("## Available actions\n");
    for spec in catalogue {
        out.push_str(&format!(
            "- {} [{} risk]: {}\n  args schema: {}\n",
            spec.name, spec.risk_tier, spec.description, spec.parameters
        ));
    }
    let schema = serde_json::to_string(&schemars::schema_for!(ActionBatch)).unwrap_or_default();
    out.push_str("\n## Output format\n");
    out.push_str(
        "To act, reply with only a JSON object matching this schema (independent actions may share one batch):\n",
    );
    out.push_str(&schema);
    out.push_str("\nWhen the task is finished, reply with plain text and no JSON.\n");
    out
}

/// 把历史请求写回模型可读的 JSON
pub fn render_request(calls: &[ActionCall]) -> String {
    let batch = ActionBatch {
        actions: calls
            .iter()
            .map(|c| ToolCall {
                tool: c.name.clone(),
                args: c.args.clone(),
            })
            .collect(),
    };
    serde_json::to_string(&batch).unwrap_or_default()
}

/// 解析模型输出：含合法动作 JSON 则为动作批次，否则为最终回复
pub fn parse_model_output(output: &str) -> ReplyContent {
    let trimmed = output.trim();

    // 提取 JSON 块（```json ... ``` 或首个 { 到最后一个 }）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return ReplyContent::Final(trimmed.to_string());
        }
    } else {
        return ReplyContent::Final(trimmed.to_string());
    };

    let calls: Vec<ToolCall> = if let Ok(batch) = serde_json::from_str::<ActionBatch>(json_str) {
        batch.actions
    } else if let Ok(single) = serde_json::from_str::<ToolCall>(json_str) {
        vec![single]
    } else {
        return ReplyContent::Final(trimmed.to_string());
    };

    let calls: Vec<ActionCall> = calls
        .into_iter()
        .filter(|c| !c.tool.is_empty())
        .map(|c| ActionCall::new(new_call_id(), c.tool, c.args))
        .collect();
    if calls.is_empty() {
        ReplyContent::Final(trimmed.to_string())
    } else {
        ReplyContent::Actions(calls)
    }
}
