//! 循环过程事件：用于流式展示与外部观测（每轮的请求动作、结果、耗时与资源消耗）

use serde::Serialize;

use crate::core::{RunId, RunStatus};

/// 单步过程事件（可序列化为 JSON 供前端或日志管道消费）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    RunStarted {
        run_id: RunId,
        resumed: bool,
        iteration: u32,
    },
    /// 正在调用模型
    Thinking { run_id: RunId, iteration: u32 },
    ActionsRequested {
        run_id: RunId,
        iteration: u32,
        actions: Vec<String>,
    },
    /// 单个动作完成（预览，避免过长）
    ActionCompleted {
        run_id: RunId,
        call_id: String,
        action: String,
        ok: bool,
        preview: String,
    },
    IterationCompleted {
        run_id: RunId,
        iteration: u32,
        outcomes: usize,
        elapsed_ms: u64,
        cost_units: u64,
    },
    Compacted {
        run_id: RunId,
        before: usize,
        after: usize,
    },
    CheckpointSaved { run_id: RunId, version: u64 },
    /// 挂起，等待人工输入
    Suspended { run_id: RunId, prompt: String },
    Finished {
        run_id: RunId,
        status: RunStatus,
        iterations: u32,
    },
}
