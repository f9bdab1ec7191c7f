//! 工具注册表
//!
//! 所有工具实现 Tool trait（名称 / 描述 / 参数 schema / 风险等级 / 资源足迹 / 执行），
//! 由 ToolRegistry 按名注册与查找；新工具注册即可被调度，无需改动循环控制器。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::OutcomeErrorKind;
use crate::safety::RiskTier;
use crate::tools::footprint::ResourceFootprint;
use crate::tools::schema::{validate_args, ValidationError};

/// 工具执行错误（不会跨越边界抛出，全部转成带类型的错误）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("tool '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },
    #[error("tool '{tool}' panicked: {message}")]
    Panicked { tool: String, message: String },
}

impl ToolError {
    pub fn outcome_kind(&self) -> OutcomeErrorKind {
        match self {
            Self::UnknownTool(_) => OutcomeErrorKind::UnknownTool,
            Self::InvalidArguments(_) => OutcomeErrorKind::Validation,
            Self::Timeout { .. } => OutcomeErrorKind::Timeout,
            Self::Failed(_) | Self::Panicked { .. } => OutcomeErrorKind::Execution,
        }
    }
}

/// 动作目录条目（提供给模型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub risk_tier: RiskTier,
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型输出中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能，也参与风险关键字匹配）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn risk_tier(&self) -> RiskTier {
        RiskTier::Low
    }

    /// 本次调用将读写的共享资源；默认为空（与任何动作独立）
    fn footprint(&self, _args: &Value) -> ResourceFootprint {
        ResourceFootprint::none()
    }

    /// 覆盖执行器的全局超时
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// 自身受独立期限约束（如子运行的预算），执行器不再套用超时
    fn self_limited(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous capability replaced");
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn validate(&self, tool: &dyn Tool, args: &Value) -> Result<(), ValidationError> {
        validate_args(&tool.parameters_schema(), args)
    }

    /// 直接执行（校验后调用；超时与隔离由 ToolExecutor 负责）
    pub async fn execute(&self, tool: &dyn Tool, args: Value) -> Result<Value, ToolError> {
        self.validate(tool, &args)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        tool.execute(args).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 子注册表：只保留给定名称（不存在的名称忽略）
    pub fn subset(&self, names: &[String]) -> ToolRegistry {
        let tools = names
            .iter()
            .filter_map(|n| self.tools.get(n).map(|t| (n.clone(), Arc::clone(t))))
            .collect();
        ToolRegistry { tools }
    }

    /// 当前允许的动作目录（按名称排序，保证提示稳定）
    pub fn catalogue(&self) -> Vec<ActionSpec> {
        let mut specs: Vec<ActionSpec> = self
            .tools
            .values()
            .map(|t| ActionSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                risk_tier: t.risk_tier(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}
