//! 子智能体委派
//!
//! 子运行拥有全新的对话状态（只含自己的指令与任务文本）、工具子集与独立预算，
//! 运行完成后只把最终文本作为父运行中 delegate 动作的结果返回。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::core::{new_run_id, AgentError, Budgets, RunResult, RunStatus};
use crate::llm::ModelClient;
use crate::react::{LoopConfig, LoopController};
use crate::safety::SafetyGate;
use crate::tools::schema::{parse_args, schema_of};
use crate::tools::{Tool, ToolError, ToolRegistry};

/// 子智能体定义：指令、工具子集、预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentSpec {
    pub name: String,
    pub description: String,
    pub instruction: String,
    /// 允许使用的工具名；不存在的名称忽略
    pub tools: Vec<String>,
    #[serde(default)]
    pub budgets: Budgets,
}

impl SubAgentSpec {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: instruction.into(),
            tools: Vec::new(),
            budgets: Budgets::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }
}

/// 委派器：按定义启动隔离的子运行
pub struct Delegator {
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    gate: Arc<SafetyGate>,
    store: Arc<dyn CheckpointStore>,
    config: LoopConfig,
    agents: BTreeMap<String, SubAgentSpec>,
}

impl Delegator {
    /// registry 为子运行可选工具的全集（不含 delegate 自身）
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<SafetyGate>,
        config: LoopConfig,
    ) -> Self {
        Self {
            model,
            registry,
            gate,
            store: Arc::new(InMemoryCheckpointStore::new()),
            config,
            agents: BTreeMap::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_agent(mut self, spec: SubAgentSpec) -> Self {
        self.agents.insert(spec.name.clone(), spec);
        self
    }

    pub fn agent(&self, name: &str) -> Option<&SubAgentSpec> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &SubAgentSpec> {
        self.agents.values()
    }

    /// 运行子智能体直到结束，返回完整结果（含子对话，供调试与测试）
    pub async fn run_child(&self, spec: &SubAgentSpec, task: &str) -> Result<RunResult, AgentError> {
        let registry = Arc::new(self.registry.subset(&spec.tools));
        let config = LoopConfig {
            instruction: spec.instruction.clone(),
            ..self.config.clone()
        };
        let child = LoopController::new(
            Arc::clone(&self.model),
            registry,
            Arc::clone(&self.gate),
            Arc::clone(&self.store),
            config,
        );
        let run_id = format!("{}_{}", spec.name.replace(|c: char| !c.is_ascii_alphanumeric(), "_"), new_run_id());
        tracing::info!(agent = %spec.name, %run_id, "sub-agent spawned");
        child
            .run_with_id(run_id, Some(&spec.instruction), task, spec.budgets.clone())
            .await
    }

    /// 只返回子运行的最终文本；未完成（挂起/失败/中止）视为错误
    pub async fn spawn(&self, spec: &SubAgentSpec, task: &str) -> Result<String, AgentError> {
        let result = self.run_child(spec, task).await?;
        match result.status {
            RunStatus::Completed => Ok(result.final_text.unwrap_or_default()),
            RunStatus::AwaitingConfirmation => {
                let prompt = result.pending.map(|p| p.prompt()).unwrap_or_default();
                Err(ToolError::Failed(format!(
                    "sub-agent '{}' stopped awaiting human input: {prompt}",
                    spec.name
                ))
                .into())
            }
            status => {
                let partial = result
                    .final_text
                    .map(|t| format!(" (partial answer: {t})"))
                    .unwrap_or_default();
                Err(ToolError::Failed(format!(
                    "sub-agent '{}' ended with status {status}: {}{partial}",
                    spec.name,
                    result.failure.unwrap_or_default()
                ))
                .into())
            }
        }
    }
}

#[derive(Deserialize, JsonSchema)]
struct DelegateArgs {
    /// 子智能体名称
    agent: String,
    /// 交给子智能体的任务文本
    task: String,
}

/// delegate 工具：父运行中的阻塞式子运行调用
pub struct DelegateTool {
    delegator: Arc<Delegator>,
    description: String,
}

impl DelegateTool {
    pub fn new(delegator: Arc<Delegator>) -> Self {
        let roster: Vec<String> = delegator
            .agents()
            .map(|a| format!("{} ({})", a.name, a.description))
            .collect();
        let description = format!(
            "Delegate a self-contained sub-task to a specialised sub-agent and get back its final answer. Available agents: {}",
            roster.join(", ")
        );
        Self {
            delegator,
            description,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<DelegateArgs>()
    }

    /// 子运行按自己的预算跑到完成或失败，不受父运行工具超时影响
    fn self_limited(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: DelegateArgs = parse_args(args)?;
        let spec = self
            .delegator
            .agent(&args.agent)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown agent: {}", args.agent)))?;
        match self.delegator.spawn(spec, &args.task).await {
            Ok(text) => Ok(Value::String(text)),
            Err(AgentError::ToolExecution(e)) => Err(e),
            Err(e) => Err(ToolError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::llm::{LlmError, ModelReply, ModelRequest, ScriptedModel};
    use crate::memory::{ActionCall, Entry};
    use crate::safety::SafetyPolicy;
    use crate::tools::{builtin_registry, ServiceState, ToolExecutor};
    use serde_json::json;

    fn delegator(model: Arc<ScriptedModel>) -> Delegator {
        let registry = Arc::new(builtin_registry(ServiceState::new()));
        let gate = Arc::new(SafetyGate::new(SafetyPolicy::default()).unwrap());
        Delegator::new(model, registry, gate, LoopConfig::default()).with_agent(
            SubAgentSpec::new("diagnostician", "You diagnose infrastructure problems.")
                .with_description("checks disks and hosts")
                .with_tools(&["check_disk", "ping"])
                .with_budgets(Budgets::default().with_max_iterations(5)),
        )
    }

    #[tokio::test]
    async fn test_child_starts_with_fresh_conversation() {
        let model = Arc::new(
            ScriptedModel::new()
                .then_action("check_disk", json!({}))
                .then_final("disk at 95%"),
        );
        let d = delegator(Arc::clone(&model));
        let spec = d.agent("diagnostician").unwrap().clone();
        let result = d.run_child(&spec, "how full is the disk?").await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);

        let first = &model.requests()[0];
        assert_eq!(first.conversation.len(), 2);
        assert_eq!(
            first.conversation.instruction(),
            Some("You diagnose infrastructure problems.")
        );
        assert!(matches!(
            &first.conversation.entries()[1],
            Entry::UserText { text } if text == "how full is the disk?"
        ));
        assert_eq!(first.catalogue, vec!["check_disk", "ping"]);
    }

    #[tokio::test]
    async fn test_tool_outside_subset_is_unknown_to_child() {
        let model = Arc::new(
            ScriptedModel::new()
                .then_action("clean_logs", json!({}))
                .then_final("could not clean"),
        );
        let d = delegator(model);
        let spec = d.agent("diagnostician").unwrap().clone();
        let text = d.spawn(&spec, "free space").await.unwrap();
        assert_eq!(text, "could not clean");
    }

    #[tokio::test]
    async fn test_failed_child_surfaces_as_tool_error() {
        let model = Arc::new(ScriptedModel::repeating("ping", json!({"host": "db"})));
        let d = delegator(model);
        let tool = DelegateTool::new(Arc::new(d));
        assert!(tool.description().contains("diagnostician"));
        let err = tool
            .execute(json!({"agent": "diagnostician", "task": "watch db"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed(msg) if msg.contains("aborted_stuck")));
    }

    /// 先等待再回答的子模型
    struct SlowChildModel {
        delay: Duration,
    }

    #[async_trait]
    impl ModelClient for SlowChildModel {
        async fn complete(&self, _request: ModelRequest<'_>) -> Result<ModelReply, LlmError> {
            tokio::time::sleep(self.delay).await;
            Ok(ModelReply::text("child finished"))
        }
    }

    #[tokio::test]
    async fn test_child_outliving_tool_timeout_keeps_its_answer() {
        let config = LoopConfig {
            tool_timeout_secs: 1,
            ..LoopConfig::default()
        };
        let gate = Arc::new(SafetyGate::new(SafetyPolicy::default()).unwrap());
        let d = Delegator::new(
            Arc::new(SlowChildModel {
                delay: Duration::from_millis(1500),
            }),
            Arc::new(builtin_registry(ServiceState::new())),
            gate,
            config.clone(),
        )
        .with_agent(SubAgentSpec::new("slowpoke", "You think slowly."));

        let mut registry = ToolRegistry::new();
        registry.register(DelegateTool::new(Arc::new(d)));
        let executor = ToolExecutor::new(Arc::new(registry), config.tool_timeout_secs, 2);
        let call = ActionCall::new(
            "call_0_0",
            "delegate",
            json!({"agent": "slowpoke", "task": "take your time"}),
        );
        let value = executor.execute(&call).await.unwrap();
        assert_eq!(value, json!("child finished"));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_invalid_argument() {
        let d = delegator(Arc::new(ScriptedModel::new()));
        let tool = DelegateTool::new(Arc::new(d));
        let err = tool
            .execute(json!({"agent": "nobody", "task": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.outcome_kind(), crate::memory::OutcomeErrorKind::Validation);
    }
}
