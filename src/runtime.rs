//! 运行时门面：组装模型、工具、安全闸门、检查点存储与循环控制器
//!
//! - start：新任务
//! - confirm：人工确认通道（run-id + 自由文本回复）
//! - resume：崩溃后从最新检查点继续
//! - execute：供 worker 池执行队列中的 TaskInput

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::config::{AppConfig, CheckpointBackend};
use crate::core::{new_run_id, AgentError, Budgets, RunId, RunResult};
use crate::delegation::{DelegateTool, Delegator, SubAgentSpec};
use crate::llm::{MockModel, ModelClient, OpenAiModel};
use crate::memory::{Compactor, TruncatingCompactor};
use crate::queue::{TaskHandler, TaskInput, TaskOutput};
use crate::react::{LoopConfig, LoopController, LoopEvent};
use crate::safety::{SafetyGate, SafetyPolicy};
use crate::tools::{builtin_registry, ServiceState, ToolRegistry};

/// 运行时
pub struct Runtime {
    controller: LoopController,
    store: Arc<dyn CheckpointStore>,
    budgets: Budgets,
    /// 正在执行的 run-id：同一运行不允许并发推进
    active: Mutex<HashSet<RunId>>,
}

/// 运行占用标记，离开作用域时释放
struct RunGuard<'a> {
    active: &'a Mutex<HashSet<RunId>>,
    run_id: RunId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.run_id);
        }
    }
}

impl Runtime {
    pub fn builder(model: Arc<dyn ModelClient>) -> RuntimeBuilder {
        RuntimeBuilder::new(model)
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    fn acquire(&self, run_id: &str) -> Result<RunGuard<'_>, AgentError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| AgentError::Persistence("run lock poisoned".into()))?;
        if !active.insert(run_id.to_string()) {
            return Err(AgentError::ClaimConflict(run_id.to_string()));
        }
        Ok(RunGuard {
            active: &self.active,
            run_id: run_id.to_string(),
        })
    }

    /// 用默认预算启动新任务
    pub async fn start(&self, task: &str) -> Result<RunResult, AgentError> {
        self.start_with(task, None, self.budgets.clone()).await
    }

    pub async fn start_with(
        &self,
        task: &str,
        instruction: Option<&str>,
        budgets: Budgets,
    ) -> Result<RunResult, AgentError> {
        let run_id = new_run_id();
        let _guard = self.acquire(&run_id)?;
        self.controller
            .run_with_id(run_id, instruction, task, budgets)
            .await
    }

    /// 人工回复：只对挂起中的运行有效
    pub async fn confirm(&self, run_id: &str, reply: &str) -> Result<RunResult, AgentError> {
        let _guard = self.acquire(run_id)?;
        self.controller.resume_run(run_id, Some(reply)).await
    }

    /// 从最新检查点继续（已终止的运行原样返回结果）
    pub async fn resume(&self, run_id: &str) -> Result<RunResult, AgentError> {
        let _guard = self.acquire(run_id)?;
        self.controller.resume_run(run_id, None).await
    }

    pub async fn execute(&self, input: &TaskInput) -> Result<RunResult, AgentError> {
        match input {
            TaskInput::Start { text, instruction } => {
                self.start_with(text, instruction.as_deref(), self.budgets.clone())
                    .await
            }
            TaskInput::Resume {
                run_id,
                reply: Some(reply),
            } => self.confirm(run_id, reply).await,
            TaskInput::Resume { run_id, reply: None } => self.resume(run_id).await,
        }
    }
}

#[async_trait]
impl TaskHandler for Runtime {
    async fn handle(&self, input: &TaskInput) -> Result<TaskOutput, AgentError> {
        let result = self.execute(input).await?;
        Ok(TaskOutput {
            pending_prompt: result.pending.as_ref().map(|p| p.prompt()),
            run_id: result.run_id,
            run_status: result.status,
            final_text: result.final_text,
        })
    }
}

/// 运行时构建器
pub struct RuntimeBuilder {
    model: Arc<dyn ModelClient>,
    registry: Option<ToolRegistry>,
    store: Option<Arc<dyn CheckpointStore>>,
    policy: SafetyPolicy,
    config: LoopConfig,
    budgets: Budgets,
    agents: Vec<SubAgentSpec>,
    compactor: Option<Arc<dyn Compactor>>,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl RuntimeBuilder {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            registry: None,
            store: None,
            policy: SafetyPolicy::default(),
            config: LoopConfig::default(),
            budgets: Budgets::default(),
            agents: Vec::new(),
            compactor: None,
            event_tx: None,
        }
    }

    /// 按配置选择模型后端与检查点存储
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let model: Arc<dyn ModelClient> = match cfg.llm.provider.as_str() {
            "mock" => Arc::new(MockModel),
            "openai" => Arc::new(OpenAiModel::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                cfg.llm.api_key.as_deref(),
            )),
            other => return Err(AgentError::Config(format!("unknown llm provider: {other}"))),
        };

        let store: Arc<dyn CheckpointStore> = match cfg.checkpoint.backend {
            CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStore::new()),
            CheckpointBackend::File => Arc::new(FileCheckpointStore::new(cfg.checkpoint_dir())),
            #[cfg(feature = "async-sqlite")]
            CheckpointBackend::Sqlite => {
                tokio::fs::create_dir_all(&cfg.app.data_dir)
                    .await
                    .map_err(|e| AgentError::Persistence(e.to_string()))?;
                Arc::new(
                    crate::checkpoint::SqliteCheckpointStore::new(cfg.app.data_dir.join("checkpoints.db"))
                        .await?,
                )
            }
            #[cfg(not(feature = "async-sqlite"))]
            CheckpointBackend::Sqlite => {
                return Err(AgentError::Config(
                    "sqlite checkpoint backend requires the async-sqlite feature".into(),
                ))
            }
        };

        Ok(Self::new(model)
            .store(store)
            .policy(cfg.safety_policy())
            .loop_config(cfg.loop_config())
            .budgets(cfg.budgets())
            .agents(cfg.agents.clone()))
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn agents(mut self, agents: Vec<SubAgentSpec>) -> Self {
        self.agents = agents;
        self
    }

    pub fn compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Result<Runtime, AgentError> {
        let gate = Arc::new(SafetyGate::new(self.policy)?);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let mut registry = self
            .registry
            .unwrap_or_else(|| builtin_registry(ServiceState::new()));

        // 有子智能体时注册 delegate；子运行只能使用不含 delegate 的工具集
        if !self.agents.is_empty() {
            let delegator = self.agents.into_iter().fold(
                Delegator::new(
                    Arc::clone(&self.model),
                    Arc::new(registry.clone()),
                    Arc::clone(&gate),
                    self.config.clone(),
                )
                .with_store(Arc::clone(&store)),
                Delegator::with_agent,
            );
            registry.register(DelegateTool::new(Arc::new(delegator)));
        }

        // 只配置了阈值时使用截断压缩，目标为阈值的一半
        let compactor = self.compactor.or_else(|| {
            self.config
                .compaction_token_threshold
                .map(|t| Arc::new(TruncatingCompactor::new(t / 2)) as Arc<dyn Compactor>)
        });

        let mut controller = LoopController::new(
            self.model,
            Arc::new(registry),
            gate,
            Arc::clone(&store),
            self.config,
        );
        if let Some(compactor) = compactor {
            controller = controller.with_compactor(compactor);
        }
        if let Some(tx) = self.event_tx {
            controller = controller.with_event_tx(tx);
        }

        Ok(Runtime {
            controller,
            store,
            budgets: self.budgets,
            active: Mutex::new(HashSet::new()),
        })
    }
}
