//! 计划执行引擎
//!
//! 按依赖逐波执行就绪步骤（同一波内并发），失败步骤有限重试，
//! 永久失败步骤的下游标记为 skipped；每个步骤结束后持久化计划状态。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 步骤执行器 trait
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// 执行单个步骤
    async fn execute(&self, step: &PlanStep) -> Result<String, String>;
}

/// 计划状态存储
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn save(&self, plan: &Plan) -> Result<(), WorkflowError>;
    async fn load(&self, plan_id: &str) -> Result<Option<Plan>, WorkflowError>;
}

/// 每个计划一个 JSON 文件：`<dir>/<plan_id>.json`
pub struct JsonPlanStore {
    dir: PathBuf,
}

impl JsonPlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, plan_id: &str) -> Result<PathBuf, WorkflowError> {
        if plan_id.is_empty()
            || !plan_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "invalid plan id: {plan_id}"
            )));
        }
        Ok(self.dir.join(format!("{plan_id}.json")))
    }
}

#[async_trait]
impl PlanStore for JsonPlanStore {
    async fn save(&self, plan: &Plan) -> Result<(), WorkflowError> {
        let target = self.path(&plan.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body =
            serde_json::to_vec_pretty(plan).map_err(|e| WorkflowError::Storage(e.to_string()))?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", plan.id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> Result<Option<Plan>, WorkflowError> {
        let path = self.path(plan_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| WorkflowError::Storage(format!("plan {plan_id} unreadable: {e}")))
    }
}

/// 计划执行器
pub struct PlanExecutor {
    executor: Arc<dyn StepExecutor>,
    store: Option<Arc<dyn PlanStore>>,
    max_retries: u32,
}

impl PlanExecutor {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            store: None,
            max_retries: 0,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 失败后的重试次数（总尝试次数 = 1 + max_retries）
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 从存储中加载计划并继续执行；中断时处于 running 的步骤重新执行
    pub async fn resume(&self, plan_id: &str) -> Result<Plan, WorkflowError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| WorkflowError::InvalidConfiguration("no plan store configured".into()))?;
        let mut plan = store
            .load(plan_id)
            .await?
            .ok_or_else(|| WorkflowError::PlanNotFound(plan_id.to_string()))?;
        for step in plan.steps.iter_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }
        self.execute(&mut plan).await?;
        Ok(plan)
    }

    /// 执行计划直到没有可执行的步骤，返回最终状态
    pub async fn execute(&self, plan: &mut Plan) -> Result<PlanStatus, WorkflowError> {
        let graph = PlanGraph::new(plan)?;
        graph.topological_order()?;

        loop {
            let ready = graph.ready_steps(plan);
            if ready.is_empty() {
                break;
            }
            for id in &ready {
                if let Some(step) = plan.step_mut(id) {
                    step.status = StepStatus::Running;
                }
            }
            plan.touch();
            self.persist(plan).await?;

            let wave: Vec<PlanStep> = ready
                .iter()
                .filter_map(|id| plan.step(id).cloned())
                .collect();
            let results = join_all(wave.iter().map(|step| self.run_step(step))).await;

            for (step, (attempts, result)) in wave.iter().zip(results) {
                let failed = result.is_err();
                if let Some(s) = plan.step_mut(&step.id) {
                    s.attempts += attempts;
                    match result {
                        Ok(output) => {
                            s.status = StepStatus::Completed;
                            s.result = Some(output);
                            s.error = None;
                        }
                        Err(err) => {
                            s.status = StepStatus::Failed;
                            s.error = Some(err);
                        }
                    }
                }
                if failed {
                    for dependent in graph.dependents_of(&step.id) {
                        if let Some(d) = plan.step_mut(&dependent) {
                            if d.status == StepStatus::Pending {
                                d.status = StepStatus::Skipped;
                            }
                        }
                    }
                }
                plan.touch();
                self.persist(plan).await?;
            }
        }

        let status = plan.status();
        tracing::info!(plan_id = %plan.id, ?status, "plan execution finished");
        Ok(status)
    }

    /// 带重试执行单个步骤，返回（尝试次数，结果）
    async fn run_step(&self, step: &PlanStep) -> (u32, Result<String, String>) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.executor.execute(step).await {
                Ok(output) => return (attempts, Ok(output)),
                Err(err) if attempts <= self.max_retries => {
                    tracing::warn!(step = %step.id, attempt = attempts, error = %err, "step failed, retrying");
                }
                Err(err) => {
                    tracing::warn!(step = %step.id, attempts, error = %err, "step failed permanently");
                    return (attempts, Err(err));
                }
            }
        }
    }

    async fn persist(&self, plan: &Plan) -> Result<(), WorkflowError> {
        match &self.store {
            Some(store) => store.save(plan).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::PlanBuilder;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// 按步骤 ID 预设失败次数
    struct FlakyExecutor {
        failures: Mutex<HashMap<String, u32>>,
        log: Mutex<Vec<String>>,
    }

    impl FlakyExecutor {
        fn new(failures: &[(&str, u32)]) -> Self {
            Self {
                failures: Mutex::new(failures.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for FlakyExecutor {
        async fn execute(&self, step: &PlanStep) -> Result<String, String> {
            self.log.lock().unwrap().push(step.id.clone());
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&step.id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(format!("{} failed", step.id))
                }
                _ => Ok(format!("{} done", step.id)),
            }
        }
    }

    fn diamond() -> Plan {
        PlanBuilder::new("deploy")
            .id("diamond")
            .step("a", "A")
            .step_after("b", "B", &["a"])
            .step_after("c", "C", &["a"])
            .step_after("d", "D", &["b", "c"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let executor = Arc::new(FlakyExecutor::new(&[("b", 2)]));
        let engine = PlanExecutor::new(executor.clone()).with_max_retries(2);
        let mut plan = diamond();
        assert_eq!(engine.execute(&mut plan).await.unwrap(), PlanStatus::Completed);
        assert_eq!(plan.step("b").unwrap().attempts, 3);
        let log = executor.log.lock().unwrap().clone();
        assert_eq!(log.first().map(String::as_str), Some("a"));
        assert_eq!(log.last().map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_dependents() {
        let executor = Arc::new(FlakyExecutor::new(&[("b", 5)]));
        let engine = PlanExecutor::new(executor).with_max_retries(1);
        let mut plan = diamond();
        assert_eq!(engine.execute(&mut plan).await.unwrap(), PlanStatus::Failed);
        assert_eq!(plan.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(plan.step("c").unwrap().status, StepStatus::Completed);
        assert_eq!(plan.step("d").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_state_persisted_and_resumed() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(JsonPlanStore::new(tmp.path()));
        let mut plan = diamond();
        plan.steps[0].status = StepStatus::Completed;
        plan.steps[1].status = StepStatus::Running;
        store.save(&plan).await.unwrap();

        let executor = Arc::new(FlakyExecutor::new(&[]));
        let engine = PlanExecutor::new(executor.clone()).with_store(store.clone());
        let resumed = engine.resume("diamond").await.unwrap();
        assert_eq!(resumed.status(), PlanStatus::Completed);
        assert!(!executor.log.lock().unwrap().contains(&"a".to_string()));
        let stored = store.load("diamond").await.unwrap().unwrap();
        assert_eq!(stored, resumed);
        assert!(store.load("missing").await.unwrap().is_none());
    }
}
