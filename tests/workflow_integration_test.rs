//! 工作流集成测试：Saga 补偿、队列认领、worker 池驱动运行、计划执行

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::checkpoint::{CheckpointStore, FileCheckpointStore};
use hive::core::{AgentError, RunStatus, ShutdownManager, ShutdownReason};
use hive::llm::{MockModel, RetryConfig, ScriptedModel};
use hive::queue::{
    InMemoryTaskQueue, QueueError, TaskInput, TaskNotification, TaskQueue, TaskStatus, WorkerConfig,
    WorkerPool,
};
use hive::react::LoopConfig;
use hive::tools::{builtin_registry, ServiceState};
use hive::workflow::*;
use hive::Runtime;
use serde_json::json;
use tokio::sync::broadcast;

type Journal = Arc<Mutex<Vec<String>>>;

struct Step {
    name: &'static str,
    fail: bool,
    journal: Journal,
}

#[async_trait]
impl SagaStep for Step {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self) -> Result<(), String> {
        self.journal.lock().unwrap().push(format!("do {}", self.name));
        if self.fail {
            Err(format!("{} rejected", self.name))
        } else {
            Ok(())
        }
    }

    async fn compensate(&self) -> Result<(), String> {
        self.journal.lock().unwrap().push(format!("undo {}", self.name));
        Ok(())
    }
}

#[tokio::test]
async fn test_saga_compensates_in_reverse_order() {
    let journal: Journal = Arc::default();
    let step = |name, fail| Step {
        name,
        fail,
        journal: journal.clone(),
    };
    let saga = Saga::new()
        .step(step("A", false))
        .step(step("B", false))
        .step(step("C", true));

    let outcome = saga.run().await;

    assert_eq!(
        outcome,
        SagaOutcome::FailedAtStep {
            index: 2,
            step: "C".into(),
            error: "C rejected".into(),
            compensated: vec!["B".into(), "A".into()],
            compensation_failures: vec![],
        }
    );
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["do A", "do B", "do C", "undo B", "undo A"]
    );
}

#[tokio::test]
async fn test_concurrent_claims_have_single_winner() {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let id = queue.submit(TaskInput::start("only once")).await.unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let queue = queue.clone();
            let id = id.clone();
            tokio::spawn(async move { queue.claim(&id, &format!("worker-{i}")).await })
        })
        .collect();
    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(QueueError::ClaimConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((wins, conflicts), (1, 15));
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, TaskStatus::Claimed);
}

fn fast_loop() -> LoopConfig {
    LoopConfig {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..LoopConfig::default()
    }
}

async fn next_finished(rx: &mut broadcast::Receiver<TaskNotification>) -> TaskNotification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("task did not finish in time")
        .unwrap()
}

#[tokio::test]
async fn test_worker_pool_runs_queued_tasks() {
    let runtime = Arc::new(
        Runtime::builder(Arc::new(MockModel))
            .loop_config(fast_loop())
            .build()
            .unwrap(),
    );
    let queue = Arc::new(InMemoryTaskQueue::new());
    let mut rx = queue.subscribe();
    let mut ids = Vec::new();
    for task in ["first", "second", "third"] {
        ids.push(queue.submit(TaskInput::start(task)).await.unwrap());
    }

    let shutdown = ShutdownManager::new();
    let pool = WorkerPool::new(
        queue.clone(),
        runtime,
        WorkerConfig {
            count: 2,
            poll_interval_ms: 5,
        },
    );
    let handles = pool.start(&shutdown);
    for _ in 0..ids.len() {
        next_finished(&mut rx).await;
    }
    assert_eq!(shutdown.drain(ShutdownReason::QueueDrained, handles).await, 0);

    for (id, task) in ids.iter().zip(["first", "second", "third"]) {
        let record = queue.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        let output = record.output.unwrap();
        assert_eq!(output.run_status, RunStatus::Completed);
        assert_eq!(output.final_text, Some(format!("Echo from Mock: {task}")));
    }
}

#[tokio::test]
async fn test_confirmation_round_trip_through_queue() {
    let model = ScriptedModel::new()
        .then_action("delete_database", json!({"db": "staging"}))
        .then_final("staging deleted");
    let runtime = Arc::new(
        Runtime::builder(Arc::new(model))
            .loop_config(fast_loop())
            .build()
            .unwrap(),
    );
    let queue = Arc::new(InMemoryTaskQueue::new());
    let mut rx = queue.subscribe();
    let shutdown = ShutdownManager::new();
    let handles = WorkerPool::new(
        queue.clone(),
        runtime,
        WorkerConfig {
            count: 1,
            poll_interval_ms: 5,
        },
    )
    .start(&shutdown);

    queue.submit(TaskInput::start("delete staging")).await.unwrap();
    let suspended = next_finished(&mut rx).await.output.unwrap();
    assert_eq!(suspended.run_status, RunStatus::AwaitingConfirmation);
    assert!(suspended.pending_prompt.unwrap().contains("delete_database"));

    queue
        .submit(TaskInput::resume(suspended.run_id.clone(), Some("yes")))
        .await
        .unwrap();
    let done = next_finished(&mut rx).await.output.unwrap();
    assert_eq!(done.run_id, suspended.run_id);
    assert_eq!(done.run_status, RunStatus::Completed);
    assert_eq!(done.final_text.as_deref(), Some("staging deleted"));

    assert_eq!(shutdown.drain(ShutdownReason::QueueDrained, handles).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_confirmations_execute_once() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(tmp.path()));
    let state = ServiceState::new();
    // 两个运行时模拟两个进程：共享检查点目录与被操作的系统，不共享进程内锁
    let runtime = || {
        Runtime::builder(Arc::new(
            ScriptedModel::new()
                .then_action("delete_database", json!({"db": "prod"}))
                .then_final("prod deleted"),
        ))
        .registry(builtin_registry(Arc::clone(&state)))
        .store(Arc::clone(&store))
        .loop_config(fast_loop())
        .build()
        .unwrap()
    };
    let (a, b) = (runtime(), runtime());

    let suspended = a.start("delete database prod").await.unwrap();
    assert_eq!(suspended.status, RunStatus::AwaitingConfirmation);

    let id = suspended.run_id.as_str();
    let (ra, rb) = tokio::join!(a.confirm(id, "yes"), b.confirm(id, "yes"));
    let results = [ra, rb];
    let completed = results
        .iter()
        .filter(|r| matches!(r, Ok(res) if res.status == RunStatus::Completed))
        .count();
    assert_eq!(completed, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(AgentError::ClaimConflict(_)) | Err(AgentError::InvalidRunState { .. })
    )));
    assert_eq!(state.side_effects().await, vec!["delete_database:prod"]);
}

/// 每个计划步骤作为一次独立的智能体运行
struct AgentStepExecutor {
    runtime: Runtime,
}

#[async_trait]
impl StepExecutor for AgentStepExecutor {
    async fn execute(&self, step: &PlanStep) -> Result<String, String> {
        let result = self.runtime.start(&step.description).await.map_err(|e| e.to_string())?;
        match (result.status, result.final_text) {
            (RunStatus::Completed, Some(text)) => Ok(text),
            (status, _) => Err(format!("step run ended as {status}")),
        }
    }
}

#[tokio::test]
async fn test_plan_steps_run_as_agent_runs() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(JsonPlanStore::new(tmp.path()));
    let executor = PlanExecutor::new(Arc::new(AgentStepExecutor {
        runtime: Runtime::builder(Arc::new(MockModel))
            .loop_config(fast_loop())
            .build()
            .unwrap(),
    }))
    .with_store(store.clone());

    let mut plan = PlanBuilder::new("restore service")
        .id("plan_restore")
        .step("inspect", "inspect api logs")
        .step_after("disk", "check disk", &["inspect"])
        .step_after("net", "check network", &["inspect"])
        .step_after("report", "write report", &["disk", "net"])
        .build()
        .unwrap();

    let status = executor.execute(&mut plan).await.unwrap();

    assert_eq!(status, PlanStatus::Completed);
    assert_eq!(
        plan.step("report").unwrap().result.as_deref(),
        Some("Echo from Mock: write report")
    );
    let saved = store.load("plan_restore").await.unwrap().unwrap();
    assert_eq!(saved.status(), PlanStatus::Completed);
    assert!(saved.steps.iter().all(|s| s.status == StepStatus::Completed));
}
