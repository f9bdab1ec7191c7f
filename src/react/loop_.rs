//! 循环控制器：Thinking → 动作批次 → 安全检查 → 执行 → 追加结果 → Thinking
//!
//! 侧出口：预算耗尽、卡死检测、模型失败。挂起（等待确认/补充参数）不是失败：
//! 状态与检查点落盘后把控制权交还调用方，之后仅凭对话状态 + 新的 UserText 即可恢复。

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::core::{
    new_run_id, AgentError, BudgetKind, Budgets, PendingInput, RecoveryAction, RecoveryEngine,
    RiskFlag, Run, RunId, RunResult, RunStatus,
};
use crate::llm::{ModelClient, ModelRequest, ReplyContent, RetryConfig, RetryingModel};
use crate::memory::{
    ActionCall, ActionOutcome, Compactor, ConversationState, Entry, OutcomeErrorKind,
    OutcomeResult, TokenEstimator,
};
use crate::react::LoopEvent;
use crate::safety::{RiskTier, SafetyGate, Verdict};
use crate::tools::{plan_waves, ResourceFootprint, Tool, ToolExecutor, ToolRegistry, ValidationError};

pub const DEFAULT_INSTRUCTION: &str = "You are an autonomous operations agent. Use the available actions to complete the user's task step by step. When the task is done, reply with a short plain-text summary.";

/// 观察预览最大字符数
const PREVIEW_CHARS: usize = 200;

/// 检查点写入时机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// 每轮结束（以及挂起/终止时）
    #[default]
    EveryIteration,
    /// 另外在每个动作结果追加后
    EveryOutcome,
}

/// 循环配置
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub instruction: String,
    /// 连续相同批次签名达到该数量即判定卡死；0 表示关闭
    pub stuck_window: usize,
    /// 预算耗尽时先发一次只允许文本的收尾调用
    pub final_answer_on_budget: bool,
    pub checkpoint_policy: CheckpointPolicy,
    /// 终止后保留的检查点数量
    pub keep_checkpoints: usize,
    /// 估算 token 超过阈值时调用 Compactor
    pub compaction_token_threshold: Option<usize>,
    pub retry: RetryConfig,
    pub tool_timeout_secs: u64,
    pub max_parallel: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            instruction: DEFAULT_INSTRUCTION.to_string(),
            stuck_window: 3,
            final_answer_on_budget: true,
            checkpoint_policy: CheckpointPolicy::EveryIteration,
            keep_checkpoints: 5,
            compaction_token_threshold: None,
            retry: RetryConfig::default(),
            tool_timeout_secs: 30,
            max_parallel: 4,
        }
    }
}

/// 单次运行的可变上下文（由控制器独占）
struct RunCtx {
    run: Run,
    conversation: ConversationState,
    version: u64,
    /// 本执行段开始时间；run.active_elapsed_ms 为之前各段的累计
    segment: Instant,
}

impl RunCtx {
    fn elapsed_ms(&self) -> u64 {
        self.run.active_elapsed_ms + self.segment.elapsed().as_millis() as u64
    }
}

enum Next {
    Think,
    /// 已追加到对话、尚待执行的调用
    Execute(Vec<ActionCall>),
}

enum BatchEnd {
    Continue,
    Suspended,
    DeadlinePassed,
}

/// 安全检查后每个调用的处置
enum Slot {
    Run(Arc<dyn Tool>, RiskTier),
    Done(ActionOutcome),
    Confirm(String, RiskTier),
    Clarify(Vec<String>),
}

/// 循环控制器
pub struct LoopController {
    model: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    gate: Arc<SafetyGate>,
    store: Arc<dyn CheckpointStore>,
    recovery: RecoveryEngine,
    compactor: Option<Arc<dyn Compactor>>,
    config: LoopConfig,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl LoopController {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<SafetyGate>,
        store: Arc<dyn CheckpointStore>,
        config: LoopConfig,
    ) -> Self {
        let model: Arc<dyn ModelClient> = Arc::new(RetryingModel::new(model, config.retry.clone()));
        Self {
            model,
            executor: ToolExecutor::new(registry, config.tool_timeout_secs, config.max_parallel),
            gate,
            store,
            recovery: RecoveryEngine::new(),
            compactor: None,
            config,
            event_tx: None,
        }
    }

    pub fn with_compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    fn emit(&self, ev: LoopEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 新建运行
    pub async fn run(&self, task: &str, budgets: Budgets) -> Result<RunResult, AgentError> {
        self.run_with_id(new_run_id(), None, task, budgets).await
    }

    /// 以指定 run-id（与可选的角色指令）新建运行
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        instruction: Option<&str>,
        task: &str,
        budgets: Budgets,
    ) -> Result<RunResult, AgentError> {
        let mut conversation =
            ConversationState::new(instruction.unwrap_or(&self.config.instruction));
        conversation.append(Entry::user(self.gate.sanitize(task)))?;
        let mut ctx = RunCtx {
            run: Run::new(run_id, budgets),
            conversation,
            version: 0,
            segment: Instant::now(),
        };
        tracing::info!(run_id = %ctx.run.run_id, "run started");
        self.emit(LoopEvent::RunStarted {
            run_id: ctx.run.run_id.clone(),
            resumed: false,
            iteration: 0,
        });
        self.save_checkpoint(&mut ctx).await?;
        self.drive(ctx, Next::Think).await
    }

    /// 从检查点存储中加载并恢复
    pub async fn resume_run(&self, run_id: &str, reply: Option<&str>) -> Result<RunResult, AgentError> {
        let checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| AgentError::RunNotFound(run_id.to_string()))?;
        self.resume(checkpoint, reply).await
    }

    /// 从快照恢复；reply 为人工回复（仅对挂起中的运行有效）
    pub async fn resume(&self, checkpoint: Checkpoint, reply: Option<&str>) -> Result<RunResult, AgentError> {
        let Checkpoint {
            version,
            run,
            conversation,
            ..
        } = checkpoint;

        if reply.is_some() && run.status != RunStatus::AwaitingConfirmation {
            return Err(AgentError::InvalidRunState {
                run_id: run.run_id.clone(),
                actual: run.status,
                expected: "awaiting_confirmation",
            });
        }
        if run.status.is_terminal() {
            return Ok(self.result(&run, &conversation));
        }

        let mut ctx = RunCtx {
            run,
            conversation,
            version,
            segment: Instant::now(),
        };
        let mut next = Next::Think;

        if ctx.run.status == RunStatus::AwaitingConfirmation {
            let Some(reply) = reply else {
                return Ok(self.result(&ctx.run, &ctx.conversation));
            };
            let blocked = suspended_batch(&ctx.conversation);
            let text = self.gate.sanitize(reply);
            let affirmative = self.gate.is_confirmation(&text);
            ctx.conversation.append(Entry::user(text))?;
            ctx.run.transition(RunStatus::Active)?;
            if let Some((calls, false)) = blocked {
                if affirmative {
                    let at = ctx.conversation.len();
                    let replay: Vec<ActionCall> = calls.iter().map(|c| c.replayed(at)).collect();
                    tracing::info!(run_id = %ctx.run.run_id, actions = replay.len(), "confirmed batch replayed");
                    ctx.conversation.append(Entry::ActionRequest { calls: replay.clone() })?;
                    next = Next::Execute(replay);
                }
            }
        } else if ctx.conversation.has_pending_calls() {
            // 中断发生在批次执行中途：补完尚未有结果的调用
            next = Next::Execute(ctx.conversation.pending_calls());
        }

        // 先占下一个版本：同一快照的并发恢复者中落后的一方在执行任何动作前以 ClaimConflict 退出
        self.save_checkpoint(&mut ctx).await?;
        tracing::info!(run_id = %ctx.run.run_id, iteration = ctx.run.iteration, "run resumed");
        self.emit(LoopEvent::RunStarted {
            run_id: ctx.run.run_id.clone(),
            resumed: true,
            iteration: ctx.run.iteration,
        });
        self.drive(ctx, next).await
    }

    async fn drive(&self, mut ctx: RunCtx, mut next: Next) -> Result<RunResult, AgentError> {
        loop {
            let calls = match next {
                Next::Execute(calls) => calls,
                Next::Think => {
                    if let Some(n) = self.detect_stuck(&ctx.conversation) {
                        return self.terminate(ctx, AgentError::StuckDetected(n)).await;
                    }
                    if let Some(kind) = ctx.run.exceeded_budget(ctx.segment.elapsed()) {
                        return self.abort_budget(ctx, kind).await;
                    }
                    self.maybe_compact(&mut ctx).await;
                    match self.think(&mut ctx).await {
                        Ok(Some(calls)) => calls,
                        Ok(None) => return self.finish(ctx, RunStatus::Completed).await,
                        Err(err) => return self.terminate(ctx, err).await,
                    }
                }
            };
            let end = match self.process_batch(&mut ctx, calls).await {
                Ok(end) => end,
                // 版本被其他恢复者占用：运行已不归本控制器所有
                Err(err @ AgentError::ClaimConflict(_)) => return Err(err),
                Err(err) => return self.terminate(ctx, err).await,
            };
            next = match end {
                BatchEnd::Continue => Next::Think,
                BatchEnd::Suspended => return self.suspend(ctx).await,
                BatchEnd::DeadlinePassed => {
                    return self.abort_budget(ctx, BudgetKind::WallClock).await
                }
            };
        }
    }

    /// 调用模型；Some(calls) 表示已追加的动作批次，None 表示已追加最终回复
    async fn think(&self, ctx: &mut RunCtx) -> Result<Option<Vec<ActionCall>>, AgentError> {
        self.emit(LoopEvent::Thinking {
            run_id: ctx.run.run_id.clone(),
            iteration: ctx.run.iteration,
        });
        let catalogue = self.executor.registry().catalogue();
        let reply = self
            .model
            .complete(ModelRequest::new(&ctx.conversation, &catalogue))
            .await?;
        ctx.run.cost_units += reply.cost_units;

        match reply.content {
            ReplyContent::Final(text) => {
                ctx.conversation.append(Entry::assistant(text))?;
                Ok(None)
            }
            ReplyContent::Actions(calls) => {
                ctx.conversation.append(Entry::ActionRequest { calls: calls.clone() })?;
                self.emit(LoopEvent::ActionsRequested {
                    run_id: ctx.run.run_id.clone(),
                    iteration: ctx.run.iteration,
                    actions: calls.iter().map(ActionCall::signature).collect(),
                });
                Ok(Some(calls))
            }
        }
    }

    /// 安全检查：解析工具并交给闸门判定
    fn dispose(&self, call: &ActionCall, conversation: &ConversationState) -> Slot {
        let tool = match self.executor.registry().resolve(&call.name) {
            Ok(tool) => tool,
            Err(e) => return Slot::Done(self.to_outcome(call, Err(e.into()))),
        };
        let tier = self.gate.risk_tier(tool.as_ref());
        match self.gate.classify(tool.as_ref(), call, conversation) {
            Verdict::Allow => Slot::Run(tool, tier),
            Verdict::RequireConfirmation(reason) => Slot::Confirm(reason, tier),
            Verdict::RequireClarification(missing) if self.gate.policy().suspend_on_clarification => {
                Slot::Clarify(missing)
            }
            Verdict::RequireClarification(missing) => Slot::Done(self.to_outcome(
                call,
                Err(ValidationError::MissingFields(missing).into()),
            )),
        }
    }

    fn to_outcome(&self, call: &ActionCall, result: Result<serde_json::Value, AgentError>) -> ActionOutcome {
        match result {
            Ok(payload) => ActionOutcome::success(&call.call_id, payload),
            Err(err) => {
                let kind = match self.recovery.handle(&err) {
                    RecoveryAction::FeedBackToModel(kind) => kind,
                    _ => OutcomeErrorKind::Execution,
                };
                ActionOutcome::error(&call.call_id, kind, err.to_string())
            }
        }
    }

    async fn process_batch(&self, ctx: &mut RunCtx, calls: Vec<ActionCall>) -> Result<BatchEnd, AgentError> {
        let slots: Vec<Slot> = calls
            .iter()
            .map(|c| self.dispose(c, &ctx.conversation))
            .collect();

        if slots
            .iter()
            .any(|s| matches!(s, Slot::Confirm(..) | Slot::Clarify(_)))
        {
            for (call, slot) in calls.iter().zip(slots) {
                let outcome = match slot {
                    Slot::Confirm(reason, tier) => {
                        ctx.run.risk_flags.push(RiskFlag {
                            call_id: call.call_id.clone(),
                            action: call.name.clone(),
                            tier,
                            confirmed: false,
                        });
                        ActionOutcome::error(&call.call_id, OutcomeErrorKind::ConfirmationRequired, reason)
                    }
                    Slot::Clarify(missing) => ActionOutcome::clarification(&call.call_id, missing),
                    Slot::Done(outcome) => outcome,
                    Slot::Run(..) => ActionOutcome::error(
                        &call.call_id,
                        OutcomeErrorKind::Deferred,
                        "not executed: another action in this batch is awaiting human input",
                    ),
                };
                ctx.conversation.append(Entry::ActionOutcome(outcome))?;
            }
            return Ok(BatchEnd::Suspended);
        }

        let n = calls.len();
        let mut outcomes: Vec<Option<ActionOutcome>> = Vec::with_capacity(n);
        let mut runnable: Vec<Option<RiskTier>> = Vec::with_capacity(n);
        let mut footprints: Vec<ResourceFootprint> = Vec::with_capacity(n);
        for (call, slot) in calls.iter().zip(slots) {
            match slot {
                Slot::Run(tool, tier) => {
                    footprints.push(tool.footprint(&call.args));
                    runnable.push(Some(tier));
                    outcomes.push(None);
                }
                Slot::Done(outcome) => {
                    footprints.push(ResourceFootprint::none());
                    runnable.push(None);
                    outcomes.push(Some(outcome));
                }
                Slot::Confirm(..) | Slot::Clarify(_) => unreachable!("suspension handled above"),
            }
        }

        let mut flushed = 0;
        let mut deadline_hit = false;
        for wave in plan_waves(&footprints) {
            let indices: Vec<usize> = wave.into_iter().filter(|&i| runnable[i].is_some()).collect();
            if indices.is_empty() {
                continue;
            }
            // 截止时间已过：不再启动新的动作
            if ctx.run.deadline_passed(ctx.segment.elapsed()) {
                deadline_hit = true;
                break;
            }
            let wave_calls: Vec<&ActionCall> = indices.iter().map(|&i| &calls[i]).collect();
            let results = self.executor.execute_wave(&wave_calls).await;
            for (&i, result) in indices.iter().zip(results) {
                let call = &calls[i];
                if let Some(tier) = runnable[i] {
                    if tier > RiskTier::Low {
                        ctx.run.risk_flags.push(RiskFlag {
                            call_id: call.call_id.clone(),
                            action: call.name.clone(),
                            tier,
                            confirmed: self.gate.requires_confirmation(tier),
                        });
                    }
                }
                let outcome = self.to_outcome(call, result);
                self.emit(LoopEvent::ActionCompleted {
                    run_id: ctx.run.run_id.clone(),
                    call_id: call.call_id.clone(),
                    action: call.name.clone(),
                    ok: outcome.is_success(),
                    preview: preview(&outcome.summary()),
                });
                outcomes[i] = Some(outcome);
            }
            self.flush_outcomes(ctx, &mut outcomes, &mut flushed).await?;
        }

        if deadline_hit {
            for (i, slot) in outcomes.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(ActionOutcome::error(
                        &calls[i].call_id,
                        OutcomeErrorKind::NotExecuted,
                        "not executed: wall-clock deadline passed",
                    ));
                }
            }
        }
        self.flush_outcomes(ctx, &mut outcomes, &mut flushed).await?;

        ctx.run.iteration += 1;
        let elapsed_ms = ctx.elapsed_ms();
        tracing::info!(
            run_id = %ctx.run.run_id,
            iteration = ctx.run.iteration,
            actions = %calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(","),
            outcomes = n,
            elapsed_ms,
            cost_units = ctx.run.cost_units,
            "iteration completed"
        );
        self.emit(LoopEvent::IterationCompleted {
            run_id: ctx.run.run_id.clone(),
            iteration: ctx.run.iteration,
            outcomes: n,
            elapsed_ms,
            cost_units: ctx.run.cost_units,
        });
        self.save_checkpoint(ctx).await?;

        Ok(if deadline_hit {
            BatchEnd::DeadlinePassed
        } else {
            BatchEnd::Continue
        })
    }

    /// 按请求顺序追加已就绪的最长前缀
    async fn flush_outcomes(
        &self,
        ctx: &mut RunCtx,
        outcomes: &mut [Option<ActionOutcome>],
        flushed: &mut usize,
    ) -> Result<(), AgentError> {
        while *flushed < outcomes.len() {
            let Some(outcome) = outcomes[*flushed].take() else {
                break;
            };
            ctx.conversation.append(Entry::ActionOutcome(outcome))?;
            *flushed += 1;
            if self.config.checkpoint_policy == CheckpointPolicy::EveryOutcome {
                self.save_checkpoint(ctx).await?;
            }
        }
        Ok(())
    }

    /// 最近 stuck_window 个已执行批次签名完全相同
    fn detect_stuck(&self, conversation: &ConversationState) -> Option<usize> {
        let window = self.config.stuck_window;
        if window == 0 {
            return None;
        }
        let signatures = conversation.executed_batch_signatures();
        if signatures.len() < window {
            return None;
        }
        let tail = &signatures[signatures.len() - window..];
        tail.iter().all(|s| s == &tail[0]).then_some(window)
    }

    async fn maybe_compact(&self, ctx: &mut RunCtx) {
        let (Some(threshold), Some(compactor)) = (self.config.compaction_token_threshold, &self.compactor) else {
            return;
        };
        if TokenEstimator::estimate_conversation(&ctx.conversation) <= threshold {
            return;
        }
        let before = ctx.conversation.len();
        match compactor.compact(&ctx.conversation).await {
            Ok(Some(entries)) => match ctx.conversation.replace_with(entries) {
                Ok(()) => self.emit(LoopEvent::Compacted {
                    run_id: ctx.run.run_id.clone(),
                    before,
                    after: ctx.conversation.len(),
                }),
                Err(e) => tracing::warn!(run_id = %ctx.run.run_id, error = %e, "compaction result rejected"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(run_id = %ctx.run.run_id, error = %e, "compaction failed"),
        }
    }

    async fn save_checkpoint(&self, ctx: &mut RunCtx) -> Result<(), AgentError> {
        ctx.version += 1;
        let mut run = ctx.run.clone();
        run.active_elapsed_ms = ctx.elapsed_ms();
        let checkpoint = Checkpoint::new(ctx.version, run, ctx.conversation.clone());
        self.store.save(&checkpoint).await?;
        self.emit(LoopEvent::CheckpointSaved {
            run_id: ctx.run.run_id.clone(),
            version: ctx.version,
        });
        Ok(())
    }

    async fn suspend(&self, mut ctx: RunCtx) -> Result<RunResult, AgentError> {
        ctx.run.transition(RunStatus::AwaitingConfirmation)?;
        ctx.run.active_elapsed_ms = ctx.elapsed_ms();
        ctx.segment = Instant::now();
        self.save_checkpoint(&mut ctx).await?;
        let result = self.result(&ctx.run, &ctx.conversation);
        let prompt = result
            .pending
            .as_ref()
            .map(PendingInput::prompt)
            .unwrap_or_default();
        tracing::info!(run_id = %ctx.run.run_id, %prompt, "run suspended awaiting human input");
        self.emit(LoopEvent::Suspended {
            run_id: ctx.run.run_id.clone(),
            prompt,
        });
        Ok(result)
    }

    /// 预算耗尽：可选的收尾回答，然后以 aborted_budget 终止
    async fn abort_budget(&self, mut ctx: RunCtx, kind: BudgetKind) -> Result<RunResult, AgentError> {
        tracing::warn!(run_id = %ctx.run.run_id, budget = %kind, "budget exhausted");
        if self.config.final_answer_on_budget {
            match self.model.complete(ModelRequest::final_answer(&ctx.conversation)).await {
                Ok(reply) => {
                    ctx.run.cost_units += reply.cost_units;
                    if let ReplyContent::Final(text) = reply.content {
                        if !text.is_empty() {
                            ctx.conversation.append(Entry::assistant(text))?;
                        }
                    }
                }
                Err(e) => tracing::warn!(run_id = %ctx.run.run_id, error = %e, "final answer call failed"),
            }
        }
        self.terminate(ctx, AgentError::BudgetExceeded(kind)).await
    }

    /// 由恢复引擎决定终止状态
    async fn terminate(&self, mut ctx: RunCtx, err: AgentError) -> Result<RunResult, AgentError> {
        let status = match self.recovery.handle(&err) {
            RecoveryAction::Terminate(status) => status,
            _ => RunStatus::Failed,
        };
        tracing::warn!(run_id = %ctx.run.run_id, %status, error = %err, "run terminated");
        ctx.run.failure = Some(err.to_string());
        self.finish(ctx, status).await
    }

    async fn finish(&self, mut ctx: RunCtx, status: RunStatus) -> Result<RunResult, AgentError> {
        ctx.run.transition(status)?;
        ctx.run.active_elapsed_ms = ctx.elapsed_ms();
        ctx.segment = Instant::now();
        self.save_checkpoint(&mut ctx).await?;
        if let Err(e) = self.store.prune(&ctx.run.run_id, self.config.keep_checkpoints).await {
            tracing::warn!(run_id = %ctx.run.run_id, error = %e, "checkpoint prune failed");
        }
        tracing::info!(
            run_id = %ctx.run.run_id,
            %status,
            iterations = ctx.run.iteration,
            cost_units = ctx.run.cost_units,
            elapsed_ms = ctx.run.active_elapsed_ms,
            "run finished"
        );
        self.emit(LoopEvent::Finished {
            run_id: ctx.run.run_id.clone(),
            status,
            iterations: ctx.run.iteration,
        });
        Ok(self.result(&ctx.run, &ctx.conversation))
    }

    fn result(&self, run: &Run, conversation: &ConversationState) -> RunResult {
        let final_text = match conversation.entries().last() {
            Some(Entry::AssistantText { text }) => Some(text.clone()),
            _ => None,
        };
        let pending = if run.status == RunStatus::AwaitingConfirmation {
            pending_input(conversation)
        } else {
            None
        };
        RunResult {
            run_id: run.run_id.clone(),
            status: run.status,
            iterations: run.iteration,
            final_text,
            pending,
            failure: run.failure.clone(),
            cost_units: run.cost_units,
            conversation: conversation.clone(),
        }
    }
}

/// 最近一批中被挂起的调用，以及是否含补充参数请求
fn suspended_batch(conversation: &ConversationState) -> Option<(Vec<ActionCall>, bool)> {
    let (idx, calls) = conversation.last_request()?;
    let outcomes = conversation.outcomes_for(idx);
    if outcomes.len() < calls.len() {
        return None;
    }
    let mut blocked = Vec::new();
    let mut clarification = false;
    for outcome in outcomes {
        match outcome.error_kind() {
            Some(OutcomeErrorKind::ClarificationRequired) => clarification = true,
            Some(OutcomeErrorKind::ConfirmationRequired) | Some(OutcomeErrorKind::Deferred) => {
                if let Some(call) = conversation.call(&outcome.call_id) {
                    blocked.push(call.clone());
                }
            }
            _ => {}
        }
    }
    if blocked.is_empty() && !clarification {
        return None;
    }
    Some((blocked, clarification))
}

/// 从对话状态推导挂起提示（不依赖内存状态）
fn pending_input(conversation: &ConversationState) -> Option<PendingInput> {
    let (idx, _) = conversation.last_request()?;
    let outcomes = conversation.outcomes_for(idx);

    let mut reasons = Vec::new();
    let mut actions = Vec::new();
    for outcome in &outcomes {
        if let OutcomeResult::Error(e) = &outcome.result {
            if e.kind == OutcomeErrorKind::ConfirmationRequired {
                reasons.push(e.message.clone());
                if let Some(call) = conversation.call(&outcome.call_id) {
                    actions.push(call.clone());
                }
            }
        }
    }
    if !actions.is_empty() {
        return Some(PendingInput::Confirmation {
            reason: reasons.join("; "),
            actions,
        });
    }

    outcomes.iter().find_map(|outcome| match &outcome.result {
        OutcomeResult::Error(e) if e.kind == OutcomeErrorKind::ClarificationRequired => {
            Some(PendingInput::Clarification {
                action: conversation
                    .call(&outcome.call_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
                missing_fields: e.missing_fields.clone(),
            })
        }
        _ => None,
    })
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
