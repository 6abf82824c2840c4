//! 工作流引擎：Planner → Executor → 任务执行器 → Step Evaluator → {Reflexion | HITL} → … → Synthesizer
//!
//! 一次运行一次只推进一个任务。每一步之后写入快照；HITL 挂起是唯一的阻塞点，
//! 挂起前先落盘，`resume` 从快照恢复并继续，重复提交同一请求 id 不产生任何效果。
//! 同一会话的 run / resume / expire_pending 由 SessionSupervisor 串行化。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::WorkflowError;
use super::hitl_gate::{self, HitlApplied};
use super::session_supervisor::SessionSupervisor;
use crate::agents::{decide, is_chat_intent, PlanOutcome, Planner, Reflexion, ReflexionAction, Synthesizer, APOLOGY};
use crate::config::{HitlSection, HitlTimeoutPolicy, WorkflowSection};
use crate::executors::{fold_into_context, gather, Branch, DispatchOutcome, TaskDispatcher};
use crate::llm::LlmClient;
use crate::observability::{RunTracer, TraceBus, TraceEventType};
use crate::persistence::{HitlStore, SnapshotStore, SubmitOutcome};
use crate::workflow::{
    ExecutorKind, HitlRecord, HitlRequest, HitlResponse, HitlStatus, RunPhase, Task, TaskStatus,
    WorkflowState,
};

/// 引擎依赖的全部组件，由 EngineBuilder 组装
pub(crate) struct EngineParts {
    pub workflow: WorkflowSection,
    pub hitl: HitlSection,
    pub max_parallel: usize,
    pub planner: Planner,
    pub reflexion: Reflexion,
    pub synthesizer: Synthesizer,
    pub llm: Arc<dyn LlmClient>,
    pub dispatcher: TaskDispatcher,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub hitl_store: Arc<dyn HitlStore>,
    pub bus: Arc<TraceBus>,
}

pub struct WorkflowEngine {
    workflow: WorkflowSection,
    hitl: HitlSection,
    max_parallel: usize,
    planner: Planner,
    reflexion: Reflexion,
    synthesizer: Synthesizer,
    llm: Arc<dyn LlmClient>,
    dispatcher: TaskDispatcher,
    snapshots: Arc<dyn SnapshotStore>,
    hitl_store: Arc<dyn HitlStore>,
    bus: Arc<TraceBus>,
    supervisor: SessionSupervisor,
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

fn task_summaries(tasks: &[Task]) -> Vec<Value> {
    tasks.iter().map(Task::summary).collect()
}

impl WorkflowEngine {
    pub(crate) fn from_parts(parts: EngineParts) -> Self {
        Self {
            workflow: parts.workflow,
            hitl: parts.hitl,
            max_parallel: parts.max_parallel,
            planner: parts.planner,
            reflexion: parts.reflexion,
            synthesizer: parts.synthesizer,
            llm: parts.llm,
            dispatcher: parts.dispatcher,
            snapshots: parts.snapshots,
            hitl_store: parts.hitl_store,
            bus: parts.bus,
            supervisor: SessionSupervisor::new(),
        }
    }

    pub fn trace_bus(&self) -> &Arc<TraceBus> {
        &self.bus
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 创建运行状态与对应的 tracer，调用方可以在 `run_state` 之前订阅事件流
    pub fn begin(&self, session_id: &str, user_input: &str) -> (WorkflowState, Arc<RunTracer>) {
        let state = WorkflowState::new(session_id, user_input, self.workflow.max_retries_per_step);
        let tracer = self.bus.create(&state.run_id, session_id);
        (state, tracer)
    }

    /// 从头运行一个请求，直到完成、失败或挂起等待人工确认
    pub async fn run(&self, session_id: &str, user_input: &str) -> Result<WorkflowState, WorkflowError> {
        let (state, _) = self.begin(session_id, user_input);
        self.run_state(state).await
    }

    /// 新运行取代会话中的旧运行：旧运行遗留的待处理请求全部记为超时
    pub async fn run_state(&self, state: WorkflowState) -> Result<WorkflowState, WorkflowError> {
        let session_id = state.session_id.clone();
        let result = {
            let _guard = self.supervisor.lock(&session_id).await;
            self.run_locked(state).await
        };
        self.supervisor.release(&session_id);
        result
    }

    async fn run_locked(&self, mut state: WorkflowState) -> Result<WorkflowState, WorkflowError> {
        let cancel = self.supervisor.cancel_token(&state.session_id);
        let tracer = self.bus.create(&state.run_id, &state.session_id);
        tracing::info!(run_id = %state.run_id, session_id = %state.session_id, "workflow run started");

        self.retire_previous_run(&state.session_id, Some(&state.run_id)).await?;
        self.plan(&mut state, &tracer).await;
        self.checkpoint(&state).await?;
        if state.phase == RunPhase::Completed {
            self.retire_tracer(&state);
            return Ok(state);
        }
        self.drive(&mut state, &tracer, &cancel).await?;
        Ok(state)
    }

    /// 读取会话最新快照
    pub async fn load_state(&self, session_id: &str) -> Result<WorkflowState, WorkflowError> {
        let blob = self
            .snapshots
            .load(session_id)
            .await?
            .ok_or_else(|| WorkflowError::SessionNotFound(session_id.to_string()))?;
        Ok(WorkflowState::from_snapshot(&blob)?)
    }

    /// 删除会话快照并取消其进行中的运行，待处理的确认请求一并作废
    pub async fn discard(&self, session_id: &str) -> Result<(), WorkflowError> {
        self.supervisor.cancel(session_id);
        let result = {
            let _guard = self.supervisor.lock(session_id).await;
            self.discard_locked(session_id).await
        };
        self.supervisor.release(session_id);
        result
    }

    async fn discard_locked(&self, session_id: &str) -> Result<(), WorkflowError> {
        self.retire_previous_run(session_id, None).await?;
        self.snapshots.delete(session_id).await?;
        Ok(())
    }

    /// 会话中上一次运行的 tracer 移出总线，遗留的待处理请求记为超时
    async fn retire_previous_run(
        &self,
        session_id: &str,
        keep_run: Option<&str>,
    ) -> Result<(), WorkflowError> {
        if let Some(blob) = self.snapshots.load(session_id).await? {
            if let Ok(previous) = WorkflowState::from_snapshot(&blob) {
                if keep_run != Some(previous.run_id.as_str()) {
                    self.bus.remove(&previous.run_id);
                }
            }
        }
        for record in self.hitl_store.pending(session_id).await? {
            if self.hitl_store.mark_timed_out(session_id, &record.request.id).await? {
                tracing::info!(session_id, request_id = %record.request.id, "stale HITL request expired");
            }
        }
        Ok(())
    }

    pub async fn pending_requests(&self, session_id: &str) -> Result<Vec<HitlRecord>, WorkflowError> {
        Ok(self.hitl_store.pending(session_id).await?)
    }

    /// 只把人工响应写入 HITL 存储，不驱动工作流；供 `run_and_wait` 轮询的场景使用
    pub async fn submit_hitl_response(
        &self,
        session_id: &str,
        response: HitlResponse,
    ) -> Result<SubmitOutcome, WorkflowError> {
        if let Some(record) = self.hitl_store.get(session_id, &response.request_id).await? {
            if record.request.option(&response.selected_option).is_none() {
                return Err(WorkflowError::InvalidOption {
                    request_id: response.request_id,
                    option: response.selected_option,
                });
            }
        }
        Ok(self.hitl_store.submit_response(session_id, response).await?)
    }

    /// 应用人工响应并继续运行
    ///
    /// 已应用过的请求 id 直接返回当前快照；没有匹配的待处理请求时返回 ResumeRejected。
    pub async fn resume(
        &self,
        session_id: &str,
        response: HitlResponse,
    ) -> Result<WorkflowState, WorkflowError> {
        let result = {
            let _guard = self.supervisor.lock(session_id).await;
            self.resume_locked(session_id, response).await
        };
        self.supervisor.release(session_id);
        result
    }

    async fn resume_locked(
        &self,
        session_id: &str,
        response: HitlResponse,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.load_state(session_id).await?;

        if state.is_hitl_applied(&response.request_id) {
            tracing::debug!(session_id, request_id = %response.request_id, "HITL response already applied");
            return Ok(state);
        }
        let request = match state.pending_hitl.clone() {
            Some(request) if request.id == response.request_id => request,
            _ => {
                return Err(WorkflowError::ResumeRejected {
                    session_id: session_id.to_string(),
                    request_id: response.request_id,
                })
            }
        };
        if request.option(&response.selected_option).is_none() {
            return Err(WorkflowError::InvalidOption {
                request_id: request.id,
                option: response.selected_option,
            });
        }
        if request.is_expired_at(Utc::now()) {
            self.hitl_store.mark_timed_out(session_id, &request.id).await?;
            return Err(WorkflowError::HitlExpired(request.id));
        }

        let response = match self.hitl_store.submit_response(session_id, response.clone()).await? {
            SubmitOutcome::Applied(_) => response,
            SubmitOutcome::AlreadyFinal(record) => match (record.status, record.response) {
                (HitlStatus::Responded, Some(stored)) => stored,
                _ => return Err(WorkflowError::HitlExpired(request.id)),
            },
            SubmitOutcome::NotFound => {
                tracing::warn!(session_id, request_id = %request.id, "HITL record missing, applying response from snapshot");
                response
            }
        };

        let cancel = self.supervisor.cancel_token(session_id);
        let tracer = self.bus.create(&state.run_id, session_id);
        self.apply_hitl(&mut state, &tracer, &request, &response, false);
        self.checkpoint(&state).await?;
        self.drive(&mut state, &tracer, &cancel).await?;
        Ok(state)
    }

    /// 将待处理请求标记为超时并按配置的策略继续运行；没有待处理请求时原样返回快照
    pub async fn expire_pending(&self, session_id: &str) -> Result<WorkflowState, WorkflowError> {
        let result = {
            let _guard = self.supervisor.lock(session_id).await;
            self.expire_locked(session_id).await
        };
        self.supervisor.release(session_id);
        result
    }

    async fn expire_locked(&self, session_id: &str) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.load_state(session_id).await?;
        let Some(request) = state.pending_hitl.clone() else {
            return Ok(state);
        };

        let cancel = self.supervisor.cancel_token(session_id);
        let tracer = self.bus.create(&state.run_id, session_id);

        if !self.hitl_store.mark_timed_out(session_id, &request.id).await? {
            // 人工响应先于超时到达
            if let Some(record) = self.hitl_store.get(session_id, &request.id).await? {
                if let (HitlStatus::Responded, Some(response)) = (record.status, record.response) {
                    self.apply_hitl(&mut state, &tracer, &request, &response, false);
                    self.checkpoint(&state).await?;
                    self.drive(&mut state, &tracer, &cancel).await?;
                    return Ok(state);
                }
            }
        }

        tracing::warn!(
            session_id,
            request_id = %request.id,
            policy = ?self.hitl.timeout_policy,
            "HITL request timed out"
        );
        let default_response = match self.hitl.timeout_policy {
            HitlTimeoutPolicy::UseDefault => hitl_gate::timeout_response(&request),
            HitlTimeoutPolicy::FailTask => None,
        };
        match default_response {
            Some(response) => self.apply_hitl(&mut state, &tracer, &request, &response, true),
            None => self.fail_hitl_task(&mut state, &tracer, &request),
        }
        self.checkpoint(&state).await?;
        self.drive(&mut state, &tracer, &cancel).await?;
        Ok(state)
    }

    /// 运行并在挂起时轮询 HITL 存储，直到收到响应或超时，然后继续，直至运行结束
    pub async fn run_and_wait(
        &self,
        session_id: &str,
        user_input: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.run(session_id, user_input).await?;
        let poll = Duration::from_millis(self.hitl.poll_interval_ms.max(1));

        while state.phase == RunPhase::WaitingForHuman {
            let Some(request) = state.pending_hitl.clone() else {
                break;
            };
            state = match self.wait_for_response(session_id, &request, poll).await? {
                Some(response) => match self.resume(session_id, response).await {
                    Err(WorkflowError::HitlExpired(_)) => self.expire_pending(session_id).await?,
                    other => other?,
                },
                None => self.expire_pending(session_id).await?,
            };
        }
        Ok(state)
    }

    async fn wait_for_response(
        &self,
        session_id: &str,
        request: &HitlRequest,
        poll: Duration,
    ) -> Result<Option<HitlResponse>, WorkflowError> {
        loop {
            match self.hitl_store.get(session_id, &request.id).await? {
                Some(record) => match record.status {
                    HitlStatus::Responded => return Ok(record.response),
                    HitlStatus::TimedOut => return Ok(None),
                    HitlStatus::Pending => {}
                },
                None => return Ok(None),
            }
            if request.is_expired_at(Utc::now()) {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// 有界并发执行只读的收集分支
    pub async fn gather(&self, branches: Vec<Branch>) -> Vec<(String, Value)> {
        gather(branches, self.max_parallel).await
    }

    async fn checkpoint(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.snapshots
            .save(&state.session_id, state.to_snapshot()?)
            .await?;
        Ok(())
    }

    /// 运行结束后 tracer 不再留在总线上；持有 Arc 的订阅者仍可读完事件流
    fn retire_tracer(&self, state: &WorkflowState) {
        if state.phase.is_terminal() {
            self.bus.remove(&state.run_id);
        }
    }

    fn tokens_spent(&self) -> u64 {
        self.llm.token_usage().2
    }

    /// 记一次 LLM 调用；`since` 为调用前的累计 token 数
    fn count_llm_call(&self, state: &mut WorkflowState, tracer: &RunTracer, since: u64) {
        state.counters.llm_calls += 1;
        let spent = self.tokens_spent().saturating_sub(since);
        tracer.record_llm_call((spent > 0).then_some(spent));
    }

    async fn plan(&self, state: &mut WorkflowState, tracer: &RunTracer) {
        state.phase = RunPhase::Planning;
        let chat = is_chat_intent(&state.user_input);
        if !chat {
            tracer.emit(
                tracer
                    .event(TraceEventType::AgentThinking, serde_json::json!({ "stage": "planning" }))
                    .with_agent("planner"),
            );
        }
        let context = Value::Object(state.context.clone());

        let since = self.tokens_spent();
        let outcome = self.planner.create_plan(&state.user_input, &context).await;
        if !chat {
            self.count_llm_call(state, tracer, since);
        }
        match outcome {
            PlanOutcome::Direct { reasoning } => {
                tracing::info!(run_id = %state.run_id, "direct response, no tasks planned");
                state.plan_reasoning = reasoning.clone();
                tracer.emit(tracer.event(
                    TraceEventType::PlanCreated,
                    serde_json::json!({ "reasoning": reasoning, "direct_response": true, "tasks": [] }),
                ));
                let since = self.tokens_spent();
                state.final_response = Some(self.synthesizer.direct_reply(&state.user_input).await);
                self.count_llm_call(state, tracer, since);
                self.synthesizer.synthesize(state, tracer).await;
                state.phase = RunPhase::Completed;
            }
            PlanOutcome::Plan { reasoning, tasks } => {
                tracing::info!(run_id = %state.run_id, tasks = tasks.len(), "plan created");
                state.plan_reasoning = reasoning.clone();
                state.replace_plan_suffix(tasks);
                state.phase = RunPhase::Executing;
                tracer.emit(tracer.event(
                    TraceEventType::PlanCreated,
                    serde_json::json!({
                        "reasoning": reasoning,
                        "tasks": task_summaries(state.tasks()),
                    }),
                ));
            }
        }
    }

    /// 主循环：每轮处理一次重规划或一个任务，直到计划走完、挂起或运行级失败
    async fn drive(
        &self,
        state: &mut WorkflowState,
        tracer: &RunTracer,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        loop {
            if cancel.is_cancelled() {
                self.fail_run(state, tracer, "run cancelled").await?;
                return Err(WorkflowError::Cancelled);
            }
            if state.counters.iterations >= self.workflow.max_iterations {
                self.fail_run(state, tracer, "iteration limit reached").await?;
                return Ok(());
            }
            state.counters.iterations += 1;

            if state.needs_replan {
                if state.counters.replans >= self.workflow.max_replans {
                    self.fail_run(state, tracer, "replan budget exhausted").await?;
                    return Ok(());
                }
                self.replan(state, tracer).await;
                self.checkpoint(state).await?;
                continue;
            }

            let Some((kind, description)) = self.start_step(state, tracer) else {
                self.synthesizer.synthesize(state, tracer).await;
                state.phase = RunPhase::Completed;
                self.checkpoint(state).await?;
                self.retire_tracer(state);
                tracing::info!(
                    run_id = %state.run_id,
                    completed = state.completed_tasks().count(),
                    failed = state.failed_tasks().count(),
                    "workflow run completed"
                );
                return Ok(());
            };

            let context = Value::Object(state.context.clone());
            let outcome = tokio::select! {
                outcome = self.dispatcher.dispatch(kind, &description, context) => outcome,
                _ = cancel.cancelled() => {
                    self.fail_run(state, tracer, "run cancelled").await?;
                    return Err(WorkflowError::Cancelled);
                }
            };

            if self.evaluate(state, tracer, outcome) {
                let request = state.current_task().and_then(|t| {
                    hitl_gate::detect(t, self.hitl.risk_threshold, self.hitl.timeout_secs)
                });
                if let Some(request) = request {
                    self.suspend(state, tracer, request).await?;
                    return Ok(());
                }
                state.advance();
            } else {
                self.reflect(state, tracer).await;
            }
            self.checkpoint(state).await?;
        }
    }

    /// Executor：标记当前任务开始；计划已走完时返回 None
    fn start_step(&self, state: &mut WorkflowState, tracer: &RunTracer) -> Option<(ExecutorKind, String)> {
        let task = state.current_task_mut()?;
        task.status = TaskStatus::InProgress;
        task.error = None;
        let (kind, description) = (task.executor, task.description.clone());

        tracer.emit(
            tracer
                .event(
                    TraceEventType::StepStarted,
                    serde_json::json!({
                        "task_id": task.id,
                        "description": task.description,
                        "retry_count": task.retry_count,
                    }),
                )
                .with_step(task.step_number)
                .with_agent(kind.as_str()),
        );
        tracer.emit(
            tracer
                .event(TraceEventType::ToolCalled, serde_json::json!({ "description": description }))
                .with_step(task.step_number)
                .with_agent(kind.as_str()),
        );
        Some((kind, description))
    }

    /// Step Evaluator：记录分发结果，返回任务是否成功
    fn evaluate(&self, state: &mut WorkflowState, tracer: &RunTracer, outcome: DispatchOutcome) -> bool {
        let Some(task) = state.current_task_mut() else {
            return false;
        };
        task.duration_ms = Some(outcome.duration_ms);
        let step = task.step_number;
        let agent = outcome.kind.as_str();

        match outcome.result {
            Ok(success) => {
                task.status = TaskStatus::Completed;
                task.error = None;
                task.result = Some(success.raw.clone());
                task.output = success.output.clone();

                fold_into_context(&mut state.context, outcome.kind, &success.raw, success.output.as_ref());
                let result_preview = preview(&success.raw, 500);
                tracer.emit(
                    tracer
                        .event(TraceEventType::ToolResult, serde_json::json!({ "result": result_preview }))
                        .with_step(step)
                        .with_agent(agent)
                        .with_duration(outcome.duration_ms),
                );
                tracer.emit(
                    tracer
                        .event(
                            TraceEventType::StepCompleted,
                            serde_json::json!({
                                "result": result_preview,
                                "structured": success.output.is_some(),
                            }),
                        )
                        .with_step(step)
                        .with_agent(agent)
                        .with_duration(outcome.duration_ms),
                );
                true
            }
            Err(error) => {
                task.status = TaskStatus::Failed;
                task.error = Some(error.clone());
                state.counters.errors += 1;
                tracing::warn!(run_id = %state.run_id, step, agent, error = %error, "task failed");
                tracer.emit(
                    tracer
                        .event(TraceEventType::StepFailed, serde_json::json!({ "error": error }))
                        .with_step(step)
                        .with_agent(agent)
                        .with_duration(outcome.duration_ms),
                );
                false
            }
        }
    }

    async fn reflect(&self, state: &mut WorkflowState, tracer: &RunTracer) {
        let Some(task) = state.current_task().cloned() else {
            return;
        };
        let error = task.error.clone().unwrap_or_default();
        let history = state
            .recent_memories(self.workflow.reflexion_history_limit)
            .to_vec();
        let context = Value::Object(state.context.clone());

        tracer.emit(
            tracer
                .event(
                    TraceEventType::AgentThinking,
                    serde_json::json!({ "stage": "reflexion", "error": error }),
                )
                .with_step(task.step_number)
                .with_agent("reflexion"),
        );
        let since = self.tokens_spent();
        let decision = self.reflexion.reflect(&task, &error, &context, &history).await;
        self.count_llm_call(state, tracer, since);
        state.reflexion_memories.push(decision.to_memory(&task.id));
        let action = decide(&decision, task.retry_count, state.max_retries_per_step);

        tracing::info!(run_id = %state.run_id, step = task.step_number, action = action.as_str(), "reflexion");
        tracer.emit(
            tracer
                .event(
                    TraceEventType::Reflexion,
                    serde_json::json!({
                        "action": action.as_str(),
                        "failure_reason": decision.failure_reason,
                        "lesson_learned": decision.lesson_learned,
                        "revised_approach": decision.revised_approach,
                        "retry_count": task.retry_count,
                    }),
                )
                .with_step(task.step_number)
                .with_agent(task.executor.as_str()),
        );

        match action {
            ReflexionAction::Retry => {
                if let Some(current) = state.current_task_mut() {
                    current.status = TaskStatus::Pending;
                    current.error = None;
                    current.retry_count += 1;
                }
            }
            ReflexionAction::Replan => {
                state.needs_replan = true;
                state.replan_reason = Some(decision.failure_reason);
            }
            ReflexionAction::Skip => {
                state.advance();
            }
        }
    }

    /// 保留已处理前缀，为剩余工作重新规划
    async fn replan(&self, state: &mut WorkflowState, tracer: &RunTracer) {
        let failed = state.current_task().cloned();
        let completed: Vec<Task> = state
            .processed_prefix()
            .iter()
            .filter(|t| t.is_completed())
            .cloned()
            .collect();
        let reason = state.replan_reason.clone().unwrap_or_default();
        let lesson = state
            .reflexion_memories
            .last()
            .map(|m| m.lesson_learned.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| reason.clone());

        let since = self.tokens_spent();
        let (reasoning, tasks) = self
            .planner
            .replan(&state.user_input, &completed, failed.as_ref(), &lesson)
            .await;
        self.count_llm_call(state, tracer, since);
        state.counters.replans += 1;

        let preserved = state.current_task_index();
        tracing::info!(run_id = %state.run_id, preserved, new_tasks = tasks.len(), "replanning");
        tracer.emit(tracer.event(
            TraceEventType::Replan,
            serde_json::json!({
                "reason": reason,
                "reasoning": reasoning,
                "preserved_tasks": preserved,
            }),
        ));

        state.replace_plan_suffix(tasks);
        state.plan_reasoning = reasoning.clone();
        tracer.emit(tracer.event(
            TraceEventType::PlanUpdated,
            serde_json::json!({
                "reasoning": reasoning,
                "resume_at": state.current_task_index(),
                "tasks": task_summaries(state.tasks()),
            }),
        ));
    }

    async fn suspend(
        &self,
        state: &mut WorkflowState,
        tracer: &RunTracer,
        request: HitlRequest,
    ) -> Result<(), WorkflowError> {
        self.hitl_store
            .create(HitlRecord::pending(&state.session_id, request.clone()))
            .await?;
        state.pending_hitl = Some(request.clone());
        state.phase = RunPhase::WaitingForHuman;
        self.checkpoint(state).await?;

        tracing::info!(
            run_id = %state.run_id,
            request_id = %request.id,
            kind = ?request.kind,
            "waiting for human confirmation"
        );
        let (step, agent) = state
            .current_task()
            .map(|t| (t.step_number, t.executor.as_str()))
            .unwrap_or((0, ""));
        tracer.emit(
            tracer
                .event(
                    TraceEventType::HitlWaiting,
                    serde_json::json!({ "request": serde_json::to_value(&request)? }),
                )
                .with_step(step)
                .with_agent(agent),
        );
        Ok(())
    }

    /// 应用响应并前进到下一个任务
    fn apply_hitl(
        &self,
        state: &mut WorkflowState,
        tracer: &RunTracer,
        request: &HitlRequest,
        response: &HitlResponse,
        timed_out: bool,
    ) {
        let applied = hitl_gate::apply_response(state, request, response);
        state.phase = RunPhase::Executing;

        let step = state.current_task().map(|t| t.step_number).unwrap_or(0);
        tracer.emit(
            tracer
                .event(
                    TraceEventType::HitlResumed,
                    serde_json::json!({
                        "request_id": request.id,
                        "selected_option": response.selected_option,
                        "timed_out": timed_out,
                        "aborted": applied == HitlApplied::Aborted,
                    }),
                )
                .with_step(step),
        );
        if applied == HitlApplied::Aborted {
            tracer.emit(
                tracer
                    .event(
                        TraceEventType::StepFailed,
                        serde_json::json!({ "error": "aborted at human confirmation" }),
                    )
                    .with_step(step),
            );
        }
        state.advance();
    }

    /// 超时策略 fail_task：任务记为失败，不经过 Reflexion，直接前进
    fn fail_hitl_task(&self, state: &mut WorkflowState, tracer: &RunTracer, request: &HitlRequest) {
        state.pending_hitl = None;
        state.mark_hitl_applied(&request.id);
        state.phase = RunPhase::Executing;
        let mut step = 0;
        if let Some(task) = state.task_by_id_mut(&request.task_id) {
            task.status = TaskStatus::Failed;
            task.error = Some("人工确认超时".to_string());
            step = task.step_number;
        }
        state.counters.errors += 1;

        tracer.emit(
            tracer
                .event(
                    TraceEventType::HitlResumed,
                    serde_json::json!({
                        "request_id": request.id,
                        "timed_out": true,
                        "policy": "fail_task",
                    }),
                )
                .with_step(step),
        );
        tracer.emit(
            tracer
                .event(TraceEventType::StepFailed, serde_json::json!({ "error": "HITL timed out" }))
                .with_step(step),
        );
        state.advance();
    }

    /// 运行级失败：致歉回复 + error 事件，不留下挂起的确认请求
    async fn fail_run(
        &self,
        state: &mut WorkflowState,
        tracer: &RunTracer,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        tracing::warn!(run_id = %state.run_id, reason, "workflow run failed");
        state.pending_hitl = None;
        state.phase = RunPhase::Failed;
        state.final_response = Some(APOLOGY.to_string());

        tracer.emit(tracer.event(
            TraceEventType::ResponseChunk,
            serde_json::json!({ "chunk": APOLOGY }),
        ));
        tracer.emit(tracer.event(
            TraceEventType::Error,
            serde_json::json!({ "message": reason, "metrics": tracer.metrics() }),
        ));
        self.checkpoint(state).await?;
        self.retire_tracer(state);
        Ok(())
    }
}
