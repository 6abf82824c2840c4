//! 工作流状态
//!
//! WorkflowState 是一次运行的完整状态，也是快照存储的序列化单元。
//! 当前任务下标只能通过 `advance()` 与 `replace_plan_suffix()` 修改：
//! 前者只向前走一步，后者在保留前缀的前提下替换后续计划，下标停在新计划的第一个任务。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::hitl::{HitlRequest, HitlResponse};
use super::types::{ReflexionMemory, Task, TaskStatus};

/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Executing,
    WaitingForHuman,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

/// 运行计数器
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub errors: u32,
    pub llm_calls: u32,
    pub replans: u32,
    pub iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: String,
    pub session_id: String,
    pub user_input: String,
    pub plan_reasoning: String,
    tasks: Vec<Task>,
    current_task_index: usize,
    pub reflexion_memories: Vec<ReflexionMemory>,
    pub max_retries_per_step: u32,
    pub needs_replan: bool,
    pub replan_reason: Option<String>,
    /// 任务间共享的上下文（执行结果折叠、HITL 选择）
    pub context: Map<String, Value>,
    pub pending_hitl: Option<HitlRequest>,
    pub last_hitl_response: Option<HitlResponse>,
    /// 已应用过的 HITL 请求 id，重复 resume 据此判定为空操作
    pub applied_hitl_ids: Vec<String>,
    pub counters: RunCounters,
    pub final_response: Option<String>,
    pub phase: RunPhase,
}

impl WorkflowState {
    pub fn new(
        session_id: impl Into<String>,
        user_input: impl Into<String>,
        max_retries_per_step: u32,
    ) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            user_input: user_input.into(),
            plan_reasoning: String::new(),
            tasks: Vec::new(),
            current_task_index: 0,
            reflexion_memories: Vec::new(),
            max_retries_per_step,
            needs_replan: false,
            replan_reason: None,
            context: Map::new(),
            pending_hitl: None,
            last_hitl_response: None,
            applied_hitl_ids: Vec::new(),
            counters: RunCounters::default(),
            final_response: None,
            phase: RunPhase::Planning,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn current_task_index(&self) -> usize {
        self.current_task_index
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current_task_index)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.get_mut(self.current_task_index)
    }

    pub fn task_by_id_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// 所有任务都已处理
    pub fn is_plan_exhausted(&self) -> bool {
        self.current_task_index >= self.tasks.len()
    }

    /// 前进一步；已在末尾时返回 false
    pub fn advance(&mut self) -> bool {
        if self.is_plan_exhausted() {
            return false;
        }
        self.current_task_index += 1;
        true
    }

    /// 已处理的前缀（当前下标之前的任务）
    pub fn processed_prefix(&self) -> &[Task] {
        &self.tasks[..self.current_task_index]
    }

    /// 保留已处理前缀，用新任务替换其余部分；新任务从前缀长度 + 1 起重新编号
    pub fn replace_plan_suffix(&mut self, new_tasks: Vec<Task>) {
        let prefix_len = self.current_task_index;
        self.tasks.truncate(prefix_len);
        for (offset, mut task) in new_tasks.into_iter().enumerate() {
            task.step_number = (prefix_len + offset + 1) as u32;
            self.tasks.push(task);
        }
        self.needs_replan = false;
        self.replan_reason = None;
    }

    pub fn completed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Completed)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }

    /// 最近 limit 条反思记忆（按时间顺序）
    pub fn recent_memories(&self, limit: usize) -> &[ReflexionMemory] {
        let start = self.reflexion_memories.len().saturating_sub(limit);
        &self.reflexion_memories[start..]
    }

    pub fn is_hitl_applied(&self, request_id: &str) -> bool {
        self.applied_hitl_ids.iter().any(|id| id == request_id)
    }

    pub fn mark_hitl_applied(&mut self, request_id: impl Into<String>) {
        let id = request_id.into();
        if !self.is_hitl_applied(&id) {
            self.applied_hitl_ids.push(id);
        }
    }

    pub fn to_snapshot(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从快照恢复；下标越界的快照会被截到计划末尾
    pub fn from_snapshot(blob: &str) -> Result<Self, serde_json::Error> {
        let mut state: Self = serde_json::from_str(blob)?;
        state.current_task_index = state.current_task_index.min(state.tasks.len());
        Ok(state)
    }
}
