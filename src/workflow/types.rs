//! 工作流类型定义
//!
//! 任务、执行器种类、任务状态与反思记忆。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 五类任务执行器（序列化名与规划 JSON 中的 agent 字段一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorKind {
    #[serde(rename = "data_agent")]
    Data,
    #[serde(rename = "calc_agent")]
    Calc,
    #[serde(rename = "knowledge_agent")]
    Knowledge,
    #[serde(rename = "graph_agent")]
    Graph,
    #[serde(rename = "report_agent")]
    Report,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 5] = [
        ExecutorKind::Data,
        ExecutorKind::Calc,
        ExecutorKind::Knowledge,
        ExecutorKind::Graph,
        ExecutorKind::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Data => "data_agent",
            ExecutorKind::Calc => "calc_agent",
            ExecutorKind::Knowledge => "knowledge_agent",
            ExecutorKind::Graph => "graph_agent",
            ExecutorKind::Report => "report_agent",
        }
    }

    /// 把 LLM 给出的任意执行器名映射到最接近的已知种类，无法识别时归为 knowledge
    pub fn normalize(raw: &str) -> Self {
        let value = raw.trim().to_lowercase();
        if let Some(kind) = Self::ALL.iter().find(|k| k.as_str() == value) {
            return *kind;
        }
        if value.contains("data") {
            ExecutorKind::Data
        } else if value.contains("calc") || value.contains("compute") {
            ExecutorKind::Calc
        } else if value.contains("graph") {
            ExecutorKind::Graph
        } else if value.contains("report") {
            ExecutorKind::Report
        } else {
            ExecutorKind::Knowledge
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// 计划中的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// 在计划中的序号（从 1 开始）
    pub step_number: u32,
    pub description: String,
    pub executor: ExecutorKind,
    pub expected_output: String,
    /// 依赖的任务序号；只作说明，执行严格按列表顺序
    pub depends_on: Vec<u32>,
    pub status: TaskStatus,
    /// 执行器返回的原始文本
    pub result: Option<String>,
    /// 原始文本是 JSON 时的解析结果
    pub output: Option<Value>,
    /// 仅在 Failed 时存在
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
}

impl Task {
    pub fn new(step_number: u32, executor: ExecutorKind, description: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            step_number,
            description: description.into(),
            executor,
            expected_output: String::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            output: None,
            error: None,
            duration_ms: None,
            retry_count: 0,
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<u32>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// 提供给 LLM 的精简视图
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "step_number": self.step_number,
            "description": self.description,
            "agent": self.executor.as_str(),
            "status": self.status,
            "result": self.result,
            "error": self.error,
        })
    }
}

/// 一次失败分析的记录；只追加，跨重规划保留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflexionMemory {
    pub task_id: String,
    pub failure_reason: String,
    pub lesson_learned: String,
    pub revised_approach: String,
    /// RFC3339
    pub timestamp: String,
}
