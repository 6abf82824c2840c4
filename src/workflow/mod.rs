//! 工作流数据模型：任务、运行状态与人工确认

pub mod hitl;
pub mod state;
pub mod types;

pub use hitl::{HitlKind, HitlOption, HitlRecord, HitlRequest, HitlResponse, HitlStatus};
pub use state::{RunCounters, RunPhase, WorkflowState};
pub use types::{ExecutorKind, ReflexionMemory, Task, TaskStatus};
