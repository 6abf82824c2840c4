//! 核心编排层：错误、工作流引擎、构建器、HITL 关口与会话监管

pub mod builder;
pub mod engine;
pub mod error;
pub mod hitl_gate;
pub mod session_supervisor;

pub use builder::{create_engine_builder, EngineBuilder};
pub use engine::WorkflowEngine;
pub use error::WorkflowError;
pub use hitl_gate::{auto_select_scheme, HitlApplied};
pub use session_supervisor::SessionSupervisor;
