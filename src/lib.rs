//! 管道能耗智能体编排核心
//!
//! 模块划分：
//! - **agents**: Planner、Reflexion、Synthesizer 与提示词
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 工作流引擎、构建器、HITL 关口、会话监管
//! - **executors**: 任务执行器注册表、分发、HTTP 适配与并行收集
//! - **llm**: 推理协作方客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化、Trace 事件与事件总线
//! - **persistence**: 快照、HITL 记录与 Trace 事件存储（内存 / SQLite）
//! - **workflow**: 任务、状态与 HITL 数据模型

pub mod agents;
pub mod config;
pub mod core;
pub mod executors;
pub mod llm;
pub mod observability;
pub mod persistence;
pub mod workflow;

pub use crate::core::{EngineBuilder, WorkflowEngine, WorkflowError};
