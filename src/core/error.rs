//! 工作流错误类型
//!
//! 任务级错误（执行器失败）与协作方错误（LLM 输出格式错误）不会走到这里，
//! 它们在各自边界被记录并降级处理；这里只有需要向调用方报告的错误。

use thiserror::Error;

use crate::persistence::StoreError;

/// 引擎对外 API 返回的错误
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// 会话没有可用快照（从未运行、已过期或已删除）
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 会话没有与 request_id 匹配的待处理 HITL 请求
    #[error("No pending HITL request {request_id} for session {session_id}")]
    ResumeRejected {
        session_id: String,
        request_id: String,
    },

    /// 响应选择了请求中不存在的选项
    #[error("Option {option} is not offered by HITL request {request_id}")]
    InvalidOption { request_id: String, option: String },

    /// HITL 请求已超时，不再接受人工响应
    #[error("HITL request {0} has expired")]
    HitlExpired(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}
