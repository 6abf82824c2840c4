//! 持久化：工作流快照、HITL 记录与 Trace 事件
//!
//! 两种后端：内存（MemoryStore，进程内有效）与 SQLite（SqliteStore，跨重启恢复）。
//! 快照是 WorkflowState 的 JSON 序列化文本，按 session 存储并带 TTL。

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::observability::TraceEvent;
use crate::workflow::{HitlRecord, HitlResponse};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(String),
}

/// 工作流快照存储
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, session_id: &str, blob: String) -> Result<(), StoreError>;

    /// 不存在或已过期时返回 None
    async fn load(&self, session_id: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
}

/// 提交人工响应的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 记录由 pending 转为 responded
    Applied(HitlRecord),
    /// 记录已是终态（responded / timed_out），本次提交被忽略
    AlreadyFinal(HitlRecord),
    NotFound,
}

/// HITL 请求存储，按 (session, request_id) 索引
#[async_trait]
pub trait HitlStore: Send + Sync {
    async fn create(&self, record: HitlRecord) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str, request_id: &str)
        -> Result<Option<HitlRecord>, StoreError>;

    /// 会话下所有 pending 记录
    async fn pending(&self, session_id: &str) -> Result<Vec<HitlRecord>, StoreError>;

    async fn submit_response(
        &self,
        session_id: &str,
        response: HitlResponse,
    ) -> Result<SubmitOutcome, StoreError>;

    /// pending -> timed_out；记录不是 pending 时返回 false
    async fn mark_timed_out(&self, session_id: &str, request_id: &str) -> Result<bool, StoreError>;
}

/// Trace 事件的持久化落点；在发射线程同步调用，失败只记日志
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}
