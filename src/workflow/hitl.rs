//! 人工确认（HITL）请求、响应与存储记录

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 确认请求种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlKind {
    SchemeSelection,
    ParameterConfirm,
    RiskWarning,
    ReportOutline,
}

/// 可选项；metadata 中带预计结果与完整候选数据（candidate）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub metadata: Value,
}

impl HitlOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// 该选项对应的候选数据；没有候选时返回选项本身的描述
    pub fn candidate(&self) -> Value {
        match self.metadata.get("candidate") {
            Some(c) => c.clone(),
            None => serde_json::json!({ "option_id": self.id, "label": self.label }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    pub id: String,
    pub kind: HitlKind,
    pub title: String,
    pub description: String,
    pub options: Vec<HitlOption>,
    /// 辅助决策的数据
    #[serde(default)]
    pub data: Value,
    pub timeout_secs: u64,
    pub default_option: Option<String>,
    /// 触发该请求的任务
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

impl HitlRequest {
    pub fn new(kind: HitlKind, task_id: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            id: format!("hitl_{}", uuid::Uuid::new_v4()),
            kind,
            title: String::new(),
            description: String::new(),
            options: Vec::new(),
            data: Value::Null,
            timeout_secs,
            default_option: None,
            task_id: task_id.into(),
            created_at: Utc::now(),
        }
    }

    /// 超时过大无法表示时取可表示的最大时间
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| self.created_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn option(&self, id: &str) -> Option<&HitlOption> {
        self.options.iter().find(|o| o.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlResponse {
    pub request_id: String,
    pub selected_option: String,
    /// 用户修改后的数据，覆盖在所选候选之上
    #[serde(default)]
    pub modified_data: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl HitlResponse {
    pub fn select(request_id: impl Into<String>, option_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            selected_option: option_id.into(),
            modified_data: None,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    Pending,
    Responded,
    TimedOut,
}

/// 持久化的请求记录：pending 只会转为 responded 或 timed_out 之一，且只转一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRecord {
    pub session_id: String,
    pub request: HitlRequest,
    pub status: HitlStatus,
    pub response: Option<HitlResponse>,
    pub updated_at: DateTime<Utc>,
}

impl HitlRecord {
    pub fn pending(session_id: impl Into<String>, request: HitlRequest) -> Self {
        Self {
            session_id: session_id.into(),
            request,
            status: HitlStatus::Pending,
            response: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let req = HitlRequest::new(HitlKind::RiskWarning, "task_1", 10);
        assert!(!req.is_expired_at(req.created_at));
        assert!(req.is_expired_at(req.created_at + Duration::seconds(10)));
    }

    #[test]
    fn test_huge_timeout_never_expires() {
        let req = HitlRequest::new(HitlKind::RiskWarning, "task_1", u64::MAX);
        assert_eq!(req.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!req.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_option_candidate_falls_back_to_label() {
        let plain = HitlOption::new("proceed", "继续执行");
        assert_eq!(plain.candidate()["option_id"], "proceed");

        let rich = HitlOption::new("scheme_1", "方案1")
            .with_metadata(serde_json::json!({ "candidate": { "pumps": 3 } }));
        assert_eq!(rich.candidate()["pumps"], 3);
    }

    #[test]
    fn test_kind_serde() {
        let s = serde_json::to_string(&HitlKind::SchemeSelection).unwrap();
        assert_eq!(s, "\"scheme_selection\"");
    }
}
