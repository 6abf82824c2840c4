//! 任务分发边界
//!
//! 在独立的 tokio 任务中调用执行器并施加超时（panic 转为任务错误），
//! 对返回文本做软失败判定，每次调用输出一行 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use super::registry::ExecutorRegistry;
use crate::workflow::ExecutorKind;

/// 执行器以文本形式报告失败时使用的前缀
const ERROR_PREFIXES: &[&str] = &[
    "error",
    "failed",
    "cannot connect",
    "查询失败",
    "数据查询失败",
    "计算失败",
    "知识检索失败",
    "知识图谱查询失败",
    "报告生成失败",
    "执行失败",
    "错误",
];

/// 超过该长度的文本不按前缀判定为失败
const SOFT_FAILURE_MAX_CHARS: usize = 300;

/// 执行器返回文本的判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// 成功；文本是 JSON 时附带解析结果
    Success(Option<Value>),
    SoftFailure(String),
}

/// 判定执行器返回的文本是否为软失败
pub fn classify(raw: &str) -> Classified {
    let trimmed = raw.trim();
    let decoded: Option<Value> = serde_json::from_str(trimmed).ok();

    if let Some(Value::Object(ref obj)) = decoded {
        if obj.len() == 1 {
            if let Some(err) = obj.get("error") {
                let msg = match err {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return Classified::SoftFailure(msg);
            }
        }
    }

    if trimmed.chars().count() <= SOFT_FAILURE_MAX_CHARS {
        let lower = trimmed.to_lowercase();
        if ERROR_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return Classified::SoftFailure(trimmed.to_string());
        }
    }

    Classified::Success(decoded)
}

/// 把成功结果折叠进共享上下文：JSON 对象的每个顶层键，以及 `<executor>_result`
pub fn fold_into_context(
    context: &mut Map<String, Value>,
    kind: ExecutorKind,
    raw: &str,
    output: Option<&Value>,
) {
    if let Some(Value::Object(obj)) = output {
        for (k, v) in obj {
            context.insert(k.clone(), v.clone());
        }
    }
    let stored = match output {
        Some(v) => v.clone(),
        None => Value::String(raw.to_string()),
    };
    context.insert(format!("{}_result", kind.as_str()), stored);
}

/// 一次分发的结果
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub kind: ExecutorKind,
    pub duration_ms: u64,
    pub result: Result<DispatchSuccess, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSuccess {
    pub raw: String,
    pub output: Option<Value>,
}

/// 任务分发器：持有注册表与单次调用超时
pub struct TaskDispatcher {
    registry: Arc<ExecutorRegistry>,
    timeout: Duration,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn dispatch(
        &self,
        kind: ExecutorKind,
        description: &str,
        context: Value,
    ) -> DispatchOutcome {
        let start = Instant::now();
        let raw = self.invoke(kind, description, context).await;

        let (result, outcome) = match raw {
            Ok(text) => match classify(&text) {
                Classified::Success(output) => (Ok(DispatchSuccess { raw: text, output }), "ok"),
                Classified::SoftFailure(msg) => (Err(msg), "soft_failure"),
            },
            Err(e) => (Err(e), "error"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let audit = serde_json::json!({
            "event": "executor_audit",
            "executor": kind.as_str(),
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration_ms,
            "description_preview": preview(description),
        });
        tracing::info!(audit = %audit.to_string(), "executor");

        DispatchOutcome {
            kind,
            duration_ms,
            result,
        }
    }

    async fn invoke(
        &self,
        kind: ExecutorKind,
        description: &str,
        context: Value,
    ) -> Result<String, String> {
        let executor = self
            .registry
            .get(kind)
            .ok_or_else(|| format!("error: no executor registered for {}", kind))?;
        let description = description.to_string();
        let handle = tokio::spawn(async move { executor.execute(&description, &context).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(format!("error: {} executor panicked", kind))
            }
            Ok(Err(join_err)) => Err(format!("error: {} executor aborted: {}", kind, join_err)),
            Err(_) => {
                abort.abort();
                Err(format!(
                    "error: {} timed out after {}s",
                    kind,
                    self.timeout.as_secs_f64()
                ))
            }
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}
