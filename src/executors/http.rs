//! HTTP 执行器适配
//!
//! 把 `{description, context}` POST 到外部服务，响应体原样作为结果文本。
//! 连接失败与非 2xx 状态转成以 error / failed 开头的短文本，交给软失败判定处理。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::registry::{ExecutorRegistry, TaskExecutor};
use crate::workflow::ExecutorKind;

/// 错误文本中保留的响应体长度
const BODY_PREVIEW_CHARS: usize = 120;

pub struct HttpTaskExecutor {
    kind: ExecutorKind,
    endpoint: String,
    client: Client,
}

impl HttpTaskExecutor {
    pub fn new(kind: ExecutorKind, endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            kind,
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(&self, description: &str, context: &Value) -> Result<String, String> {
        let body = serde_json::json!({
            "description": description,
            "context": context,
        });
        let resp = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Ok(format!("error: {} service timed out", self.kind));
            }
            Err(e) => {
                tracing::warn!(executor = %self.kind, error = %e, "executor service unreachable");
                return Ok(format!("error: cannot connect to {} service", self.kind));
            }
        };

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("error: reading {} response: {}", self.kind, e))?;
        if !status.is_success() {
            let preview: String = text.chars().take(BODY_PREVIEW_CHARS).collect();
            return Ok(format!(
                "failed: {} service returned HTTP {}: {}",
                self.kind,
                status.as_u16(),
                preview
            ));
        }
        Ok(text)
    }
}

/// 按配置的端点（键为执行器名）构建注册表；无法识别的键归一化到最接近的种类
pub fn registry_from_endpoints(
    endpoints: &HashMap<String, String>,
    timeout_secs: u64,
) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    let mut names: Vec<&String> = endpoints.keys().collect();
    names.sort();
    for name in names {
        let kind = ExecutorKind::normalize(name);
        registry.register(HttpTaskExecutor::new(kind, &endpoints[name], timeout_secs));
    }
    registry
}
