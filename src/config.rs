//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PIPELINE__*` 覆盖（双下划线表示嵌套，如 `PIPELINE__HITL__TIMEOUT_SECS=60`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub workflow: WorkflowSection,
    pub hitl: HitlSection,
    pub trace: TraceSection,
    pub storage: StorageSection,
    pub executors: ExecutorsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；openai 需要 OPENAI_API_KEY
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
            temperature: 0.1,
        }
    }
}

/// [workflow] 段：重试、重规划与循环上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// 单个任务的重试预算
    pub max_retries_per_step: u32,
    /// 单次运行允许的重规划次数，超出视为运行级失败
    pub max_replans: u32,
    /// 主循环步数上限，防止死循环
    pub max_iterations: u32,
    /// 反思时回传给 LLM 的历史条数
    pub reflexion_history_limit: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_retries_per_step: 2,
            max_replans: 3,
            max_iterations: 50,
            reflexion_history_limit: 3,
        }
    }
}

/// HITL 超时后的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlTimeoutPolicy {
    /// 采用默认选项（无默认选项时自动选择最优方案）继续执行
    UseDefault,
    /// 将当前任务标记为失败并跳过
    FailTask,
}

/// [hitl] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HitlSection {
    pub timeout_secs: u64,
    /// risk_score 达到该阈值时发起风险确认
    pub risk_threshold: f64,
    pub timeout_policy: HitlTimeoutPolicy,
    /// run_and_wait 轮询 HITL 存储的间隔（毫秒）
    pub poll_interval_ms: u64,
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            risk_threshold: 0.8,
            timeout_policy: HitlTimeoutPolicy::UseDefault,
            poll_interval_ms: 500,
        }
    }
}

/// [trace] 段：流式推送心跳与总超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraceSection {
    pub heartbeat_secs: u64,
    pub stream_timeout_secs: u64,
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            stream_timeout_secs: 300,
        }
    }
}

/// [storage] 段：未设置 sqlite_path 时使用内存存储
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub sqlite_path: Option<PathBuf>,
    pub snapshot_ttl_secs: u64,
    /// 内存快照存储的最大会话数
    pub max_snapshots: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            snapshot_ttl_secs: 3600,
            max_snapshots: 1000,
        }
    }
}

/// [executors] 段：超时、并发与各执行器服务地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorsSection {
    pub timeout_secs: u64,
    /// gather 并行收集的最大并发数
    pub max_parallel: usize,
    /// 执行器名（data_agent / calc_agent ...）-> HTTP 端点
    pub endpoints: HashMap<String, String>,
}

impl Default for ExecutorsSection {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_parallel: 3,
            endpoints: HashMap::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 PIPELINE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PIPELINE__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PIPELINE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.workflow.max_retries_per_step, 2);
        assert_eq!(cfg.hitl.timeout_secs, 300);
        assert_eq!(cfg.hitl.timeout_policy, HitlTimeoutPolicy::UseDefault);
        assert_eq!(cfg.storage.snapshot_ttl_secs, 3600);
        assert!(cfg.executors.endpoints.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[llm]\ntemperature = 0.7\n\n[workflow]\nmax_retries_per_step = 5\n\n[hitl]\ntimeout_policy = \"fail_task\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.temperature, 0.7);
        assert_eq!(cfg.llm.request_timeout_secs, 60);
        assert_eq!(cfg.workflow.max_retries_per_step, 5);
        assert_eq!(cfg.workflow.max_replans, 3);
        assert_eq!(cfg.hitl.timeout_policy, HitlTimeoutPolicy::FailTask);
    }
}
