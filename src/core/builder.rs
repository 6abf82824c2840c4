//! 引擎构建器：统一的组件初始化逻辑
//!
//! 按配置选择 LLM 后端、存储后端与执行器端点；测试与嵌入方可以逐项替换。

use std::sync::Arc;
use std::time::Duration;

use super::engine::{EngineParts, WorkflowEngine};
use super::error::WorkflowError;
use crate::agents::{Planner, Reflexion, Synthesizer};
use crate::config::AppConfig;
use crate::executors::{registry_from_endpoints, ExecutorRegistry, TaskDispatcher, TaskExecutor};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::observability::TraceBus;
use crate::persistence::{HitlStore, MemoryStore, SnapshotStore, SqliteStore, TraceSink};

pub struct EngineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    executors: Option<ExecutorRegistry>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    hitl_store: Option<Arc<dyn HitlStore>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    executor_timeout: Option<Duration>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            executors: None,
            snapshots: None,
            hitl_store: None,
            trace_sink: None,
            executor_timeout: None,
        }
    }

    /// 指定推理协作方；不指定时按 [llm] 段构建
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 整体替换执行器注册表；不指定时按 [executors].endpoints 构建 HTTP 执行器
    pub fn with_executors(mut self, registry: ExecutorRegistry) -> Self {
        self.executors = Some(registry);
        self
    }

    /// 追加（或覆盖同种类的）单个执行器
    pub fn with_executor(mut self, executor: impl TaskExecutor + 'static) -> Self {
        self.executors
            .get_or_insert_with(ExecutorRegistry::new)
            .register(executor);
        self
    }

    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = Some(timeout);
        self
    }

    /// 快照、HITL 记录与 Trace 事件都写入同一个 SQLite 文件
    pub fn with_sqlite_store(mut self, store: Arc<SqliteStore>) -> Self {
        self.snapshots = Some(store.clone());
        self.hitl_store = Some(store.clone());
        self.trace_sink = Some(store);
        self
    }

    pub fn with_memory_store(mut self, store: Arc<MemoryStore>) -> Self {
        self.snapshots = Some(store.clone());
        self.hitl_store = Some(store);
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_hitl_store(mut self, store: Arc<dyn HitlStore>) -> Self {
        self.hitl_store = Some(store);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 构建 LLM 客户端：provider = mock 或缺少 OPENAI_API_KEY 时使用 Mock（所有组件走规则降级）
    pub fn build_llm(&self) -> Result<Arc<dyn LlmClient>, WorkflowError> {
        let llm = &self.config.llm;
        match llm.provider.to_lowercase().as_str() {
            "mock" => Ok(Arc::new(MockLlmClient)),
            "openai" => match std::env::var("OPENAI_API_KEY") {
                Ok(key) if !key.trim().is_empty() => {
                    tracing::info!(model = %llm.model, "using OpenAI-compatible reasoning backend");
                    Ok(Arc::new(
                        OpenAiClient::new(llm.base_url.as_deref(), &llm.model, Some(&key))
                            .with_timeout(Duration::from_secs(llm.request_timeout_secs))
                            .with_temperature(llm.temperature),
                    ))
                }
                _ => {
                    tracing::warn!("OPENAI_API_KEY not set, falling back to mock reasoning backend");
                    Ok(Arc::new(MockLlmClient))
                }
            },
            other => Err(WorkflowError::Config(format!("unknown llm provider: {}", other))),
        }
    }

    fn default_stores(
        &self,
    ) -> Result<(Arc<dyn SnapshotStore>, Arc<dyn HitlStore>, Option<Arc<dyn TraceSink>>), WorkflowError> {
        let storage = &self.config.storage;
        match storage.sqlite_path {
            Some(ref path) => {
                let store = Arc::new(SqliteStore::open(path, storage.snapshot_ttl_secs)?);
                tracing::info!(path = %path.display(), "using sqlite snapshot store");
                let snapshots: Arc<dyn SnapshotStore> = store.clone();
                let hitl: Arc<dyn HitlStore> = store.clone();
                let sink: Arc<dyn TraceSink> = store;
                Ok((snapshots, hitl, Some(sink)))
            }
            None => {
                let store = Arc::new(MemoryStore::new(
                    storage.snapshot_ttl_secs,
                    storage.max_snapshots,
                ));
                let snapshots: Arc<dyn SnapshotStore> = store.clone();
                let hitl: Arc<dyn HitlStore> = store;
                Ok((snapshots, hitl, None))
            }
        }
    }

    pub fn build(self) -> Result<WorkflowEngine, WorkflowError> {
        let llm = match self.llm {
            Some(ref llm) => llm.clone(),
            None => self.build_llm()?,
        };

        let (snapshots, hitl_store, sink) = match (self.snapshots.clone(), self.hitl_store.clone()) {
            (Some(snapshots), Some(hitl_store)) => (snapshots, hitl_store, self.trace_sink.clone()),
            (snapshots, hitl_store) => {
                let (default_snapshots, default_hitl, default_sink) = self.default_stores()?;
                (
                    snapshots.unwrap_or(default_snapshots),
                    hitl_store.unwrap_or(default_hitl),
                    self.trace_sink.clone().or(default_sink),
                )
            }
        };

        let executors_cfg = &self.config.executors;
        let registry = match self.executors {
            Some(registry) => registry,
            None => registry_from_endpoints(&executors_cfg.endpoints, executors_cfg.timeout_secs),
        };
        if registry.is_empty() {
            tracing::warn!("no task executors configured, every step will fail");
        }
        let mut dispatcher = TaskDispatcher::new(Arc::new(registry), executors_cfg.timeout_secs);
        if let Some(timeout) = self.executor_timeout {
            dispatcher = dispatcher.with_timeout(timeout);
        }

        let mut bus = TraceBus::new(&self.config.trace);
        if let Some(sink) = sink {
            bus = bus.with_sink(sink);
        }

        Ok(WorkflowEngine::from_parts(EngineParts {
            workflow: self.config.workflow.clone(),
            hitl: self.config.hitl.clone(),
            max_parallel: executors_cfg.max_parallel.max(1),
            planner: Planner::new(llm.clone()),
            reflexion: Reflexion::new(llm.clone()),
            synthesizer: Synthesizer::new(llm.clone()),
            llm,
            dispatcher,
            snapshots,
            hitl_store,
            bus: Arc::new(bus),
        }))
    }
}

/// 便捷函数：加载配置并创建构建器；配置加载失败时使用默认值
pub fn create_engine_builder(config_path: Option<std::path::PathBuf>) -> EngineBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    EngineBuilder::new(config)
}
