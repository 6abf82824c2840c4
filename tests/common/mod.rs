//! 集成测试共用的脚本化执行器与引擎构建

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipeline_agent::config::AppConfig;
use pipeline_agent::executors::{ExecutorRegistry, TaskExecutor};
use pipeline_agent::llm::LlmClient;
use pipeline_agent::persistence::MemoryStore;
use pipeline_agent::workflow::ExecutorKind;
use pipeline_agent::{EngineBuilder, WorkflowEngine};
use serde_json::Value;

/// 按顺序返回预置结果，脚本耗尽后重复最后一条
pub struct ScriptedExecutor {
    kind: ExecutorKind,
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<Value>>,
}

impl ScriptedExecutor {
    pub fn new<I, S>(kind: ExecutorKind, replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            kind,
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的共享上下文
    pub fn contexts(&self) -> Vec<Value> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(&self, _description: &str, context: &Value) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.replies.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.provider = "mock".to_string();
    config.hitl.poll_interval_ms = 10;
    config.trace.heartbeat_secs = 1;
    config.trace.stream_timeout_secs = 10;
    config
}

pub fn registry(executors: &[Arc<ScriptedExecutor>]) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for executor in executors {
        registry.register_arc(executor.clone());
    }
    registry
}

pub fn build_engine(
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    executors: &[Arc<ScriptedExecutor>],
) -> WorkflowEngine {
    EngineBuilder::new(config)
        .with_llm(llm)
        .with_executors(registry(executors))
        .with_memory_store(Arc::new(MemoryStore::default()))
        .build()
        .unwrap()
}

pub fn pipeline_data() -> String {
    serde_json::json!({
        "pipeline_id": "P-001",
        "length_km": 120.5,
        "diameter_mm": 508,
        "pump_stations": 3,
    })
    .to_string()
}

/// 两个可行方案：方案二能耗更低
pub fn two_schemes() -> String {
    serde_json::json!({
        "feasible_schemes": [
            { "name": "方案一", "energy_consumption": 1520.0, "end_pressure": 0.45, "pumps": [1, 1, 0] },
            { "name": "方案二", "energy_consumption": 1310.0, "end_pressure": 0.38, "pumps": [1, 0, 1] }
        ]
    })
    .to_string()
}
