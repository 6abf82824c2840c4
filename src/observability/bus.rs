//! Trace 总线：run_id -> RunTracer 的注册表

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;

use super::tracer::RunTracer;
use crate::config::TraceSection;
use crate::persistence::TraceSink;

pub struct TraceBus {
    tracers: RwLock<HashMap<String, Arc<RunTracer>>>,
    sink: Option<Arc<dyn TraceSink>>,
    heartbeat: Duration,
    stream_timeout: Duration,
}

impl TraceBus {
    pub fn new(config: &TraceSection) -> Self {
        Self {
            tracers: RwLock::new(HashMap::new()),
            sink: None,
            heartbeat: Duration::from_secs(config.heartbeat_secs),
            stream_timeout: Duration::from_secs(config.stream_timeout_secs),
        }
    }

    /// 所有事件同时写入持久化 sink
    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 为运行创建 tracer；同一 run_id 已存在时返回已有的
    pub fn create(&self, run_id: &str, session_id: &str) -> Arc<RunTracer> {
        let mut tracers = self.tracers.write().unwrap_or_else(PoisonError::into_inner);
        tracers
            .entry(run_id.to_string())
            .or_insert_with(|| {
                Arc::new(RunTracer::new(
                    run_id,
                    session_id,
                    self.sink.clone(),
                    self.heartbeat,
                    self.stream_timeout,
                ))
            })
            .clone()
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunTracer>> {
        self.tracers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    pub fn remove(&self, run_id: &str) -> Option<Arc<RunTracer>> {
        self.tracers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)
    }

    /// 当前活跃的 run_id
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tracers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn summary(&self, run_id: &str) -> Option<Value> {
        self.get(run_id).map(|t| t.summary())
    }
}
