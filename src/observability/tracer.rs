//! 单次运行的事件收集器
//!
//! RunTracer 追加事件、累计指标，并把每个事件送入无界队列供唯一的流式消费者读取；
//! 配置了持久化 sink 时同时转发。消费者空闲时收到心跳，总时长超过上限时收到超时并结束。

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::events::{TraceEvent, TraceEventType};
use crate::persistence::TraceSink;

/// 运行指标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    pub total_duration_ms: u64,
    pub llm_calls: u32,
    pub tool_calls: u32,
    pub total_tokens: u64,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub retries: u32,
    pub replans: u32,
}

/// 推送给流式消费者的条目
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(TraceEvent),
    Heartbeat,
    Timeout,
}

impl StreamItem {
    pub fn to_frame(&self) -> Value {
        let now = chrono::Utc::now().to_rfc3339();
        match self {
            StreamItem::Event(ev) => ev.to_frame(),
            StreamItem::Heartbeat => {
                serde_json::json!({ "event_type": "heartbeat", "timestamp": now, "data": {} })
            }
            StreamItem::Timeout => serde_json::json!({
                "event_type": "timeout",
                "timestamp": now,
                "data": { "message": "trace stream deadline reached" },
            }),
        }
    }
}

pub type TraceStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

struct TracerInner {
    events: Vec<TraceEvent>,
    metrics: RunMetrics,
    receiver: Option<mpsc::UnboundedReceiver<TraceEvent>>,
}

pub struct RunTracer {
    run_id: String,
    session_id: String,
    started: Instant,
    inner: Mutex<TracerInner>,
    sender: mpsc::UnboundedSender<TraceEvent>,
    sink: Option<Arc<dyn TraceSink>>,
    heartbeat: Duration,
    stream_timeout: Duration,
}

impl RunTracer {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        sink: Option<Arc<dyn TraceSink>>,
        heartbeat: Duration,
        stream_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            started: Instant::now(),
            inner: Mutex::new(TracerInner {
                events: Vec::new(),
                metrics: RunMetrics::default(),
                receiver: Some(receiver),
            }),
            sender,
            sink,
            heartbeat,
            stream_timeout,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 构造一个属于本次运行的事件
    pub fn event(&self, event_type: TraceEventType, data: Value) -> TraceEvent {
        TraceEvent::new(self.run_id.clone(), event_type, data)
    }

    /// 记录事件：追加、更新指标、送入队列并转发到 sink
    pub fn emit(&self, event: TraceEvent) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let m = &mut inner.metrics;
            match event.event_type {
                TraceEventType::StepCompleted => m.steps_completed += 1,
                TraceEventType::StepFailed => m.steps_failed += 1,
                TraceEventType::ToolCalled => m.tool_calls += 1,
                TraceEventType::Replan => m.replans += 1,
                TraceEventType::Reflexion => {
                    if event.data.get("action").and_then(|a| a.as_str()) == Some("retry") {
                        m.retries += 1;
                    }
                }
                _ => {}
            }
            if let Some(tokens) = event.tokens {
                m.total_tokens += tokens;
            }
            inner.events.push(event.clone());
        }
        if let Some(ref sink) = self.sink {
            sink.record(&event);
        }
        // 没有订阅者或订阅者已退出时丢弃
        let _ = self.sender.send(event);
    }

    /// 记录一次 LLM 调用
    pub fn record_llm_call(&self, tokens: Option<u64>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.metrics.llm_calls += 1;
        if let Some(t) = tokens {
            inner.metrics.total_tokens += t;
        }
    }

    pub fn metrics(&self) -> RunMetrics {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut metrics = inner.metrics.clone();
        metrics.total_duration_ms = self.started.elapsed().as_millis() as u64;
        metrics
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    pub fn event_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    /// 运行摘要：指标、事件数与时间线
    pub fn summary(&self) -> Value {
        let events = self.events();
        let timeline: Vec<Value> = events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "event_type": e.event_type.as_str(),
                    "timestamp": e.timestamp.to_rfc3339(),
                    "step_number": e.step_number,
                    "agent": e.agent,
                })
            })
            .collect();
        serde_json::json!({
            "run_id": self.run_id,
            "session_id": self.session_id,
            "metrics": self.metrics(),
            "event_count": events.len(),
            "timeline": timeline,
        })
    }

    /// 获取事件流；只能订阅一次，之后返回 None
    ///
    /// 流会回放订阅前已产生的事件，在 completed / error 之后结束。
    pub fn subscribe(&self) -> Option<TraceStream> {
        let receiver = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver
            .take()?;
        let deadline = tokio::time::Instant::now() + self.stream_timeout;
        let heartbeat = self.heartbeat;

        let stream = futures_util::stream::unfold(
            (receiver, false),
            move |(mut receiver, done)| async move {
                if done {
                    return None;
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Some((StreamItem::Timeout, (receiver, true)));
                }
                let wait = heartbeat.min(deadline - now);
                match tokio::time::timeout(wait, receiver.recv()).await {
                    Ok(Some(event)) => {
                        let finished = event.event_type.is_terminal();
                        Some((StreamItem::Event(event), (receiver, finished)))
                    }
                    Ok(None) => None,
                    Err(_) => {
                        if tokio::time::Instant::now() >= deadline {
                            Some((StreamItem::Timeout, (receiver, true)))
                        } else {
                            Some((StreamItem::Heartbeat, (receiver, false)))
                        }
                    }
                }
            },
        );
        Some(Box::pin(stream))
    }
}
