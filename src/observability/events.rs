//! Trace 事件定义
//!
//! 每次运行的事件只追加不修改；流式推送帧格式为
//! `{event_type, timestamp, step_number?, agent?, duration_ms?, data}`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    PlanCreated,
    PlanUpdated,
    StepStarted,
    StepCompleted,
    StepFailed,
    AgentThinking,
    ToolCalled,
    ToolResult,
    LlmStreaming,
    HitlWaiting,
    HitlResumed,
    Reflexion,
    Replan,
    ResponseChunk,
    Completed,
    Error,
}

impl TraceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceEventType::PlanCreated => "plan_created",
            TraceEventType::PlanUpdated => "plan_updated",
            TraceEventType::StepStarted => "step_started",
            TraceEventType::StepCompleted => "step_completed",
            TraceEventType::StepFailed => "step_failed",
            TraceEventType::AgentThinking => "agent_thinking",
            TraceEventType::ToolCalled => "tool_called",
            TraceEventType::ToolResult => "tool_result",
            TraceEventType::LlmStreaming => "llm_streaming",
            TraceEventType::HitlWaiting => "hitl_waiting",
            TraceEventType::HitlResumed => "hitl_resumed",
            TraceEventType::Reflexion => "reflexion",
            TraceEventType::Replan => "replan",
            TraceEventType::ResponseChunk => "response_chunk",
            TraceEventType::Completed => "completed",
            TraceEventType::Error => "error",
        }
    }

    /// 流在 completed / error 之后结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceEventType::Completed | TraceEventType::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: String,
    pub event_type: TraceEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl TraceEvent {
    pub fn new(run_id: impl Into<String>, event_type: TraceEventType, data: Value) -> Self {
        Self {
            run_id: run_id.into(),
            event_type,
            timestamp: Utc::now(),
            data,
            step_number: None,
            agent: None,
            duration_ms: None,
            tokens: None,
        }
    }

    pub fn with_step(mut self, step_number: u32) -> Self {
        self.step_number = Some(step_number);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// 推送给客户端的帧
    pub fn to_frame(&self) -> Value {
        let mut frame = serde_json::json!({
            "event_type": self.event_type.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
            "data": self.data,
        });
        if let Some(step) = self.step_number {
            frame["step_number"] = step.into();
        }
        if let Some(ref agent) = self.agent {
            frame["agent"] = agent.clone().into();
        }
        if let Some(ms) = self.duration_ms {
            frame["duration_ms"] = ms.into();
        }
        frame
    }
}
