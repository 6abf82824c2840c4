//! Synthesizer：把已完成任务的结果整合为最终回答
//!
//! 多个结果时通过 LLM 流式整合，每个 token 作为 response_chunk 推送；
//! 单个结果原样返回；没有结果时返回直接回复或固定的致歉语。

use std::sync::Arc;

use futures_util::StreamExt;

use super::prompts::SYNTHESIS_PROMPT;
use crate::llm::{render_prompt, LlmClient, Message};
use crate::observability::{RunTracer, TraceEventType};
use crate::workflow::{Task, WorkflowState};

pub const APOLOGY: &str = "抱歉，无法处理您的请求。";

/// 闲聊输入的默认回复（LLM 不可用时）
pub const DEFAULT_GREETING: &str = "您好，我是管道能耗分析助手，可以帮您查询管道数据、进行水力计算和能耗优化分析。";

const CHAT_SYSTEM_PROMPT: &str = "你是管道能耗分析助手。用户在闲聊，请用一两句话友好回应，并简要说明你能提供的帮助。";

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 为闲聊输入生成直接回复
    pub async fn direct_reply(&self, user_input: &str) -> String {
        let messages = [Message::system(CHAT_SYSTEM_PROMPT), Message::user(user_input)];
        match self.llm.complete(&messages).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => DEFAULT_GREETING.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "direct reply failed, using default greeting");
                DEFAULT_GREETING.to_string()
            }
        }
    }

    /// 生成最终回答并推送 response_chunk，最后推送带指标的 completed；回答写入 final_response
    pub async fn synthesize(&self, state: &mut WorkflowState, tracer: &RunTracer) -> String {
        let completed: Vec<Task> = state.completed_tasks().cloned().collect();

        let text = match completed.as_slice() {
            [] => {
                let text = state
                    .final_response
                    .clone()
                    .unwrap_or_else(|| APOLOGY.to_string());
                emit_chunk(tracer, &text);
                text
            }
            [only] => {
                let text = only.result.clone().unwrap_or_default();
                emit_chunk(tracer, &text);
                text
            }
            many => {
                state.counters.llm_calls += 1;
                self.merge(&state.user_input, many, tracer).await
            }
        };
        state.final_response = Some(text.clone());

        tracer.emit(tracer.event(
            TraceEventType::Completed,
            serde_json::json!({
                "response_length": text.chars().count(),
                "metrics": tracer.metrics(),
            }),
        ));
        text
    }

    async fn merge(&self, user_input: &str, tasks: &[Task], tracer: &RunTracer) -> String {
        let agent_results = tasks
            .iter()
            .map(|t| {
                format!(
                    "[步骤{}][{}] {}\n{}",
                    t.step_number,
                    t.executor,
                    t.description,
                    t.result.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = render_prompt(
            SYNTHESIS_PROMPT,
            &[("user_input", user_input), ("agent_results", &agent_results)],
        );

        tracer.emit(tracer.event(
            TraceEventType::LlmStreaming,
            serde_json::json!({ "stage": "synthesis", "results": tasks.len() }),
        ));
        let since = self.llm.token_usage().2;
        let mut text = String::new();
        match self.llm.complete_stream(&[Message::user(prompt)]).await {
            Ok(mut stream) => {
                while let Some(token) = stream.next().await {
                    match token {
                        Ok(token) => {
                            emit_chunk(tracer, &token);
                            text.push_str(&token);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "synthesis stream interrupted, keeping partial text");
                            break;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "synthesis call failed, joining raw results"),
        }
        let spent = self.llm.token_usage().2.saturating_sub(since);
        tracer.record_llm_call((spent > 0).then_some(spent));

        if text.trim().is_empty() {
            text = tasks
                .iter()
                .map(|t| t.result.as_deref().unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n\n");
            emit_chunk(tracer, &text);
        }
        text
    }
}

fn emit_chunk(tracer: &RunTracer, chunk: &str) {
    tracer.emit(tracer.event(
        TraceEventType::ResponseChunk,
        serde_json::json!({ "chunk": chunk }),
    ));
}
