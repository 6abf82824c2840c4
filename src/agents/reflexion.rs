//! Reflexion：分析失败任务并决定重试、重规划或放弃
//!
//! LLM 给出失败原因、经验与建议；调用失败或输出无法解析时按错误文本的规则降级。
//! 最终动作由纯函数 `decide` 根据建议与重试预算得出。

use std::sync::Arc;

use serde_json::Value;

use super::prompts::REFLEXION_PROMPT;
use crate::llm::json::{bool_field, str_field};
use crate::llm::{extract_json, render_prompt, JsonExtract, LlmClient, Message};
use crate::workflow::{ReflexionMemory, Task};

/// 指向缺参数、缺权限一类问题的错误文本，重试无济于事，应重新规划
const REPLAN_HINTS: &[&str] = &[
    "missing",
    "not found",
    "permission",
    "unauthorized",
    "forbidden",
    "参数",
    "权限",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ReflexionDecision {
    pub failure_reason: String,
    pub lesson_learned: String,
    pub revised_approach: String,
    pub should_retry: bool,
    pub should_replan: bool,
}

impl ReflexionDecision {
    pub fn to_memory(&self, task_id: &str) -> ReflexionMemory {
        ReflexionMemory {
            task_id: task_id.to_string(),
            failure_reason: self.failure_reason.clone(),
            lesson_learned: self.lesson_learned.clone(),
            revised_approach: self.revised_approach.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflexionAction {
    /// 任务重置为 pending，原地重试
    Retry,
    /// 为剩余工作重新规划
    Replan,
    /// 放弃该任务（保持 failed）并前进
    Skip,
}

impl ReflexionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflexionAction::Retry => "retry",
            ReflexionAction::Replan => "replan",
            ReflexionAction::Skip => "skip",
        }
    }
}

/// 先看重试（预算内），再看重规划，否则放弃
pub fn decide(decision: &ReflexionDecision, retry_count: u32, retry_budget: u32) -> ReflexionAction {
    if decision.should_retry && retry_count < retry_budget {
        ReflexionAction::Retry
    } else if decision.should_replan {
        ReflexionAction::Replan
    } else {
        ReflexionAction::Skip
    }
}

/// 规则降级：缺参数/权限类错误建议重规划，其余建议重试
pub fn fallback_decision(error: &str) -> ReflexionDecision {
    let text = error.to_lowercase();
    let replan_like = REPLAN_HINTS.iter().any(|k| text.contains(k));
    ReflexionDecision {
        failure_reason: format!("执行失败: {}", error),
        lesson_learned: "优先检查输入参数、依赖数据和接口可用性".to_string(),
        revised_approach: "若参数缺失先补全数据，再重试；连续失败时重规划".to_string(),
        should_retry: !replan_like,
        should_replan: replan_like,
    }
}

fn parse_decision(data: &Value) -> ReflexionDecision {
    ReflexionDecision {
        failure_reason: str_field(data, "failure_reason").unwrap_or("unknown").to_string(),
        lesson_learned: str_field(data, "lesson_learned").unwrap_or_default().to_string(),
        revised_approach: str_field(data, "revised_approach")
            .unwrap_or("retry with safer defaults")
            .to_string(),
        should_retry: bool_field(data, "should_retry").unwrap_or(true),
        should_replan: bool_field(data, "should_replan").unwrap_or(false),
    }
}

pub struct Reflexion {
    llm: Arc<dyn LlmClient>,
}

impl Reflexion {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn reflect(
        &self,
        task: &Task,
        error: &str,
        context: &Value,
        history: &[ReflexionMemory],
    ) -> ReflexionDecision {
        let context = serde_json::to_string(context).unwrap_or_default();
        let history = serde_json::to_string(history).unwrap_or_default();
        let prompt = render_prompt(
            REFLEXION_PROMPT,
            &[
                ("step_description", &task.description),
                ("agent", task.executor.as_str()),
                ("error_message", error),
                ("context", &context),
                ("previous_reflexions", &history),
            ],
        );

        match self.llm.complete(&[Message::user(prompt)]).await {
            Ok(response) => match extract_json(&response) {
                JsonExtract::Parsed(data) => parse_decision(&data),
                JsonExtract::Malformed(_) => {
                    tracing::warn!(task_id = %task.id, "reflexion output unusable, using rule fallback");
                    fallback_decision(error)
                }
            },
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "reflexion call failed, using rule fallback");
                fallback_decision(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::workflow::ExecutorKind;

    fn decision(retry: bool, replan: bool) -> ReflexionDecision {
        ReflexionDecision {
            failure_reason: String::new(),
            lesson_learned: String::new(),
            revised_approach: String::new(),
            should_retry: retry,
            should_replan: replan,
        }
    }

    #[test]
    fn test_decide_order() {
        assert_eq!(decide(&decision(true, true), 0, 2), ReflexionAction::Retry);
        assert_eq!(decide(&decision(true, true), 2, 2), ReflexionAction::Replan);
        assert_eq!(decide(&decision(true, false), 2, 2), ReflexionAction::Skip);
        assert_eq!(decide(&decision(false, false), 0, 2), ReflexionAction::Skip);
        assert_eq!(decide(&decision(true, false), 0, 0), ReflexionAction::Skip);
    }

    #[test]
    fn test_fallback_rules() {
        let d = fallback_decision("计算失败: 缺少管径参数");
        assert!(d.should_replan && !d.should_retry);
        let d = fallback_decision("HTTP 403 Forbidden");
        assert!(d.should_replan);
        let d = fallback_decision("error: cannot connect to calculation service");
        assert!(d.should_retry && !d.should_replan);
    }

    #[tokio::test]
    async fn test_reflect_parses_llm_output() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"failure_reason": "服务不可用", "lesson_learned": "稍后重试", "should_retry": "false", "should_replan": true}"#,
        ]));
        let task = Task::new(2, ExecutorKind::Calc, "优化泵站");
        let d = Reflexion::new(llm)
            .reflect(&task, "error: timeout", &Value::Null, &[])
            .await;
        assert_eq!(d.failure_reason, "服务不可用");
        assert_eq!(d.revised_approach, "retry with safer defaults");
        assert!(!d.should_retry);
        assert!(d.should_replan);
    }

    #[tokio::test]
    async fn test_reflect_falls_back_on_malformed() {
        let task = Task::new(1, ExecutorKind::Data, "查询");
        let d = Reflexion::new(Arc::new(MockLlmClient))
            .reflect(&task, "station not found", &Value::Null, &[])
            .await;
        assert!(d.should_replan);
        assert!(d.failure_reason.contains("station not found"));
    }
}
