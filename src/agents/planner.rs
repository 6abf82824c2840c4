//! Planner：把用户请求拆解为有序任务，或在失败后为剩余工作重新规划
//!
//! 闲聊输入在调用 LLM 之前被拦截；LLM 输出无法解析或规范化后为空时，使用关键词规则生成计划。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use super::prompts::{PLANNER_REPLAN_PROMPT, PLANNER_SYSTEM_PROMPT, PLANNER_TASK_PROMPT};
use crate::llm::json::{bool_field, str_field};
use crate::llm::{extract_json, render_prompt, JsonExtract, LlmClient, Message};
use crate::workflow::{ExecutorKind, Task};

const CHAT_PHRASES: &[&str] = &[
    "你好", "hello", "hi", "嗨", "在吗", "在不在", "谢谢", "感谢", "thanks", "thank you", "再见",
    "拜拜", "bye", "你是谁", "你叫什么", "你能做什么", "帮我什么", "好的", "ok", "嗯", "哦",
];

const DOMAIN_KEYWORDS: &[&str] = &[
    "管道", "泵站", "油品", "项目", "压力", "流量", "计算", "优化", "水力", "摩阻", "粘度", "密度",
    "能耗", "分析", "诊断", "故障", "报告", "碳排放", "敏感性", "方案", "对比", "监控", "知识图谱",
    "因果", "雷诺", "扬程", "排量", "粗糙度", "壁厚", "管径", "pipeline", "pump", "pressure",
    "flow",
];

const DATA_KEYWORDS: &[&str] = &["项目", "管道", "泵站", "参数", "数据", "pipeline", "pump", "project", "data"];
const CALC_KEYWORDS: &[&str] = &[
    "计算", "优化", "压力", "流量", "雷诺", "摩阻", "calculat", "compute", "optimi", "pressure", "flow",
];
const GRAPH_KEYWORDS: &[&str] = &["因果", "知识图谱", "关系", "causal", "knowledge graph", "relation"];
const REPORT_KEYWORDS: &[&str] = &["报告", "汇总", "导出", "report", "summary", "export"];

/// 规划结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// 无需执行任务，直接回复
    Direct { reasoning: String },
    Plan { reasoning: String, tasks: Vec<Task> },
}

/// 问候、致谢、告别等非业务输入，或不含领域关键词的极短输入
pub fn is_chat_intent(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    let matches_phrase = CHAT_PHRASES.iter().any(|phrase| {
        t == *phrase || t == format!("{}吗", phrase) || t == format!("{}啊", phrase)
    });
    if matches_phrase {
        return true;
    }
    t.chars().count() <= 10 && !DOMAIN_KEYWORDS.iter().any(|k| t.contains(k))
}

fn fallback_task(step: u32, kind: ExecutorKind) -> Task {
    let (description, expected) = match kind {
        ExecutorKind::Data => ("查询所需项目和管道基础参数", "项目、管道、泵站和油品关键参数"),
        ExecutorKind::Calc => ("执行水力分析或优化计算", "计算指标与可行方案"),
        ExecutorKind::Graph => ("执行知识图谱关系或因果推理", "结构化关系与推理结论"),
        ExecutorKind::Knowledge => ("检索领域知识并回答问题", "专业解释和依据"),
        ExecutorKind::Report => ("生成报告结构并输出结论", "结构化报告摘要"),
    };
    Task::new(step, kind, description).with_expected_output(expected)
}

/// 关键词规则计划；按 data → calc → graph → knowledge（无其他匹配时）→ report 的顺序排列
pub fn fallback_plan(user_input: &str) -> Vec<Task> {
    let text = user_input.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| text.contains(k));
    let need_data = has(DATA_KEYWORDS);
    let need_calc = has(CALC_KEYWORDS);
    let need_graph = has(GRAPH_KEYWORDS);
    let need_report = has(REPORT_KEYWORDS);

    let mut kinds = Vec::new();
    if need_data || need_calc {
        kinds.push(ExecutorKind::Data);
    }
    if need_calc {
        kinds.push(ExecutorKind::Calc);
    }
    if need_graph {
        kinds.push(ExecutorKind::Graph);
    }
    if kinds.is_empty() {
        kinds.push(ExecutorKind::Knowledge);
    }
    if need_report {
        kinds.push(ExecutorKind::Report);
    }
    chain(kinds)
}

/// 依次编号并让每一步依赖前一步
fn chain(kinds: Vec<ExecutorKind>) -> Vec<Task> {
    kinds
        .into_iter()
        .enumerate()
        .map(|(i, kind)| {
            let step = i as u32 + 1;
            let depends = if step > 1 { vec![step - 1] } else { Vec::new() };
            fallback_task(step, kind).with_depends_on(depends)
        })
        .collect()
}

/// 重规划的规则版本：去掉前缀中已完成过的执行器，全部去掉时保留一个知识检索任务
pub fn fallback_replan(user_input: &str, completed: &[Task]) -> Vec<Task> {
    let done: HashSet<ExecutorKind> = completed
        .iter()
        .filter(|t| t.is_completed())
        .map(|t| t.executor)
        .collect();
    let mut kinds: Vec<ExecutorKind> = fallback_plan(user_input)
        .into_iter()
        .map(|t| t.executor)
        .filter(|k| !done.contains(k))
        .collect();
    if kinds.is_empty() {
        kinds.push(ExecutorKind::Knowledge);
    }
    chain(kinds)
}

fn parse_ordinal(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if n > 0 {
        u32::try_from(n).ok()
    } else {
        None
    }
}

fn normalize_depends(value: Option<&Value>) -> Vec<u32> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(parse_ordinal).collect(),
        _ => Vec::new(),
    }
}

/// 规范化 LLM 给出的计划数组；空数组返回空 Vec
pub fn normalize_plan(raw_plan: &[Value]) -> Vec<Task> {
    raw_plan
        .iter()
        .enumerate()
        .filter(|(_, step)| step.is_object())
        .map(|(i, step)| {
            let idx = i as u32 + 1;
            let step_number = step.get("step_number").and_then(parse_ordinal).unwrap_or(idx);
            let description = str_field(step, "description")
                .map(str::to_string)
                .unwrap_or_else(|| format!("执行步骤{}", idx));
            let executor = ExecutorKind::normalize(str_field(step, "agent").unwrap_or("knowledge_agent"));
            let expected = str_field(step, "expected_output").unwrap_or_default().to_string();
            Task::new(step_number, executor, description)
                .with_expected_output(expected)
                .with_depends_on(normalize_depends(step.get("depends_on")))
        })
        .collect()
}

enum Parsed {
    Direct(String),
    Plan(String, Vec<Task>),
    Unusable,
}

fn parse_plan(response: &str) -> Parsed {
    let data = match extract_json(response) {
        JsonExtract::Parsed(v) => v,
        JsonExtract::Malformed(_) => return Parsed::Unusable,
    };
    if bool_field(&data, "direct_response") == Some(true) {
        let reasoning = str_field(&data, "reasoning").unwrap_or("chat-direct");
        return Parsed::Direct(reasoning.to_string());
    }
    let reasoning = str_field(&data, "reasoning")
        .unwrap_or("auto-generated plan")
        .to_string();
    let tasks = data
        .get("plan")
        .and_then(Value::as_array)
        .map(|steps| normalize_plan(steps))
        .unwrap_or_default();
    if tasks.is_empty() {
        Parsed::Unusable
    } else {
        Parsed::Plan(reasoning, tasks)
    }
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn create_plan(&self, user_input: &str, context: &Value) -> PlanOutcome {
        if is_chat_intent(user_input) {
            return PlanOutcome::Direct {
                reasoning: "chat-direct".to_string(),
            };
        }

        let available_context = serde_json::to_string(context).unwrap_or_default();
        let messages = [
            Message::system(PLANNER_SYSTEM_PROMPT),
            Message::user(render_prompt(
                PLANNER_TASK_PROMPT,
                &[
                    ("user_input", user_input),
                    ("available_context", &available_context),
                ],
            )),
        ];

        let reason = match self.llm.complete(&messages).await {
            Ok(response) => match parse_plan(&response) {
                Parsed::Direct(reasoning) => return PlanOutcome::Direct { reasoning },
                Parsed::Plan(reasoning, tasks) => return PlanOutcome::Plan { reasoning, tasks },
                Parsed::Unusable => "unusable-output",
            },
            Err(e) => {
                tracing::warn!(error = %e, "planner call failed");
                "llm-error"
            }
        };

        tracing::warn!(reason, "planner falling back to keyword plan");
        PlanOutcome::Plan {
            reasoning: format!("plan-fallback({})", reason),
            tasks: fallback_plan(user_input),
        }
    }

    /// 为剩余工作重新规划；返回的任务列表不会为空
    pub async fn replan(
        &self,
        user_input: &str,
        completed: &[Task],
        failed: Option<&Task>,
        reflexion: &str,
    ) -> (String, Vec<Task>) {
        let completed_steps: Vec<Value> = completed.iter().map(Task::summary).collect();
        let completed_steps = serde_json::to_string(&completed_steps).unwrap_or_default();
        let failed_step = failed
            .map(|t| t.summary().to_string())
            .unwrap_or_else(|| "{}".to_string());
        let messages = [
            Message::system(PLANNER_SYSTEM_PROMPT),
            Message::user(render_prompt(
                PLANNER_REPLAN_PROMPT,
                &[
                    ("user_input", user_input),
                    ("completed_steps", &completed_steps),
                    ("failed_step", &failed_step),
                    ("reflexion", reflexion),
                ],
            )),
        ];

        let reason = match self.llm.complete(&messages).await {
            Ok(response) => match parse_plan(&response) {
                Parsed::Plan(reasoning, tasks) => return (format!("replan: {}", reasoning), tasks),
                Parsed::Direct(_) | Parsed::Unusable => "unusable-output",
            },
            Err(e) => {
                tracing::warn!(error = %e, "replan call failed");
                "llm-error"
            }
        };

        tracing::warn!(reason, "replan falling back to keyword plan");
        (
            format!("replan-fallback({})", reason),
            fallback_replan(user_input, completed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::workflow::TaskStatus;

    fn kinds(tasks: &[Task]) -> Vec<ExecutorKind> {
        tasks.iter().map(|t| t.executor).collect()
    }

    #[test]
    fn test_chat_intent() {
        assert!(is_chat_intent("你好"));
        assert!(is_chat_intent("你好啊"));
        assert!(is_chat_intent("Thanks"));
        assert!(is_chat_intent("今天天气"));
        assert!(!is_chat_intent("管道压力"));
        assert!(!is_chat_intent("optimize pump configuration for pipeline A"));
    }

    #[test]
    fn test_fallback_plan_order() {
        let tasks = fallback_plan("计算管道压力并导出报告，分析因果关系");
        assert_eq!(
            kinds(&tasks),
            vec![
                ExecutorKind::Data,
                ExecutorKind::Calc,
                ExecutorKind::Graph,
                ExecutorKind::Report
            ]
        );
        assert_eq!(tasks[1].depends_on, vec![1]);
        assert_eq!(tasks[3].step_number, 4);
    }

    #[test]
    fn test_fallback_plan_defaults_to_knowledge() {
        let tasks = fallback_plan("什么是输油管线的清管作业规范");
        assert_eq!(kinds(&tasks), vec![ExecutorKind::Knowledge]);
    }

    #[test]
    fn test_fallback_replan_drops_completed_executors() {
        let mut done = Task::new(1, ExecutorKind::Data, "load");
        done.status = TaskStatus::Completed;
        let tasks = fallback_replan("optimize pump configuration for pipeline A", &[done.clone()]);
        assert_eq!(kinds(&tasks), vec![ExecutorKind::Calc]);
        assert_eq!(tasks[0].step_number, 1);

        let tasks = fallback_replan("load pipeline data", &[done]);
        assert_eq!(kinds(&tasks), vec![ExecutorKind::Knowledge]);
    }

    #[test]
    fn test_normalize_plan() {
        let raw = serde_json::json!([
            {"description": "查数据", "agent": "Database Agent", "depends_on": ["x", 0, "2", -1]},
            {"step_number": "7", "agent": "compute"},
            "garbage"
        ]);
        let tasks = normalize_plan(raw.as_array().unwrap());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].step_number, 1);
        assert_eq!(tasks[0].executor, ExecutorKind::Data);
        assert_eq!(tasks[0].depends_on, vec![2]);
        assert_eq!(tasks[1].step_number, 7);
        assert_eq!(tasks[1].executor, ExecutorKind::Calc);
        assert_eq!(tasks[1].description, "执行步骤2");
    }

    #[tokio::test]
    async fn test_chat_short_circuits_llm() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let planner = Planner::new(llm.clone());
        let outcome = planner.create_plan("你好", &Value::Null).await;
        assert!(matches!(outcome, PlanOutcome::Direct { .. }));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_plan_and_direct_flag() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"计划: {"reasoning": "先查后算", "plan": [{"description": "查询管道A", "agent": "data_agent"}, {"description": "优化泵站", "agent": "calc_agent", "depends_on": [1]}]}"#,
            r#"{"direct_response": true, "reasoning": "与业务无关"}"#,
        ]));
        let planner = Planner::new(llm);
        match planner.create_plan("请优化管道A的泵站配置", &Value::Null).await {
            PlanOutcome::Plan { reasoning, tasks } => {
                assert_eq!(reasoning, "先查后算");
                assert_eq!(kinds(&tasks), vec![ExecutorKind::Data, ExecutorKind::Calc]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        let outcome = planner
            .create_plan("请写一首关于春天的长诗给我", &Value::Null)
            .await;
        assert_eq!(
            outcome,
            PlanOutcome::Direct {
                reasoning: "与业务无关".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_output_uses_fallback_on_real_input() {
        let planner = Planner::new(Arc::new(MockLlmClient));
        match planner
            .create_plan("optimize pump configuration for pipeline A", &Value::Null)
            .await
        {
            PlanOutcome::Plan { reasoning, tasks } => {
                assert!(reasoning.starts_with("plan-fallback"));
                assert_eq!(kinds(&tasks), vec![ExecutorKind::Data, ExecutorKind::Calc]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_plan_uses_fallback() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"reasoning": "nothing", "plan": []}"#]));
        let planner = Planner::new(llm);
        match planner.create_plan("管道摩阻计算", &Value::Null).await {
            PlanOutcome::Plan { tasks, .. } => assert!(!tasks.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
