//! 工作流集成测试：规划、执行、反思、重规划与结果整合

mod common;

use std::sync::Arc;

use common::{build_engine, pipeline_data, test_config, two_schemes, ScriptedExecutor};
use futures_util::StreamExt;
use pipeline_agent::agents::APOLOGY;
use pipeline_agent::executors::Branch;
use pipeline_agent::llm::{MockLlmClient, ScriptedLlmClient};
use pipeline_agent::observability::{StreamItem, TraceEventType};
use pipeline_agent::workflow::{ExecutorKind, HitlKind, RunPhase, TaskStatus};

#[tokio::test]
async fn test_pump_optimization_suspends_on_scheme_selection() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let calc = ScriptedExecutor::new(ExecutorKind::Calc, [two_schemes()]);
    let report = ScriptedExecutor::new(ExecutorKind::Report, ["报告：推荐方案二"]);
    let engine = build_engine(
        test_config(),
        Arc::new(MockLlmClient),
        &[data.clone(), calc.clone(), report.clone()],
    );

    let state = engine.run("s1", "优化泵站运行方案并生成报告").await.unwrap();

    assert_eq!(state.phase, RunPhase::WaitingForHuman);
    let kinds: Vec<ExecutorKind> = state.tasks().iter().map(|t| t.executor).collect();
    assert_eq!(kinds, vec![ExecutorKind::Data, ExecutorKind::Calc, ExecutorKind::Report]);
    assert_eq!(state.current_task_index(), 1);
    assert_eq!(state.tasks()[2].status, TaskStatus::Pending);
    assert_eq!(report.calls(), 0);

    let request = state.pending_hitl.clone().unwrap();
    assert_eq!(request.kind, HitlKind::SchemeSelection);
    assert_eq!(request.options.len(), 2);
    assert_eq!(request.task_id, state.tasks()[1].id);

    // 计算执行器看到数据执行器折叠进上下文的字段
    let calc_context = &calc.contexts()[0];
    assert_eq!(calc_context["pipeline_id"], "P-001");
    assert!(calc_context.get("data_agent_result").is_some());

    let pending = engine.pending_requests("s1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.id, request.id);
}

#[tokio::test]
async fn test_soft_failure_goes_through_reflexion() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let calc = ScriptedExecutor::new(
        ExecutorKind::Calc,
        ["error: cannot connect to calculation service"],
    );
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[data.clone(), calc.clone()]);

    let state = engine.run("s2", "计算管道沿线压力分布").await.unwrap();

    assert_eq!(state.phase, RunPhase::Completed);
    let calc_task = &state.tasks()[1];
    assert_eq!(calc_task.status, TaskStatus::Failed);
    assert!(calc_task.error.as_deref().unwrap().contains("cannot connect"));
    // 重试预算为 2：首次执行 + 两次重试
    assert_eq!(calc.calls(), 3);
    assert_eq!(calc_task.retry_count, 2);
    assert_eq!(state.reflexion_memories.len(), 3);
    assert!(state.reflexion_memories.iter().all(|m| m.task_id == calc_task.id));

    // 只有一个成功结果时原样返回
    assert_eq!(state.final_response.as_deref(), Some(pipeline_data().as_str()));
}

#[tokio::test]
async fn test_replan_preserves_completed_prefix() {
    let llm = Arc::new(ScriptedLlmClient::new([
        r#"{"reasoning":"查数据、算方案、出报告","plan":[
            {"step_number":1,"agent":"data_agent","description":"查询管道参数"},
            {"step_number":2,"agent":"calc_agent","description":"计算优化方案","depends_on":[1]},
            {"step_number":3,"agent":"report_agent","description":"生成报告","depends_on":[2]}
        ]}"#,
        r#"{"failure_reason":"缺少粘度数据","lesson_learned":"先查油品物性","revised_approach":"改用知识库","should_retry":false,"should_replan":true}"#,
        r#"{"reasoning":"先补充物性再出报告","plan":[
            {"step_number":1,"agent":"knowledge_agent","description":"检索油品粘度"},
            {"step_number":2,"agent":"report_agent","description":"生成报告"}
        ]}"#,
        "综合结论：方案可行",
    ]));
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let calc = ScriptedExecutor::new(ExecutorKind::Calc, ["failed: missing viscosity"]);
    let knowledge = ScriptedExecutor::new(ExecutorKind::Knowledge, ["粘度 12.5 mm2/s"]);
    let report = ScriptedExecutor::new(ExecutorKind::Report, ["报告正文"]);
    let engine = build_engine(
        test_config(),
        llm.clone(),
        &[data.clone(), calc.clone(), knowledge.clone(), report.clone()],
    );

    let state = engine.run("s3", "优化管道运行方案并生成报告").await.unwrap();

    assert_eq!(state.phase, RunPhase::Completed);
    assert_eq!(state.counters.replans, 1);
    let tasks = state.tasks();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].executor, ExecutorKind::Data);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].result.as_deref(), Some(pipeline_data().as_str()));
    assert_eq!(tasks[1].executor, ExecutorKind::Knowledge);
    assert_eq!(tasks[1].step_number, 2);
    assert_eq!(tasks[2].executor, ExecutorKind::Report);
    assert_eq!(tasks[2].step_number, 3);
    assert_eq!(data.calls(), 1);
    assert_eq!(calc.calls(), 1);

    assert_eq!(state.final_response.as_deref(), Some("综合结论：方案可行"));
    assert_eq!(llm.call_count(), 4);
    assert_eq!(state.counters.llm_calls, 4);
    assert!(llm.prompts()[2].contains("先查油品物性"));
}

#[tokio::test]
async fn test_all_steps_failed_returns_apology() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, ["查询失败：数据库不可用"]);
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[data.clone()]);

    let state = engine.run("s4", "请分析管道的运行状况和历史记录").await.unwrap();

    assert_eq!(state.tasks().len(), 1);
    assert_eq!(state.failed_tasks().count(), 1);
    assert_eq!(state.final_response.as_deref(), Some(APOLOGY));
}

#[tokio::test]
async fn test_chat_input_replies_directly() {
    let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let engine = build_engine(test_config(), llm.clone(), &[data.clone()]);

    let state = engine.run("s5", "你好").await.unwrap();

    assert_eq!(state.phase, RunPhase::Completed);
    assert!(state.tasks().is_empty());
    assert_eq!(data.calls(), 0);
    // 规划阶段不调用 LLM，只有直接回复一次
    assert_eq!(llm.call_count(), 1);
    assert!(!state.final_response.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_missing_executor_is_task_failure() {
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[]);

    let state = engine.run("s6", "请分析管道的运行状况和历史记录").await.unwrap();

    assert_eq!(state.phase, RunPhase::Completed);
    let task = &state.tasks()[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("no executor"));
}

#[tokio::test]
async fn test_trace_stream_ends_with_completed() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[data]);

    let (state, tracer) = engine.begin("s7", "请分析管道的运行状况和历史记录");
    let stream = tracer.subscribe().unwrap();
    let state = engine.run_state(state).await.unwrap();
    assert_eq!(state.phase, RunPhase::Completed);

    let items: Vec<StreamItem> = stream.collect().await;
    let types: Vec<TraceEventType> = items
        .iter()
        .filter_map(|item| match item {
            StreamItem::Event(ev) => Some(ev.event_type),
            _ => None,
        })
        .collect();
    let position = |t: TraceEventType| types.iter().position(|x| *x == t).unwrap();
    assert_eq!(types.first(), Some(&TraceEventType::AgentThinking));
    assert!(position(TraceEventType::PlanCreated) < position(TraceEventType::StepStarted));
    assert!(types.contains(&TraceEventType::ToolResult));
    assert!(types.contains(&TraceEventType::ResponseChunk));
    assert_eq!(types.last(), Some(&TraceEventType::Completed));

    let metrics = tracer.metrics();
    assert_eq!(metrics.steps_completed, 1);
    assert_eq!(metrics.tool_calls, 1);
}

#[tokio::test]
async fn test_replan_budget_exhausted_fails_run() {
    let mut config = test_config();
    config.workflow.max_replans = 0;
    let calc = ScriptedExecutor::new(ExecutorKind::Calc, ["error: missing pipe diameter"]);
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let engine = build_engine(config, Arc::new(MockLlmClient), &[data, calc]);

    let state = engine.run("s8", "计算管道沿线压力分布").await.unwrap();

    assert_eq!(state.phase, RunPhase::Failed);
    assert_eq!(state.final_response.as_deref(), Some(APOLOGY));
    assert!(state.pending_hitl.is_none());

    let reloaded = engine.load_state("s8").await.unwrap();
    assert_eq!(reloaded.phase, RunPhase::Failed);
}

#[tokio::test]
async fn test_gather_runs_branches_concurrently() {
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[]);

    let results = engine
        .gather(vec![
            Branch::new("pipeline", async { Ok(serde_json::json!({"length_km": 120.5})) }),
            Branch::new("oil", async { Err("oil service down".to_string()) }),
            Branch::new("pumps", async { Ok(serde_json::json!({"count": 3})) }),
        ])
        .await;

    let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["pipeline", "oil", "pumps"]);
    assert_eq!(results[0].1["length_km"], 120.5);
    assert_eq!(results[1].1["error"], "oil service down");
    assert_eq!(results[2].1["count"], 3);
}

#[tokio::test]
async fn test_cancelled_session_stops_run() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[data.clone()]);

    engine.supervisor().cancel_all();
    let result = engine.run("s9", "请分析管道的运行状况和历史记录").await;

    assert!(matches!(result, Err(pipeline_agent::WorkflowError::Cancelled)));
    assert_eq!(data.calls(), 0);
}

#[tokio::test]
async fn test_english_pump_request_plans_data_then_calc() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let calc = ScriptedExecutor::new(ExecutorKind::Calc, [two_schemes()]);
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[data, calc]);

    let state = engine
        .run("s10", "optimize pump configuration for pipeline A")
        .await
        .unwrap();

    let kinds: Vec<ExecutorKind> = state.tasks().iter().map(|t| t.executor).collect();
    assert_eq!(kinds, vec![ExecutorKind::Data, ExecutorKind::Calc]);
    assert_eq!(state.phase, RunPhase::WaitingForHuman);
    assert_eq!(state.pending_hitl.as_ref().unwrap().options.len(), 2);

    let summary = engine.trace_bus().summary(&state.run_id).unwrap();
    assert_eq!(summary["session_id"], "s10");
    assert_eq!(summary["metrics"]["steps_completed"], 2);
    assert!(summary["timeline"].as_array().unwrap().len() >= 6);
    assert_eq!(engine.trace_bus().run_ids(), vec![state.run_id.clone()]);
}

#[tokio::test]
async fn test_token_usage_flows_into_run_metrics() {
    let llm = Arc::new(
        ScriptedLlmClient::new([
            r#"{"reasoning":"查数据再查物性","plan":[
                {"step_number":1,"agent":"data_agent","description":"查询管道参数"},
                {"step_number":2,"agent":"knowledge_agent","description":"检索油品粘度"}
            ]}"#,
            "综合结论：管道运行正常",
        ])
        .with_token_cost(10, 5),
    );
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let knowledge = ScriptedExecutor::new(ExecutorKind::Knowledge, ["粘度 12.5 mm2/s"]);
    let engine = build_engine(test_config(), llm.clone(), &[data, knowledge]);

    let (state, tracer) = engine.begin("s11", "分析管道运行状况并查询油品粘度");
    let state = engine.run_state(state).await.unwrap();

    assert_eq!(state.phase, RunPhase::Completed);
    assert_eq!(state.counters.llm_calls, 2);
    let metrics = tracer.metrics();
    assert_eq!(metrics.llm_calls, 2);
    assert_eq!(metrics.total_tokens, 30);
    let completed = tracer.events().into_iter().last().unwrap();
    assert_eq!(completed.event_type, TraceEventType::Completed);
    assert_eq!(completed.data["metrics"]["total_tokens"], 30);
}

#[tokio::test]
async fn test_finished_runs_release_tracers_and_sessions() {
    let data = ScriptedExecutor::new(ExecutorKind::Data, [pipeline_data()]);
    let engine = build_engine(test_config(), Arc::new(MockLlmClient), &[data.clone()]);

    for i in 0..5 {
        let state = engine
            .run(&format!("r{}", i), "请分析管道的运行状况和历史记录")
            .await
            .unwrap();
        assert_eq!(state.phase, RunPhase::Completed);
    }
    engine.run("chat", "你好").await.unwrap();

    assert_eq!(data.calls(), 5);
    assert!(engine.trace_bus().run_ids().is_empty());
    assert_eq!(engine.supervisor().session_count(), 0);
}
