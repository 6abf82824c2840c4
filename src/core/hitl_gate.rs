//! HITL 检查点
//!
//! 检查已完成任务的结构化结果，按顺序匹配：两个及以上候选方案 → 方案选择，
//! `parameters_to_confirm` → 参数确认，`report_outline` → 报告大纲确认，
//! risk_score 达到阈值 → 风险确认。人工响应（或超时策略）在这里落到工作流状态上。

use serde_json::{Map, Value};

use crate::workflow::{HitlKind, HitlOption, HitlRequest, HitlResponse, Task, TaskStatus, WorkflowState};

/// 结果中承载候选方案的字段
const SCHEME_KEYS: &[&str] = &["schemes", "feasible_schemes", "schemes_detail"];

/// 末站压力低于此值（MPa）的方案视为不可行
const MIN_END_PRESSURE_MPA: f64 = 0.1;

pub const OPTION_PROCEED: &str = "proceed";
pub const OPTION_ABORT: &str = "abort";
pub const OPTION_CONFIRM: &str = "confirm";
pub const OPTION_APPROVE: &str = "approve";

fn as_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn find_schemes(output: &Value) -> Option<&Vec<Value>> {
    SCHEME_KEYS
        .iter()
        .filter_map(|k| output.get(*k).and_then(Value::as_array))
        .find(|schemes| schemes.len() >= 2)
}

fn scheme_label(index: usize, scheme: &Value) -> String {
    ["name", "label", "title"]
        .iter()
        .find_map(|k| scheme.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("方案{}", index + 1))
}

fn non_empty_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object).filter(|m| !m.is_empty())
}

fn non_empty_array(value: Option<&Value>) -> Option<&Vec<Value>> {
    value.and_then(Value::as_array).filter(|a| !a.is_empty())
}

/// 确认或终止；`accept` 的候选数据为 `payload`，超时默认接受
fn accept_or_abort(
    kind: HitlKind,
    task: &Task,
    timeout_secs: u64,
    accept: (&str, &str),
    payload: Value,
) -> HitlRequest {
    let mut request = HitlRequest::new(kind, &task.id, timeout_secs);
    request.options = vec![
        HitlOption::new(accept.0, accept.1)
            .with_metadata(serde_json::json!({ "candidate": payload.clone() })),
        HitlOption::new(OPTION_ABORT, "终止该步骤"),
    ];
    request.default_option = Some(accept.0.to_string());
    request.data = serde_json::json!({
        "step_number": task.step_number,
        "agent": task.executor.as_str(),
        "payload": payload,
    });
    request
}

/// 检查任务结果，需要人工确认时返回请求
pub fn detect(task: &Task, risk_threshold: f64, timeout_secs: u64) -> Option<HitlRequest> {
    let output = task.output.as_ref()?;

    if let Some(schemes) = find_schemes(output) {
        let mut request = HitlRequest::new(HitlKind::SchemeSelection, &task.id, timeout_secs);
        request.title = "请选择优化方案".to_string();
        request.description = format!("步骤{}给出了{}个可行方案，请选择一个继续执行", task.step_number, schemes.len());
        request.options = schemes
            .iter()
            .enumerate()
            .map(|(i, scheme)| {
                HitlOption::new(format!("scheme_{}", i), scheme_label(i, scheme)).with_metadata(
                    serde_json::json!({
                        "energy_consumption": scheme.get("energy_consumption"),
                        "end_pressure": scheme.get("end_pressure"),
                        "candidate": scheme,
                    }),
                )
            })
            .collect();
        request.data = serde_json::json!({
            "schemes_detail": schemes,
            "step_number": task.step_number,
            "agent": task.executor.as_str(),
        });
        return Some(request);
    }

    if let Some(params) = non_empty_object(output.get("parameters_to_confirm")) {
        let mut request = accept_or_abort(
            HitlKind::ParameterConfirm,
            task,
            timeout_secs,
            (OPTION_CONFIRM, "确认参数"),
            Value::Object(params.clone()),
        );
        request.title = "参数确认".to_string();
        request.description = format!("步骤{}使用了{}个需要确认的参数，可修改后确认", task.step_number, params.len());
        return Some(request);
    }

    if let Some(outline) = non_empty_array(output.get("report_outline")) {
        let mut request = accept_or_abort(
            HitlKind::ReportOutline,
            task,
            timeout_secs,
            (OPTION_APPROVE, "采用该大纲"),
            Value::Array(outline.clone()),
        );
        request.title = "报告大纲确认".to_string();
        request.description = format!("步骤{}生成了{}节报告大纲，请确认", task.step_number, outline.len());
        return Some(request);
    }

    let risk = as_f64(output.get("risk_score"))?;
    if risk < risk_threshold {
        return None;
    }
    let mut request = HitlRequest::new(HitlKind::RiskWarning, &task.id, timeout_secs);
    request.title = "风险确认".to_string();
    request.description = format!("步骤{}的结果风险评分为 {:.2}，是否继续？", task.step_number, risk);
    request.options = vec![
        HitlOption::new(OPTION_PROCEED, "继续执行"),
        HitlOption::new(OPTION_ABORT, "终止该步骤"),
    ];
    request.data = serde_json::json!({
        "risk_score": risk,
        "threshold": risk_threshold,
        "result": output,
    });
    Some(request)
}

/// 自动选择方案：末站压力可行的方案中能耗最低者，都不可行时取第一个
pub fn auto_select_scheme(request: &HitlRequest) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;
    for option in &request.options {
        let end_pressure = as_f64(option.metadata.get("end_pressure"));
        let energy = as_f64(option.metadata.get("energy_consumption"));
        let (Some(end_pressure), Some(energy)) = (end_pressure, energy) else {
            continue;
        };
        if end_pressure > MIN_END_PRESSURE_MPA && best.map_or(true, |(_, e)| energy < e) {
            best = Some((&option.id, energy));
        }
    }
    best.map(|(id, _)| id.to_string())
        .or_else(|| request.options.first().map(|o| o.id.clone()))
}

/// 超时采用默认选项时的响应：default_option，其次自动选择，最后第一个选项
pub fn timeout_response(request: &HitlRequest) -> Option<HitlResponse> {
    let option = request
        .default_option
        .clone()
        .filter(|id| request.option(id).is_some())
        .or_else(|| match request.kind {
            HitlKind::SchemeSelection => auto_select_scheme(request),
            _ => request.options.first().map(|o| o.id.clone()),
        })?;
    let mut response = HitlResponse::select(&request.id, option);
    response.comment = Some("等待超时，系统自动选择".to_string());
    Some(response)
}

/// 响应落到状态上的结果
#[derive(Debug, Clone, PartialEq)]
pub enum HitlApplied {
    Selected { option_id: String },
    /// 人工选择终止，任务已标记失败
    Aborted,
}

/// 选择结果在共享上下文中的专用键
fn context_key(kind: HitlKind) -> Option<&'static str> {
    match kind {
        HitlKind::SchemeSelection => Some("selected_scheme"),
        HitlKind::ParameterConfirm => Some("confirmed_parameters"),
        HitlKind::ReportOutline => Some("report_outline"),
        HitlKind::RiskWarning => None,
    }
}

fn overlay(base: Value, modified: Option<&Value>) -> Value {
    match (base, modified) {
        (Value::Object(mut base), Some(Value::Object(changes))) => {
            for (k, v) in changes {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, Some(other)) => other.clone(),
        (base, None) => base,
    }
}

/// 把人工响应写入状态：选择结果进入共享上下文，清除 pending，记录已应用的请求 id
///
/// 不推进下标，由调用方决定。
pub fn apply_response(
    state: &mut WorkflowState,
    request: &HitlRequest,
    response: &HitlResponse,
) -> HitlApplied {
    state.pending_hitl = None;
    state.last_hitl_response = Some(response.clone());
    state.mark_hitl_applied(&request.id);

    if request.kind != HitlKind::SchemeSelection && response.selected_option == OPTION_ABORT {
        if let Some(task) = state.task_by_id_mut(&request.task_id) {
            task.status = TaskStatus::Failed;
            task.error = Some("用户在人工确认中终止了该步骤".to_string());
        }
        state.counters.errors += 1;
        return HitlApplied::Aborted;
    }

    let candidate = request
        .option(&response.selected_option)
        .map(HitlOption::candidate)
        .unwrap_or(Value::Null);
    let selected = overlay(candidate, response.modified_data.as_ref());

    let mut selection = Map::new();
    selection.insert("request_id".into(), request.id.clone().into());
    selection.insert("kind".into(), serde_json::to_value(request.kind).unwrap_or(Value::Null));
    selection.insert("option_id".into(), response.selected_option.clone().into());
    selection.insert("data".into(), selected.clone());
    if let Some(ref comment) = response.comment {
        selection.insert("comment".into(), comment.clone().into());
    }
    state.context.insert("hitl_selection".into(), Value::Object(selection));
    if let Some(key) = context_key(request.kind) {
        state.context.insert(key.into(), selected);
    }

    HitlApplied::Selected {
        option_id: response.selected_option.clone(),
    }
}
