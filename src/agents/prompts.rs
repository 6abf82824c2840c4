//! 规划、反思与结果整合的提示词模板（占位符由 render_prompt 替换）

pub const PLANNER_SYSTEM_PROMPT: &str = r#"你是管道能耗分析系统的任务规划器。你需要把用户请求拆解为按顺序执行的步骤，每一步交给一个专业执行器：
- data_agent：查询项目、管道、泵站、油品等业务数据
- calc_agent：水力计算、摩阻/压降计算、泵站优化
- knowledge_agent：检索领域知识、规范与原理
- graph_agent：知识图谱关系查询与因果推理
- report_agent：生成报告结构与结论

只输出 JSON，格式如下：
{"reasoning": "规划思路", "plan": [{"step_number": 1, "description": "...", "agent": "data_agent", "expected_output": "...", "depends_on": []}]}

如果用户只是问候、闲聊或与管道业务无关，输出 {"direct_response": true, "reasoning": "..."}。"#;

pub const PLANNER_TASK_PROMPT: &str = r#"用户请求: {user_input}

可用上下文:
{available_context}

请输出执行计划 JSON。"#;

pub const PLANNER_REPLAN_PROMPT: &str = r#"用户请求: {user_input}

已完成的步骤（保持不变，不要重复）:
{completed_steps}

失败的步骤:
{failed_step}

反思结论:
{reflexion}

请只为剩余工作输出新的执行计划 JSON，step_number 从 1 开始。"#;

pub const REFLEXION_PROMPT: &str = r#"一个执行步骤失败了，请分析原因并给出恢复策略。

步骤描述: {step_description}
执行器: {agent}
错误信息: {error_message}

当前上下文:
{context}

此前的反思记录:
{previous_reflexions}

只输出 JSON：
{"failure_reason": "...", "lesson_learned": "...", "revised_approach": "...", "should_retry": true, "should_replan": false}"#;

pub const SYNTHESIS_PROMPT: &str = r#"你需要整合以下执行器的结果，生成最终回答。

用户问题: {user_input}

执行结果:
{agent_results}

请生成一个完整、专业的回答：
1. 直接回答用户问题
2. 必要时引用数据来源
3. 提供有价值的分析或建议
4. 保持简洁清晰的表达"#;
