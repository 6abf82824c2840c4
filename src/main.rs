//! pipeline-agent 命令行入口
//!
//! 用法：`pipeline-agent <请求文本>`。Trace 事件以 JSON 行输出到 stdout；
//! 运行挂起等待人工确认时从 stdin 读取选项 id，空行或超时按配置的超时策略处理。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use pipeline_agent::core::create_engine_builder;
use pipeline_agent::observability;
use pipeline_agent::workflow::{HitlResponse, RunPhase};
use pipeline_agent::WorkflowError;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let user_input = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if user_input.trim().is_empty() {
        anyhow::bail!("usage: pipeline-agent <request>");
    }
    let session_id = std::env::var("PIPELINE_SESSION_ID")
        .unwrap_or_else(|_| format!("cli_{}", uuid::Uuid::new_v4()));

    let engine = Arc::new(
        create_engine_builder(None)
            .build()
            .context("Failed to build workflow engine")?,
    );

    let ctrl_c_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling runs");
            ctrl_c_engine.supervisor().cancel_all();
        }
    });

    let (state, tracer) = engine.begin(&session_id, &user_input);
    let mut stream = tracer
        .subscribe()
        .context("trace stream already subscribed")?;
    let printer = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            println!("{}", item.to_frame());
        }
    });

    let mut state = match engine.run_state(state).await {
        Ok(state) => state,
        Err(e) => {
            printer.abort();
            return Err(e).context("Workflow run failed");
        }
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while state.phase == RunPhase::WaitingForHuman {
        let Some(request) = state.pending_hitl.clone() else {
            break;
        };
        let options: Vec<&str> = request.options.iter().map(|o| o.id.as_str()).collect();
        eprintln!("[{}] {} (options: {})", request.id, request.title, options.join(", "));

        let wait = Duration::from_secs(request.timeout_secs);
        let answer = match tokio::time::timeout(wait, stdin.next_line()).await {
            Ok(Ok(Some(line))) => Some(line.trim().to_string()).filter(|l| !l.is_empty()),
            _ => None,
        };

        state = match answer {
            Some(option) => {
                match engine
                    .resume(&session_id, HitlResponse::select(&request.id, &option))
                    .await
                {
                    Err(WorkflowError::InvalidOption { option, .. }) => {
                        eprintln!("unknown option: {}", option);
                        state
                    }
                    Err(WorkflowError::HitlExpired(_)) => engine.expire_pending(&session_id).await?,
                    other => other?,
                }
            }
            None => engine.expire_pending(&session_id).await?,
        };
    }

    let _ = printer.await;
    if state.phase == RunPhase::Failed {
        std::process::exit(1);
    }
    Ok(())
}
