//! 有界并发收集
//!
//! 只读的数据收集分支并行执行（JoinSet + Semaphore 限流），
//! 单个分支的错误或 panic 转成该分支的 `{"error": ...}` 结果，不影响其他分支。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub type BranchFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// 一个命名的收集分支
pub struct Branch {
    pub name: String,
    pub future: BranchFuture,
}

impl Branch {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

/// 并发执行所有分支，最多 max_parallel 个同时运行；结果按输入顺序返回
pub async fn gather(branches: Vec<Branch>, max_parallel: usize) -> Vec<(String, Value)> {
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut set = JoinSet::new();
    let names: Vec<String> = branches.iter().map(|b| b.name.clone()).collect();

    for (index, branch) in branches.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = AssertUnwindSafe(branch.future).catch_unwind().await;
            let value = match outcome {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => serde_json::json!({ "error": e }),
                Err(_) => serde_json::json!({ "error": format!("branch {} panicked", branch.name) }),
            };
            (index, value)
        });
    }

    let mut results: Vec<Option<Value>> = vec![None; names.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, value)) => results[index] = Some(value),
            Err(e) => tracing::warn!(error = %e, "gather branch aborted"),
        }
    }

    names
        .into_iter()
        .zip(results)
        .map(|(name, value)| {
            let value = value.unwrap_or_else(|| serde_json::json!({ "error": "branch aborted" }));
            (name, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_gather_isolates_failures_and_keeps_order() {
        let branches = vec![
            Branch::new("flow", async { Ok(serde_json::json!({ "flow": 1200 })) }),
            Branch::new("pressure", async { Err("sensor offline".to_string()) }),
            Branch::new("pumps", async {
                if true {
                    panic!("bad row");
                }
                Ok(Value::Null)
            }),
        ];
        let results = gather(branches, 2).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "flow");
        assert_eq!(results[0].1["flow"], 1200);
        assert_eq!(results[1].1["error"], "sensor offline");
        assert!(results[2].1["error"].as_str().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_gather_respects_parallel_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let branches = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Branch::new(format!("b{}", i), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::from(i))
                })
            })
            .collect();
        let results = gather(branches, 2).await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(results[5].1, 5);
    }
}
