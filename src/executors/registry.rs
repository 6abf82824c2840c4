//! 任务执行器注册表
//!
//! 五类执行器（data / calc / knowledge / graph / report）实现 TaskExecutor，
//! 由 ExecutorRegistry 按种类注册与查找。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::workflow::ExecutorKind;

/// 任务执行器：接收任务描述与共享上下文，返回结果文本或错误
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn execute(&self, description: &str, context: &Value) -> Result<String, String>;
}

#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一种类重复注册时后者覆盖前者
    pub fn register(&mut self, executor: impl TaskExecutor + 'static) {
        self.register_arc(Arc::new(executor));
    }

    pub fn register_arc(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ExecutorKind> {
        ExecutorKind::ALL
            .into_iter()
            .filter(|k| self.executors.contains_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(ExecutorKind, &'static str);

    #[async_trait]
    impl TaskExecutor for Fixed {
        fn kind(&self) -> ExecutorKind {
            self.0
        }

        async fn execute(&self, _description: &str, _context: &Value) -> Result<String, String> {
            Ok(self.1.to_string())
        }
    }

    #[tokio::test]
    async fn test_register_and_replace() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Fixed(ExecutorKind::Calc, "v1"));
        registry.register(Fixed(ExecutorKind::Calc, "v2"));
        registry.register(Fixed(ExecutorKind::Data, "rows"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.kinds(), vec![ExecutorKind::Data, ExecutorKind::Calc]);
        let calc = registry.get(ExecutorKind::Calc).unwrap();
        assert_eq!(calc.execute("x", &Value::Null).await.unwrap(), "v2");
        assert!(registry.get(ExecutorKind::Graph).is_none());
    }
}
