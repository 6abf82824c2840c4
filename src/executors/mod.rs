//! 任务执行器：注册表、分发边界、HTTP 适配与并发收集

pub mod dispatch;
pub mod fanout;
pub mod http;
pub mod registry;

pub use dispatch::{classify, fold_into_context, Classified, DispatchOutcome, DispatchSuccess, TaskDispatcher};
pub use fanout::{gather, Branch};
pub use http::{registry_from_endpoints, HttpTaskExecutor};
pub use registry::{ExecutorRegistry, TaskExecutor};
