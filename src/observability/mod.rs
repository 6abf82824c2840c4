//! 可观测性：日志初始化与运行级 Trace 事件

pub mod bus;
pub mod events;
pub mod tracer;

pub use bus::TraceBus;
pub use events::{TraceEvent, TraceEventType};
pub use tracer::{RunMetrics, RunTracer, StreamItem, TraceStream};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 tracing subscriber；RUST_LOG 未设置时默认 info
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
