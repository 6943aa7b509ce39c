// Ollama relay bot library entry
// 二进制入口只负责装配，所有组件都在此声明，便于集成测试直接使用。

pub mod backend;
pub mod cancellation;
pub mod channel;
pub mod commands;
pub mod config;
pub mod error;
pub mod execution;
pub mod i18n;
pub mod models;
pub mod renderer;
pub mod scheduler;
pub mod stream_consumer;
pub mod telegram;
pub mod test_utils;
pub mod thinking;
pub mod usage;
pub mod utils;

pub use error::{RelayError, RelayResult};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 安装全局日志订阅者；默认 info，可由 `RUST_LOG` 覆盖
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // 重复初始化（如测试中）时忽略错误
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
