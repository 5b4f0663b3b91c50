//! 面向二进制与演示程序的日志安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：库代码只发出 `tracing` 事件、从不安装 Subscriber；需要看日志的进程调用一次
//!   [`install_fmt_subscriber`] 即可；
//! - **逻辑（How）**：`EnvFilter`（读取 `RUST_LOG`，缺省 `info`）叠加 `fmt` 层，设置为全局 Subscriber；
//! - **契约（What）**：外部已设置全局 Subscriber 时返回 [`TelemetryError::SubscriberAlreadySet`]，
//!   不会覆盖宿主的配置。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 进程内已存在全局 `tracing` Subscriber。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to install the global tracing subscriber: {0}")]
    SetGlobalDefault(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 全局 Subscriber。
pub fn install_fmt_subscriber() -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
