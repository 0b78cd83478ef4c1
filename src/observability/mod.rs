//! 可观测性：tracing 订阅器
//!
//! 默认级别 info，可用 RUST_LOG 覆盖（如 `RUST_LOG=forager=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；重复调用时保持第一次的设置
pub fn init() {
    init_with_default("info");
}

/// `default_directive` 只在 RUST_LOG 未设置或无法解析时生效
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_default("debug");
        tracing::info!("subscriber installed");
    }
}
