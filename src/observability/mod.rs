//! 可观测性
//!
//! 日志默认写 stderr，stdout 留给 CLI 输出的 JSON 结果。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber；RUST_LOG 优先于 level。重复调用无副作用
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        init("not a valid directive ===");
        tracing::info!("still logging");
    }
}
