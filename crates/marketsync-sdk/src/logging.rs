//! 日志初始化
//!
//! 宿主应用可以自行安装 tracing subscriber；未安装时调用 [`init_logging`] 即可。

use tracing_subscriber::EnvFilter;

/// 安装 fmt subscriber
///
/// `RUST_LOG` 优先；未设置时调试模式为 `debug`，否则为 `info`。
/// 重复调用是安全的，已安装时直接返回 false。
pub fn init_logging(debug_mode: bool) -> bool {
    let default_level = if debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let _first = init_logging(true);
        assert!(!init_logging(false));
    }
}
