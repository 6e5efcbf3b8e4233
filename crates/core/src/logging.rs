use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{LoggingConfig, SchedulerError, SchedulerResult};

/// 初始化日志系统，`RUST_LOG` 优先于配置中的级别
pub fn init_logging(level: &str, format: &str) -> SchedulerResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| SchedulerError::config_error(format!("初始化JSON日志格式失败: {e}"))),
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| SchedulerError::config_error(format!("初始化Pretty日志格式失败: {e}"))),
        _ => Err(SchedulerError::config_error(format!(
            "不支持的日志格式: {format}"
        ))),
    }
}

pub fn init_logging_from_config(config: &LoggingConfig) -> SchedulerResult<()> {
    init_logging(&config.level, &config.format)
}
