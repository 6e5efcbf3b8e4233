//! 调度核心配置
//!
//! - **app_config**: 应用配置模型，文件 + 环境变量两级加载
//! - **properties**: 任务声明引用的属性集合，后加载的配置优先

pub mod app_config;
pub mod properties;

pub use app_config::{local_hostname, AppConfig, ClusterConfig, LoggingConfig, SchedulerConfig};
pub use properties::PropertySets;
