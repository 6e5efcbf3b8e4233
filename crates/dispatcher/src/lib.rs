//! 任务调度执行层
//!
//! - **cron_utils**: CRON表达式求值
//! - **engine**: 单个任务实例的执行引擎
//! - **executor**: 所有引擎共享的执行器
//! - **loader**: 任务声明到分片配置的展开
//! - **registry**: 存活引擎的注册表和生命周期管理

pub mod cron_utils;
pub mod engine;
pub mod executor;
pub mod loader;
pub mod registry;

pub use cron_utils::{next_fire_time, CronScheduler};
pub use engine::{EngineListener, TaskEngine, TaskRuntimeState, DEFAULT_PHASE_ERROR_BACKOFF};
pub use executor::SharedExecutor;
pub use loader::{expand, resolve_cron, resolve_parallel, TaskDeclaration};
pub use registry::{RegistrySettings, SchedulerRegistry};
