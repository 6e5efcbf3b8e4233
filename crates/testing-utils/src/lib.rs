//! # Scheduler Testing Utils
//!
//! 工作区内各crate共享的测试工具。
//!
//! - **builders**: `TaskConfigBuilder`、`DeclaredTaskBuilder`
//! - **mocks**: 记录各阶段调用次数的 `RecordingJob`、`KvStore` 的 mockall 实现
//! - **helpers**: 轮询等待和测试日志初始化
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
