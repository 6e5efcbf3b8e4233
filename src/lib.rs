//! 分布式任务调度核心
//!
//! 二进制入口在 `main.rs`，这里导出应用装配和关闭管理，便于嵌入和集成测试。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
