use std::fmt;

use thiserror::Error;

/// 任务生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Before,
    Execute,
    After,
    Destroy,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Before => "before",
            TaskPhase::Execute => "execute",
            TaskPhase::After => "after",
            TaskPhase::Destroy => "destroy",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务ID重复: {id}")]
    DuplicateTask { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("任务阶段 {phase} 执行失败: {message}")]
    TaskPhase { phase: TaskPhase, message: String },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("键不存在: {key}")]
    KeyNotFound { key: String },

    #[error("键已存在: {key}")]
    KeyAlreadyExists { key: String },

    #[error("索引不匹配: {key} (期望 {expected}, 实际 {actual})")]
    IndexMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("存储操作超时: {0}")]
    StoreTimeout(String),

    #[error("存储错误: {0}")]
    Store(String),

    #[error("无法识别的拓扑路径: {key} (深度 {depth})")]
    UnknownTopologyPath { key: String, depth: usize },

    #[error("加密失败: {0}")]
    Encryption(String),

    #[error("解密失败: {0}")]
    Decryption(String),

    #[error("等待任务退出超时: 剩余 {remaining} 个任务, 已等待 {waited_ms}ms")]
    DrainTimeout { remaining: usize, waited_ms: u64 },

    #[error("调度器已关闭")]
    ExecutorShutdown,

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }

    pub fn store_error<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn key_not_found<S: Into<String>>(key: S) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    pub fn key_already_exists<S: Into<String>>(key: S) -> Self {
        Self::KeyAlreadyExists { key: key.into() }
    }

    pub fn phase(phase: TaskPhase, err: &SchedulerError) -> Self {
        Self::TaskPhase {
            phase,
            message: err.to_string(),
        }
    }

    /// 加载期错误，出现时整个调度子系统不能启动
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_)
                | SchedulerError::DuplicateTask { .. }
                | SchedulerError::InvalidCron { .. }
                | SchedulerError::Internal(_)
        )
    }

    /// 与分布式存储交互时可以通过退避重试恢复的错误
    pub fn is_store_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::KeyNotFound { .. }
                | SchedulerError::KeyAlreadyExists { .. }
                | SchedulerError::IndexMismatch { .. }
                | SchedulerError::StoreTimeout(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.is_store_transient() || matches!(self, SchedulerError::Store(_))
    }

    pub fn is_key_not_found(&self) -> bool {
        matches!(self, SchedulerError::KeyNotFound { .. })
    }

    pub fn is_key_already_exists(&self) -> bool {
        matches!(self, SchedulerError::KeyAlreadyExists { .. })
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::DuplicateTask { id: "a-0".into() }.is_fatal());
        assert!(SchedulerError::InvalidCron {
            expr: "x".into(),
            message: "bad".into()
        }
        .is_fatal());
        assert!(!SchedulerError::task_execution("boom").is_fatal());

        assert!(SchedulerError::key_not_found("/a").is_store_transient());
        assert!(SchedulerError::key_already_exists("/a").is_store_transient());
        assert!(SchedulerError::StoreTimeout("put".into()).is_store_transient());
        assert!(!SchedulerError::store_error("disk").is_store_transient());
        assert!(SchedulerError::store_error("disk").is_retryable());
        assert!(!SchedulerError::Decryption("tag".into()).is_retryable());
    }

    #[test]
    fn test_phase_error_message() {
        let err = SchedulerError::phase(TaskPhase::Before, &SchedulerError::task_execution("boom"));
        assert_eq!(err.to_string(), "任务阶段 before 执行失败: 任务执行错误: boom");
    }
}
