use serde::{Deserialize, Serialize};
use tracing::warn;

use scheduler_core::{SchedulerError, SchedulerResult};

/// 任务类声明的调度配置，由外部的类扫描组件提供
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DeclaredTaskConfig {
    pub name: String,
    /// 分片ID前缀，缺省为 name
    pub id: Option<String>,
    /// 分组，缺省为 name
    pub group: Option<String>,
    pub before_after_only: bool,
    pub run_number_of_times: i64,
    pub interval_millis: u64,
    pub parallel: u32,
    pub parallel_property_name: Option<String>,
    pub core_parallel: bool,
    pub cron_expression: Option<String>,
    pub cron_property_name: Option<String>,
    pub daemon: bool,
    pub lazy: bool,
}

impl Default for DeclaredTaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: None,
            group: None,
            before_after_only: false,
            run_number_of_times: 0,
            interval_millis: 1000,
            parallel: 1,
            parallel_property_name: None,
            core_parallel: false,
            cron_expression: None,
            cron_property_name: None,
            daemon: true,
            lazy: false,
        }
    }
}

impl DeclaredTaskConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn base_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::config_error("任务名称不能为空"));
        }
        if self.run_number_of_times < 0 {
            return Err(SchedulerError::config_error(format!(
                "任务 {} 的执行次数不能为负数: {}",
                self.name, self.run_number_of_times
            )));
        }
        if self.run_number_of_times > u32::MAX as i64 {
            return Err(SchedulerError::config_error(format!(
                "任务 {} 的执行次数过大: {}",
                self.name, self.run_number_of_times
            )));
        }
        if self.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(SchedulerError::config_error(format!(
                "任务 {} 声明了空的ID",
                self.name
            )));
        }
        Ok(())
    }
}

/// 单个引擎实例的最终配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub id: String,
    pub group: String,
    pub name: String,
    pub shard: usize,
    pub lazy_start: bool,
    /// before/after 在整个生命周期内只执行一次
    pub run_before_after_once: bool,
    /// 0 表示不限次数
    pub run_count: u32,
    pub interval_millis: u64,
    /// 存在时优先于固定间隔
    pub cron_expression: Option<String>,
    pub daemon: bool,
}

impl TaskConfig {
    pub fn new<S: Into<String>>(id: S, group: S, name: S) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            name: name.into(),
            shard: 0,
            lazy_start: false,
            run_before_after_once: false,
            run_count: 0,
            interval_millis: 1000,
            cron_expression: None,
            daemon: true,
        }
    }

    pub fn with_interval_millis(mut self, interval_millis: u64) -> Self {
        self.interval_millis = interval_millis;
        self
    }

    pub fn with_cron<S: Into<String>>(mut self, expr: S) -> Self {
        self.cron_expression = Some(expr.into());
        self
    }

    pub fn with_run_count(mut self, run_count: u32) -> Self {
        self.run_count = run_count;
        self
    }

    pub fn with_lazy_start(mut self, lazy_start: bool) -> Self {
        self.lazy_start = lazy_start;
        self
    }

    pub fn with_before_after_once(mut self, once: bool) -> Self {
        self.run_before_after_once = once;
        self
    }

    pub fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn with_shard(mut self, shard: usize) -> Self {
        self.shard = shard;
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.run_count > 0
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::config_error("任务ID不能为空"));
        }
        if self.name.trim().is_empty() {
            return Err(SchedulerError::config_error(format!(
                "任务 {} 的名称不能为空",
                self.id
            )));
        }
        if self.cron_expression.is_none() && self.interval_millis == 0 && self.run_count == 0 {
            warn!("任务 {} 没有CRON表达式且间隔为0，将连续执行", self.id);
        }
        Ok(())
    }
}

/// 执行引擎状态：Idle → Running → Closing → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Running,
    Closing,
    Closed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Closing => "closing",
            EngineState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Closed)
    }
}
