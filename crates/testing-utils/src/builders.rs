//! 测试数据构建器，带合理默认值

use scheduler_domain::{DeclaredTaskConfig, TaskConfig};

/// 构建单个引擎的 `TaskConfig`，默认不限次数、间隔10ms
pub struct TaskConfigBuilder {
    config: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            config: TaskConfig::new(id, id, id).with_interval_millis(10),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.config.group = group.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn with_interval_millis(mut self, interval_millis: u64) -> Self {
        self.config.interval_millis = interval_millis;
        self
    }

    pub fn with_cron(mut self, expr: &str) -> Self {
        self.config.cron_expression = Some(expr.to_string());
        self
    }

    pub fn with_run_count(mut self, run_count: u32) -> Self {
        self.config.run_count = run_count;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.config.lazy_start = true;
        self
    }

    pub fn before_after_once(mut self) -> Self {
        self.config.run_before_after_once = true;
        self
    }

    pub fn non_daemon(mut self) -> Self {
        self.config.daemon = false;
        self
    }

    pub fn build(self) -> TaskConfig {
        self.config
    }
}

/// 构建发现组件提供的任务声明
pub struct DeclaredTaskBuilder {
    declared: DeclaredTaskConfig,
}

impl DeclaredTaskBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            declared: DeclaredTaskConfig {
                interval_millis: 10,
                ..DeclaredTaskConfig::new(name)
            },
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.declared.id = Some(id.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.declared.group = Some(group.to_string());
        self
    }

    pub fn with_parallel(mut self, parallel: u32) -> Self {
        self.declared.parallel = parallel;
        self
    }

    pub fn with_parallel_property(mut self, name: &str) -> Self {
        self.declared.parallel_property_name = Some(name.to_string());
        self
    }

    pub fn core_parallel(mut self) -> Self {
        self.declared.core_parallel = true;
        self
    }

    pub fn with_cron(mut self, expr: &str) -> Self {
        self.declared.cron_expression = Some(expr.to_string());
        self
    }

    pub fn with_cron_property(mut self, name: &str) -> Self {
        self.declared.cron_property_name = Some(name.to_string());
        self
    }

    pub fn with_interval_millis(mut self, interval_millis: u64) -> Self {
        self.declared.interval_millis = interval_millis;
        self
    }

    pub fn with_run_count(mut self, run_count: i64) -> Self {
        self.declared.run_number_of_times = run_count;
        self
    }

    pub fn before_after_only(mut self) -> Self {
        self.declared.before_after_only = true;
        self
    }

    pub fn non_daemon(mut self) -> Self {
        self.declared.daemon = false;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.declared.lazy = true;
        self
    }

    pub fn build(self) -> DeclaredTaskConfig {
        self.declared
    }
}
