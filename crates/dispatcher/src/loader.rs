use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use scheduler_core::{JobFactory, PropertySets, ScheduledJob, SchedulerError, SchedulerResult};
use scheduler_domain::{DeclaredTaskConfig, TaskConfig};

use crate::cron_utils::CronScheduler;

/// 外部发现组件提供的任务声明：声明配置和创建任务实例的工厂
#[derive(Clone)]
pub struct TaskDeclaration {
    pub declared: DeclaredTaskConfig,
    pub factory: JobFactory,
}

impl TaskDeclaration {
    pub fn new(declared: DeclaredTaskConfig, factory: JobFactory) -> Self {
        Self { declared, factory }
    }

    /// 每个分片使用同一个工厂函数创建任务实例
    pub fn from_fn<F>(declared: DeclaredTaskConfig, factory: F) -> Self
    where
        F: Fn(usize) -> Arc<dyn ScheduledJob> + Send + Sync + 'static,
    {
        Self::new(declared, Arc::new(factory))
    }
}

impl fmt::Debug for TaskDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDeclaration")
            .field("declared", &self.declared)
            .finish_non_exhaustive()
    }
}

/// 并行度：coreParallel > 属性配置 > 显式值
pub fn resolve_parallel(
    declared: &DeclaredTaskConfig,
    properties: &PropertySets,
) -> SchedulerResult<usize> {
    let parallel = if declared.core_parallel {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else if let Some(name) = declared.parallel_property_name.as_deref() {
        match properties.lookup(name) {
            Some(value) => value.trim().parse::<usize>().map_err(|e| {
                SchedulerError::config_error(format!(
                    "任务 {} 的并行度属性 {}={} 无效: {}",
                    declared.name, name, value, e
                ))
            })?,
            None => {
                warn!(
                    "任务 {} 的并行度属性 {} 未配置，使用声明值 {}",
                    declared.name, name, declared.parallel
                );
                declared.parallel as usize
            }
        }
    } else {
        declared.parallel as usize
    };

    if parallel == 0 {
        return Err(SchedulerError::config_error(format!(
            "任务 {} 的并行度不能为0",
            declared.name
        )));
    }
    Ok(parallel)
}

/// CRON表达式：属性配置覆盖声明值，空字符串视为未配置
pub fn resolve_cron(
    declared: &DeclaredTaskConfig,
    properties: &PropertySets,
) -> SchedulerResult<Option<String>> {
    let from_property = declared
        .cron_property_name
        .as_deref()
        .and_then(|name| properties.lookup(name));

    let expr = from_property
        .or(declared.cron_expression.as_deref())
        .map(str::trim)
        .filter(|expr| !expr.is_empty());

    match expr {
        Some(expr) => {
            CronScheduler::validate_cron_expression(expr)?;
            Ok(Some(expr.to_string()))
        }
        None => Ok(None),
    }
}

/// 将一个声明展开为 `parallel` 个分片配置，ID 为 `{基础ID}-{分片序号}`
pub fn expand(
    declared: &DeclaredTaskConfig,
    properties: &PropertySets,
) -> SchedulerResult<Vec<TaskConfig>> {
    declared.validate()?;
    let parallel = resolve_parallel(declared, properties)?;
    let cron_expression = resolve_cron(declared, properties)?;
    let base_id = declared.base_id();
    let group = declared.group_name();

    debug!(
        "展开任务 {}: 并行度 {}, CRON {:?}",
        declared.name, parallel, cron_expression
    );

    Ok((0..parallel)
        .map(|shard| TaskConfig {
            id: format!("{base_id}-{shard}"),
            group: group.to_string(),
            name: declared.name.clone(),
            shard,
            lazy_start: declared.lazy,
            run_before_after_once: declared.before_after_only,
            run_count: declared.run_number_of_times as u32,
            interval_millis: declared.interval_millis,
            cron_expression: cron_expression.clone(),
            daemon: declared.daemon,
        })
        .collect())
}
