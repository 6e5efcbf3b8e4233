use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use tracing::debug;

use scheduler_core::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 支持5段（分 时 日 月 周）和6/7段（秒 分 时 日 月 周 [年]）写法，
/// 5段写法补齐秒字段为0。星期字段遵循 1=周日 的约定，也接受 MON..SUN。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = Self::normalize(cron_expr)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.trim().to_string(),
            schedule,
        })
    }

    /// 5段表达式前补秒字段
    pub fn normalize(cron_expr: &str) -> SchedulerResult<String> {
        let fields: Vec<&str> = cron_expr.split_whitespace().collect();
        match fields.len() {
            5 => Ok(format!("0 {}", fields.join(" "))),
            6 | 7 => Ok(fields.join(" ")),
            n => Err(SchedulerError::InvalidCron {
                expr: cron_expr.to_string(),
                message: format!("需要5到7个字段，实际为{n}个"),
            }),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `after` 的最早触发时间
    pub fn next_fire_time<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// 按本地日历计算下一次触发时间，没有后续触发时间时返回错误
    pub fn next_fire_time_local(&self, after: DateTime<Local>) -> SchedulerResult<DateTime<Local>> {
        self.next_fire_time(&after)
            .ok_or_else(|| SchedulerError::InvalidCron {
                expr: self.expression.clone(),
                message: format!("{} 之后没有触发时间", after.format("%Y-%m-%d %H:%M:%S")),
            })
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times<Tz: TimeZone>(&self, from: &DateTime<Tz>, count: usize) -> Vec<DateTime<Tz>> {
        self.schedule.after(from).take(count).collect()
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next(&self, now: DateTime<Local>) -> SchedulerResult<Duration> {
        let next = self.next_fire_time_local(now)?;
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(
            "CRON {} 下次触发: {}, 等待 {}ms",
            self.expression,
            next.format("%Y-%m-%d %H:%M:%S"),
            delay.as_millis()
        );
        Ok(delay)
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 按本地日历计算表达式在 `after` 之后的下一次触发时间
pub fn next_fire_time(cron_expr: &str, after: DateTime<Local>) -> SchedulerResult<DateTime<Local>> {
    CronScheduler::new(cron_expr)?.next_fire_time_local(after)
}
