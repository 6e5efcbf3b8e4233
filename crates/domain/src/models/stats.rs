use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::TaskPhase;

use super::task::EngineState;

/// 保留最近多少个周期的耗时样本
pub const DURATION_WINDOW: usize = 32;

/// 单个引擎的执行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub cycles: u64,
    pub before_failures: u64,
    pub execute_failures: u64,
    pub after_failures: u64,
    pub destroy_failures: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub recent_durations_ms: VecDeque<u64>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&mut self, started_at: DateTime<Utc>, duration: Duration) {
        self.cycles += 1;
        self.last_cycle_at = Some(started_at);
        if self.recent_durations_ms.len() == DURATION_WINDOW {
            self.recent_durations_ms.pop_front();
        }
        self.recent_durations_ms
            .push_back(duration.as_millis().min(u64::MAX as u128) as u64);
    }

    pub fn record_failure(&mut self, phase: TaskPhase) {
        match phase {
            TaskPhase::Before => self.before_failures += 1,
            TaskPhase::Execute => self.execute_failures += 1,
            TaskPhase::After => self.after_failures += 1,
            TaskPhase::Destroy => self.destroy_failures += 1,
        }
    }

    pub fn failures(&self, phase: TaskPhase) -> u64 {
        match phase {
            TaskPhase::Before => self.before_failures,
            TaskPhase::Execute => self.execute_failures,
            TaskPhase::After => self.after_failures,
            TaskPhase::Destroy => self.destroy_failures,
        }
    }

    pub fn total_failures(&self) -> u64 {
        self.before_failures + self.execute_failures + self.after_failures + self.destroy_failures
    }

    pub fn average_duration_ms(&self) -> Option<f64> {
        if self.recent_durations_ms.is_empty() {
            return None;
        }
        let total: u64 = self.recent_durations_ms.iter().sum();
        Some(total as f64 / self.recent_durations_ms.len() as f64)
    }

    pub fn max_duration_ms(&self) -> Option<u64> {
        self.recent_durations_ms.iter().copied().max()
    }
}

/// 引擎某一时刻的只读视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub id: String,
    pub group: String,
    pub name: String,
    pub shard: usize,
    pub state: EngineState,
    pub marked_for_removal: bool,
    pub cycle_count: u32,
    pub stats: ExecutionStats,
}

impl EngineSnapshot {
    /// 已停止且被注册表主动移除
    pub fn is_removed(&self) -> bool {
        self.state == EngineState::Closed && self.marked_for_removal
    }
}
