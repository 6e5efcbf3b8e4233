use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use metrics::{counter, histogram};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use scheduler_core::{ScheduledJob, SchedulerError, SchedulerResult, TaskPhase};
use scheduler_domain::{EngineSnapshot, EngineState, ExecutionStats, TaskConfig};

use crate::cron_utils::CronScheduler;
use crate::executor::SharedExecutor;

/// 阶段失败后的固定退避时间
pub const DEFAULT_PHASE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 引擎退出时的回调，注册表借此解除绑定
#[async_trait]
pub trait EngineListener: Send + Sync {
    async fn engine_closed(&self, engine: &Arc<TaskEngine>);
}

/// 引擎私有的运行时状态，只由引擎循环和关闭请求修改
#[derive(Debug, Clone)]
pub struct TaskRuntimeState {
    pub engine_state: EngineState,
    pub closing: bool,
    pub marked_for_removal: bool,
    pub before_done: bool,
    pub after_done: bool,
    pub cycle_count: u32,
    pub stats: ExecutionStats,
}

impl Default for TaskRuntimeState {
    fn default() -> Self {
        Self {
            engine_state: EngineState::Idle,
            closing: false,
            marked_for_removal: false,
            before_done: false,
            after_done: false,
            cycle_count: 0,
            stats: ExecutionStats::new(),
        }
    }
}

/// 单个任务实例的执行引擎
///
/// 状态流转 Idle → Running → Closing → Closed。每个周期按 before → execute → after
/// 的顺序尽力执行各阶段，之后按CRON表达式或固定间隔进入可中断的等待。
pub struct TaskEngine {
    config: TaskConfig,
    cron: Option<CronScheduler>,
    job: Arc<dyn ScheduledJob>,
    executor: Arc<SharedExecutor>,
    phase_error_backoff: Duration,
    state: RwLock<TaskRuntimeState>,
    wakeup: Notify,
    closed: Notify,
    finished: AtomicBool,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("id", &self.config.id)
            .field("group", &self.config.group)
            .finish()
    }
}

impl TaskEngine {
    pub fn new(
        config: TaskConfig,
        job: Arc<dyn ScheduledJob>,
        executor: Arc<SharedExecutor>,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        let cron = config
            .cron_expression
            .as_deref()
            .map(CronScheduler::new)
            .transpose()?;

        Ok(Self {
            config,
            cron,
            job,
            executor,
            phase_error_backoff: DEFAULT_PHASE_ERROR_BACKOFF,
            state: RwLock::new(TaskRuntimeState::default()),
            wakeup: Notify::new(),
            closed: Notify::new(),
            finished: AtomicBool::new(false),
        })
    }

    pub fn with_phase_error_backoff(mut self, backoff: Duration) -> Self {
        self.phase_error_backoff = backoff;
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    pub fn executor(&self) -> &Arc<SharedExecutor> {
        &self.executor
    }

    /// CRON优先，否则使用固定间隔
    pub fn next_delay(&self, now: DateTime<Local>) -> SchedulerResult<Duration> {
        match &self.cron {
            Some(cron) => cron.time_until_next(now),
            None => Ok(Duration::from_millis(self.config.interval_millis)),
        }
    }

    /// 延迟启动时首个周期前的等待时间
    pub fn initial_delay(&self, now: DateTime<Local>) -> SchedulerResult<Option<Duration>> {
        if !self.config.lazy_start {
            return Ok(None);
        }
        self.next_delay(now).map(Some)
    }

    /// 请求关闭：设置关闭标记并唤醒等待中的引擎
    ///
    /// 正在执行的阶段不会被打断，引擎在下一次循环检查时退出。
    pub async fn close(&self, mark_for_removal: bool) {
        {
            let mut state = self.state.write().await;
            if state.engine_state.is_terminal() {
                return;
            }
            state.closing = true;
            state.marked_for_removal |= mark_for_removal;
            if state.engine_state == EngineState::Running {
                state.engine_state = EngineState::Closing;
            }
        }
        debug!("任务 {} 收到关闭请求", self.config.id);
        self.wakeup.notify_one();
    }

    pub async fn is_closing(&self) -> bool {
        self.state.read().await.closing
    }

    /// 引擎循环结束且 destroy 已调用
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub async fn wait_closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_finished() {
            return;
        }
        notified.await;
    }

    pub async fn state(&self) -> EngineState {
        self.state.read().await.engine_state
    }

    pub async fn runtime_state(&self) -> TaskRuntimeState {
        self.state.read().await.clone()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.read().await;
        EngineSnapshot {
            id: self.config.id.clone(),
            group: self.config.group.clone(),
            name: self.config.name.clone(),
            shard: self.config.shard,
            state: state.engine_state,
            marked_for_removal: state.marked_for_removal,
            cycle_count: state.cycle_count,
            stats: state.stats.clone(),
        }
    }

    /// 引擎主循环，在共享执行器上作为独立任务运行
    #[instrument(skip(self, listener), fields(task_id = %self.config.id, group = %self.config.group))]
    pub async fn run(self: Arc<Self>, listener: Option<Arc<dyn EngineListener>>) {
        if !self.enter_running().await {
            warn!("任务 {} 在启动前已被关闭", self.config.id);
            self.finish(listener).await;
            return;
        }
        info!("任务引擎启动: {}", self.config.id);

        match self.initial_delay(Local::now()) {
            Ok(Some(delay)) => {
                debug!("任务 {} 延迟启动 {}ms", self.config.id, delay.as_millis());
                self.pause(delay).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!("任务 {} 无法计算启动延迟: {}", self.config.id, e);
                self.begin_closing().await;
            }
        }

        while !self.should_stop().await {
            let started = Instant::now();
            let started_at = Utc::now();
            let failures = self.run_cycle().await;
            self.record_cycle(started_at, started.elapsed(), &failures)
                .await;

            if !failures.is_empty() {
                for (phase, err) in &failures {
                    error!(
                        "任务 {} 执行失败: {}",
                        self.config.id,
                        SchedulerError::phase(*phase, err)
                    );
                }
                self.pause(self.phase_error_backoff).await;
            }

            let delay = match self.next_delay(Local::now()) {
                Ok(delay) => delay,
                Err(e) => {
                    error!("任务 {} 无法计算下次执行时间，停止调度: {}", self.config.id, e);
                    self.begin_closing().await;
                    break;
                }
            };

            if self.config.is_bounded() {
                let exhausted = {
                    let mut state = self.state.write().await;
                    state.cycle_count += 1;
                    state.cycle_count >= self.config.run_count
                };
                if exhausted {
                    info!(
                        "任务 {} 已完成 {} 次执行",
                        self.config.id, self.config.run_count
                    );
                    self.begin_closing().await;
                    break;
                }
            }

            self.pause(delay).await;
        }

        self.finish(listener).await;
    }

    async fn enter_running(&self) -> bool {
        let mut state = self.state.write().await;
        if state.closing || state.engine_state != EngineState::Idle {
            return false;
        }
        state.engine_state = EngineState::Running;
        true
    }

    async fn begin_closing(&self) {
        let mut state = self.state.write().await;
        state.closing = true;
        if state.engine_state == EngineState::Running {
            state.engine_state = EngineState::Closing;
        }
    }

    async fn should_stop(&self) -> bool {
        if self.executor.is_shutdown() {
            self.begin_closing().await;
            return true;
        }
        self.is_closing().await
    }

    /// 可中断的等待，关闭请求即使早于等待发出也能立即结束它
    async fn pause(&self, delay: Duration) {
        if delay.is_zero() || self.is_closing().await {
            return;
        }
        let _ = tokio::time::timeout(delay, self.wakeup.notified()).await;
    }

    /// 三个阶段分别执行，任一阶段失败都不会阻止后续阶段
    async fn run_cycle(&self) -> Vec<(TaskPhase, SchedulerError)> {
        let mut failures = Vec::new();

        if self.config.run_before_after_once {
            let (before_done, after_done) = {
                let state = self.state.read().await;
                (state.before_done, state.after_done)
            };

            if !before_done {
                match self.job.before().await {
                    Ok(()) => self.state.write().await.before_done = true,
                    Err(e) => failures.push((TaskPhase::Before, e)),
                }
            }
            if let Err(e) = self.job.execute().await {
                failures.push((TaskPhase::Execute, e));
            }
            if !after_done {
                let result = self.job.after().await;
                self.state.write().await.after_done = true;
                if let Err(e) = result {
                    failures.push((TaskPhase::After, e));
                }
            }
        } else {
            if let Err(e) = self.job.before().await {
                failures.push((TaskPhase::Before, e));
            }
            if let Err(e) = self.job.execute().await {
                failures.push((TaskPhase::Execute, e));
            }
            if let Err(e) = self.job.after().await {
                failures.push((TaskPhase::After, e));
            }
        }

        failures
    }

    async fn record_cycle(
        &self,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        failures: &[(TaskPhase, SchedulerError)],
    ) {
        {
            let mut state = self.state.write().await;
            state.stats.record_cycle(started_at, elapsed);
            for (phase, _) in failures {
                state.stats.record_failure(*phase);
            }
        }

        counter!("scheduler_task_cycles_total", "group" => self.config.group.clone())
            .increment(1);
        histogram!("scheduler_task_cycle_seconds", "group" => self.config.group.clone())
            .record(elapsed.as_secs_f64());
        for (phase, _) in failures {
            counter!("scheduler_task_phase_failures_total", "phase" => phase.as_str())
                .increment(1);
        }
    }

    /// Closed → 通知注册表解除绑定 → destroy，且 destroy 只调用一次
    async fn finish(self: &Arc<Self>, listener: Option<Arc<dyn EngineListener>>) {
        {
            let mut state = self.state.write().await;
            state.closing = true;
            state.engine_state = EngineState::Closed;
        }

        if let Some(listener) = listener {
            listener.engine_closed(self).await;
        }

        if !self.finished.load(Ordering::Acquire) {
            self.job.destroy().await;
            info!("任务引擎已停止: {}", self.config.id);
        }
        self.finished.store(true, Ordering::Release);
        self.closed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct NoopJob;

    #[async_trait]
    impl ScheduledJob for NoopJob {
        async fn execute(&self) -> SchedulerResult<()> {
            Ok(())
        }
    }

    fn engine(config: TaskConfig) -> SchedulerResult<TaskEngine> {
        let executor = SharedExecutor::current()?;
        TaskEngine::new(config, Arc::new(NoopJob), executor)
    }

    #[tokio::test]
    async fn test_fixed_interval_delay() {
        let engine = engine(TaskConfig::new("a-0", "a", "a").with_interval_millis(250)).unwrap();
        assert_eq!(
            engine.next_delay(Local::now()).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(engine.initial_delay(Local::now()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_cron_takes_precedence() {
        let config = TaskConfig::new("a-0", "a", "a")
            .with_interval_millis(5)
            .with_cron("0 0 12 * * ?")
            .with_lazy_start(true);
        let engine = engine(config).unwrap();
        let now = Local
            .with_ymd_and_hms(2024, 1, 15, 11, 0, 0)
            .earliest()
            .unwrap();
        assert_eq!(engine.next_delay(now).unwrap(), Duration::from_secs(3600));
        assert_eq!(
            engine.initial_delay(now).unwrap(),
            Some(Duration::from_secs(3600))
        );
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_at_construction() {
        let err = engine(TaskConfig::new("a-0", "a", "a").with_cron("not a cron")).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let engine = Arc::new(engine(TaskConfig::new("a-0", "a", "a")).unwrap());
        engine.close(true).await;
        engine.clone().run(None).await;

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.state, EngineState::Closed);
        assert!(snapshot.is_removed());
        assert_eq!(snapshot.stats.cycles, 0);
        assert!(engine.is_finished());
    }
}
