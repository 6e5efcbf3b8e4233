//! 测试替身
//!
//! `RecordingJob` 记录每个阶段的调用次数并支持注入失败；
//! `MockKvStore` 由 mockall 生成，用于存储失败路径的测试。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use tokio::sync::mpsc;

use scheduler_core::{
    JobFactory, KvEntry, PutOptions, ScheduledJob, SchedulerError, SchedulerResult, Snapshot,
};

/// 记录各阶段调用次数的任务
#[derive(Debug, Default)]
pub struct RecordingJob {
    before_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    after_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    fail_before: AtomicBool,
    fail_execute: AtomicBool,
    fail_after: AtomicBool,
    execute_delay: Option<Duration>,
}

impl RecordingJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// execute 阶段额外耗时，模拟慢任务
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    pub fn failing_before(self) -> Self {
        self.set_fail_before(true);
        self
    }

    pub fn failing_execute(self) -> Self {
        self.set_fail_execute(true);
        self
    }

    pub fn failing_after(self) -> Self {
        self.set_fail_after(true);
        self
    }

    pub fn set_fail_before(&self, fail: bool) {
        self.fail_before.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_execute(&self, fail: bool) {
        self.fail_execute.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_after(&self, fail: bool) {
        self.fail_after.store(fail, Ordering::SeqCst);
    }

    pub fn before_count(&self) -> usize {
        self.before_calls.load(Ordering::SeqCst)
    }

    pub fn execute_count(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn after_count(&self) -> usize {
        self.after_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn outcome(flag: &AtomicBool, phase: &str) -> SchedulerResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(SchedulerError::task_execution(format!("注入的 {phase} 失败")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ScheduledJob for RecordingJob {
    async fn before(&self) -> SchedulerResult<()> {
        self.before_calls.fetch_add(1, Ordering::SeqCst);
        Self::outcome(&self.fail_before, "before")
    }

    async fn execute(&self) -> SchedulerResult<()> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }
        Self::outcome(&self.fail_execute, "execute")
    }

    async fn after(&self) -> SchedulerResult<()> {
        self.after_calls.fetch_add(1, Ordering::SeqCst);
        Self::outcome(&self.fail_after, "after")
    }

    async fn destroy(&self) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// 为每个分片创建 `RecordingJob` 并保留引用，便于测试断言
#[derive(Clone, Default)]
pub struct RecordingFactory {
    jobs: Arc<Mutex<Vec<(usize, Arc<RecordingJob>)>>>,
    execute_delay: Option<Duration>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    pub fn job_factory(&self) -> JobFactory {
        let jobs = self.jobs.clone();
        let delay = self.execute_delay;
        Arc::new(move |shard| {
            let mut job = RecordingJob::new();
            if let Some(delay) = delay {
                job = job.with_execute_delay(delay);
            }
            let job = Arc::new(job);
            jobs.lock().unwrap().push((shard, job.clone()));
            job as Arc<dyn ScheduledJob>
        })
    }

    /// 按创建顺序返回全部实例
    pub fn jobs(&self) -> Vec<Arc<RecordingJob>> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, job)| job.clone())
            .collect()
    }

    pub fn created(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn total_executions(&self) -> usize {
        self.jobs().iter().map(|job| job.execute_count()).sum()
    }
}

mock! {
    pub KvStore {}

    #[async_trait]
    impl scheduler_core::KvStore for KvStore {
        async fn put(&self, key: &str, value: &str, opts: PutOptions) -> SchedulerResult<KvEntry>;
        async fn get(&self, key: &str) -> SchedulerResult<KvEntry>;
        async fn list(&self, prefix: &str) -> SchedulerResult<Vec<KvEntry>>;
        async fn delete(&self, key: &str, recursive: bool) -> SchedulerResult<()>;
        async fn watch(&self, prefix: &str) -> SchedulerResult<mpsc::UnboundedReceiver<Snapshot>>;
    }
}

/// 构造一条存储记录
pub fn kv_entry(key: &str, value: &str, index: u64) -> KvEntry {
    KvEntry {
        key: key.to_string(),
        value: value.to_string(),
        created_index: index,
        modified_index: index,
    }
}
