use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

use scheduler_core::{SchedulerError, SchedulerResult};

/// 所有执行引擎共享的执行器
///
/// 引擎以 tokio 任务的形式运行在同一个运行时上，关闭后不再接受新的引擎，
/// 运行中的引擎在下一次循环检查时退出。
#[derive(Debug)]
pub struct SharedExecutor {
    handle: Handle,
    shutdown: AtomicBool,
}

impl SharedExecutor {
    /// 绑定到当前所在的 tokio 运行时
    pub fn current() -> SchedulerResult<Arc<Self>> {
        let handle = Handle::try_current()
            .map_err(|e| SchedulerError::Internal(format!("当前线程没有可用的运行时: {e}")))?;
        Ok(Self::from_handle(handle))
    }

    pub fn from_handle(handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn spawn<F>(&self, future: F) -> SchedulerResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(SchedulerError::ExecutorShutdown);
        }
        Ok(self.handle.spawn(future))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("共享执行器已关闭");
        }
    }
}
