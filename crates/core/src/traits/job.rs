use std::sync::Arc;

use async_trait::async_trait;

use crate::SchedulerResult;

/// 可调度的工作单元
///
/// 执行引擎按 before → execute → after 的顺序驱动各阶段，
/// 引擎退出时调用且只调用一次 `destroy`。实现需要自行处理内部可变状态。
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn before(&self) -> SchedulerResult<()> {
        Ok(())
    }

    async fn execute(&self) -> SchedulerResult<()>;

    async fn after(&self) -> SchedulerResult<()> {
        Ok(())
    }

    async fn destroy(&self) {}
}

/// 为每个分片创建独立任务实例的工厂，参数为分片序号
pub type JobFactory = Arc<dyn Fn(usize) -> Arc<dyn ScheduledJob> + Send + Sync>;
