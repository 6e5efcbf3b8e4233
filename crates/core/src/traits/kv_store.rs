use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::SchedulerResult;

/// 某个前缀下全部键值的完整快照
pub type Snapshot = BTreeMap<String, String>;

/// 写入选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// 过期时间，到期后键及其子树被删除
    pub ttl: Option<Duration>,
    /// Some(false): 仅在不存在时创建；Some(true): 仅在已存在时更新
    pub prev_exist: Option<bool>,
    /// 比较并交换：仅当当前修改索引等于该值时写入
    pub prev_index: Option<u64>,
    /// 目录键，值为空
    pub dir: bool,
}

impl PutOptions {
    pub fn create() -> Self {
        Self {
            prev_exist: Some(false),
            ..Self::default()
        }
    }

    pub fn update_at(index: u64) -> Self {
        Self {
            prev_exist: Some(true),
            prev_index: Some(index),
            ..Self::default()
        }
    }

    pub fn create_dir(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            prev_exist: Some(false),
            dir: true,
            ..Self::default()
        }
    }

    pub fn refresh_dir(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            prev_exist: Some(true),
            dir: true,
            ..Self::default()
        }
    }
}

/// 存储中的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub created_index: u64,
    pub modified_index: u64,
}

/// 分布式键值存储抽象接口
///
/// 错误约定：不存在返回 `KeyNotFound`，创建冲突返回 `KeyAlreadyExists`，
/// 比较并交换失败返回 `IndexMismatch`。
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> SchedulerResult<KvEntry>;

    async fn get(&self, key: &str) -> SchedulerResult<KvEntry>;

    /// 列出前缀下的所有记录（包括前缀本身）
    async fn list(&self, prefix: &str) -> SchedulerResult<Vec<KvEntry>>;

    /// 删除键，`recursive` 时连同子树一起删除
    async fn delete(&self, key: &str, recursive: bool) -> SchedulerResult<()>;

    /// 订阅前缀变化，每次变化推送一次完整快照，订阅时立即推送当前快照
    async fn watch(&self, prefix: &str) -> SchedulerResult<mpsc::UnboundedReceiver<Snapshot>>;
}
