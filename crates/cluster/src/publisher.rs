use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scheduler_core::{
    local_hostname, ClusterConfig, KvEntry, KvStore, PutOptions, ScheduledJob, SchedulerError,
    SchedulerResult,
};
use scheduler_dispatcher::SchedulerRegistry;
use scheduler_domain::{
    EngineSnapshot, EngineState, NodeStatus, TaskConfig, TopologyType, WorkerStatus, HOST_ATTRIBUTE,
    LIVE_TIME_ATTRIBUTE, NODE_ID_ATTRIBUTE, STATUS_ATTRIBUTE, UP_TIME_ATTRIBUTE,
};
use scheduler_infrastructure::Encryptor;

use crate::keys::KeySchema;

pub const SYNC_TASK_ID: &str = "cluster-sync";
pub const SYNC_TASK_GROUP: &str = "cluster";
pub const IDENTITY_ATTRIBUTE: &str = "identity";
pub const STATS_ATTRIBUTE: &str = "stats";

/// 本进程的身份信息，加密后写入存储
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub host: String,
    pub version: String,
    pub pid: u32,
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl NodeIdentity {
    pub fn current(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            host: local_hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            instance_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    liveness_created: bool,
    /// 工作单元ID -> stats键最近一次写入的修改索引
    stats_index: HashMap<String, u64>,
}

impl PublisherState {
    fn reset(&mut self) {
        self.liveness_created = false;
        self.stats_index.clear();
    }
}

/// 集群同步发布器
///
/// 作为普通任务由注册表驱动：每个周期续约本节点的存活目录，写入节点元数据，
/// 并在开启分析时上报本地各引擎的状态和统计。
pub struct ClusterSyncPublisher {
    registry: Weak<SchedulerRegistry>,
    store: Arc<dyn KvStore>,
    encryptor: Arc<dyn Encryptor>,
    config: ClusterConfig,
    schema: KeySchema,
    identity: NodeIdentity,
    state: Mutex<PublisherState>,
}

impl ClusterSyncPublisher {
    pub fn new(
        registry: &Arc<SchedulerRegistry>,
        store: Arc<dyn KvStore>,
        encryptor: Arc<dyn Encryptor>,
        config: ClusterConfig,
    ) -> Self {
        let schema = KeySchema::new(&config.root_namespace, &config.cluster_id);
        let identity = NodeIdentity::current(&config.node_id);
        Self {
            registry: Arc::downgrade(registry),
            store,
            encryptor,
            config,
            schema,
            identity,
            state: Mutex::new(PublisherState::default()),
        }
    }

    /// 发布器自身的任务配置
    pub fn task_config(config: &ClusterConfig) -> TaskConfig {
        TaskConfig::new(SYNC_TASK_ID, SYNC_TASK_GROUP, SYNC_TASK_ID)
            .with_interval_millis(config.sync_interval_ms)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// 执行一次完整同步
    pub async fn sync(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.renew_liveness(&mut state).await?;
        self.publish_node().await?;
        if self.config.analysis_enabled {
            self.publish_workers(&mut state).await?;
        }
        Ok(())
    }

    /// 首次创建带TTL的存活目录，之后只刷新TTL
    async fn renew_liveness(&self, state: &mut PublisherState) -> SchedulerResult<()> {
        let key = self.schema.record_path(TopologyType::Node, self.node_id());
        let ttl = self.config.liveness_ttl();
        let mut failures = 0;
        let mut resynced = false;

        loop {
            let opts = if state.liveness_created {
                PutOptions::refresh_dir(ttl)
            } else {
                PutOptions::create_dir(ttl)
            };
            match self.store.put(&key, "", opts).await {
                Ok(_) => {
                    if !state.liveness_created {
                        info!("节点存活目录已创建: {}", key);
                    }
                    state.liveness_created = true;
                    return Ok(());
                }
                Err(e) if e.is_key_not_found() && !resynced => {
                    warn!("节点存活目录已过期，重新全量同步: {}", key);
                    state.reset();
                    resynced = true;
                }
                Err(e) if e.is_key_already_exists() && !state.liveness_created => {
                    debug!("节点存活目录已存在，直接沿用: {}", key);
                    state.liveness_created = true;
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.store_retry_attempts.max(1) {
                        return Err(e);
                    }
                    warn!(
                        "续约存活目录失败 (第{}次)，{}ms后重试: {}",
                        failures, self.config.store_retry_backoff_ms, e
                    );
                    tokio::time::sleep(self.config.store_retry_backoff()).await;
                }
            }
        }
    }

    async fn publish_node(&self) -> SchedulerResult<()> {
        let node_id = self.node_id();
        let identity = self
            .encryptor
            .encrypt(&serde_json::to_string(&self.identity)?)?;
        let attributes = [
            (HOST_ATTRIBUTE, self.identity.host.clone()),
            (STATUS_ATTRIBUTE, NodeStatus::Up.name().to_string()),
            (
                UP_TIME_ATTRIBUTE,
                self.identity.started_at.timestamp_millis().to_string(),
            ),
            (LIVE_TIME_ATTRIBUTE, Utc::now().timestamp_millis().to_string()),
            (IDENTITY_ATTRIBUTE, identity),
        ];
        for (name, value) in attributes {
            let key = self.schema.attribute_path(TopologyType::Node, node_id, name);
            self.put_with_retry(&key, &value).await?;
        }
        Ok(())
    }

    async fn publish_workers(&self, state: &mut PublisherState) -> SchedulerResult<()> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        let active = registry.snapshots().await;
        let active_ids: HashSet<&str> = active.iter().map(|s| s.id.as_str()).collect();

        // 退出快照先于存活引擎处理；失败时未处理的快照放回注册表，下个周期重试
        let mut retired = registry.drain_retired().await.into_iter();
        while let Some(snapshot) = retired.next() {
            if active_ids.contains(snapshot.id.as_str()) {
                debug!("任务 {} 已由同ID的新实例接替，忽略其退出快照", snapshot.id);
                continue;
            }
            if let Err(e) = self.publish_snapshot(state, &snapshot).await {
                let mut unprocessed = vec![snapshot];
                unprocessed.extend(retired);
                registry.requeue_retired(unprocessed).await;
                return Err(e);
            }
        }

        for snapshot in &active {
            self.publish_snapshot(state, snapshot).await?;
        }
        Ok(())
    }

    async fn publish_snapshot(
        &self,
        state: &mut PublisherState,
        snapshot: &EngineSnapshot,
    ) -> SchedulerResult<()> {
        let worker_id = KeySchema::worker_id(self.node_id(), &snapshot.id);
        if snapshot.is_removed() {
            self.remove_worker(state, &worker_id).await
        } else {
            self.publish_worker(state, &worker_id, snapshot).await
        }
    }

    async fn publish_worker(
        &self,
        state: &mut PublisherState,
        worker_id: &str,
        snapshot: &EngineSnapshot,
    ) -> SchedulerResult<()> {
        let status = match snapshot.state {
            EngineState::Closing | EngineState::Closed => WorkerStatus::Stop,
            EngineState::Idle | EngineState::Running => WorkerStatus::Start,
        };
        let node_key = self
            .schema
            .attribute_path(TopologyType::Worker, worker_id, NODE_ID_ATTRIBUTE);
        self.put_with_retry(&node_key, self.node_id()).await?;
        let status_key = self
            .schema
            .attribute_path(TopologyType::Worker, worker_id, STATUS_ATTRIBUTE);
        self.put_with_retry(&status_key, status.name()).await?;

        let stats = self.encryptor.encrypt(&serde_json::to_string(snapshot)?)?;
        let stats_key = self
            .schema
            .attribute_path(TopologyType::Worker, worker_id, STATS_ATTRIBUTE);
        let entry = self
            .write_stats(state.stats_index.get(worker_id).copied(), &stats_key, &stats)
            .await?;
        state
            .stats_index
            .insert(worker_id.to_string(), entry.modified_index);
        Ok(())
    }

    /// 首次上报时创建，之后按缓存的索引原地更新；索引失效时以存储中的当前值为准重试一次
    async fn write_stats(
        &self,
        cached_index: Option<u64>,
        key: &str,
        value: &str,
    ) -> SchedulerResult<KvEntry> {
        let result = match cached_index {
            Some(index) => self.store.put(key, value, PutOptions::update_at(index)).await,
            None => self.store.put(key, value, PutOptions::create()).await,
        };
        match result {
            Ok(entry) => Ok(entry),
            Err(e)
                if e.is_key_already_exists()
                    || matches!(e, SchedulerError::IndexMismatch { .. }) =>
            {
                debug!("统计键索引已变化，按当前索引更新: {}", key);
                let current = self.store.get(key).await?;
                self.store
                    .put(key, value, PutOptions::update_at(current.modified_index))
                    .await
            }
            Err(e) if e.is_key_not_found() => {
                debug!("统计键已不存在，重新创建: {}", key);
                self.store.put(key, value, PutOptions::create()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_worker(&self, state: &mut PublisherState, worker_id: &str) -> SchedulerResult<()> {
        state.stats_index.remove(worker_id);
        let key = self.schema.record_path(TopologyType::Worker, worker_id);
        let store = &self.store;
        let key_ref = key.as_str();
        match self.retry(&key, move || store.delete(key_ref, true)).await {
            Ok(()) => {
                info!("工作单元已移除: {}", worker_id);
                Ok(())
            }
            Err(e) if e.is_key_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn put_with_retry(&self, key: &str, value: &str) -> SchedulerResult<KvEntry> {
        let store = &self.store;
        self.retry(key, move || store.put(key, value, PutOptions::default()))
            .await
    }

    /// 存储超时或其他存储故障时固定退避后重试当前步骤
    async fn retry<T, F, Fut>(&self, key: &str, mut op: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ (SchedulerError::StoreTimeout(_) | SchedulerError::Store(_))) => {
                    failures += 1;
                    if failures >= self.config.store_retry_attempts.max(1) {
                        return Err(e);
                    }
                    warn!(
                        "访问 {} 失败 (第{}次)，{}ms后重试: {}",
                        key, failures, self.config.store_retry_backoff_ms, e
                    );
                    tokio::time::sleep(self.config.store_retry_backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ScheduledJob for ClusterSyncPublisher {
    async fn execute(&self) -> SchedulerResult<()> {
        self.sync().await
    }

    /// 退出时把节点标记为下线，失败只记录日志
    async fn destroy(&self) {
        let key = self
            .schema
            .attribute_path(TopologyType::Node, self.node_id(), STATUS_ATTRIBUTE);
        match self
            .store
            .put(&key, NodeStatus::Down.name(), PutOptions::default())
            .await
        {
            Ok(_) => info!("节点已标记为下线: {}", self.node_id()),
            Err(e) => warn!("标记节点下线失败: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_config_follows_sync_interval() {
        let config = ClusterConfig {
            sync_interval_ms: 750,
            ..ClusterConfig::default()
        };
        let task = ClusterSyncPublisher::task_config(&config);
        assert_eq!(task.id, SYNC_TASK_ID);
        assert_eq!(task.group, SYNC_TASK_GROUP);
        assert_eq!(task.interval_millis, 750);
        assert!(task.daemon);
        assert!(!task.is_bounded());
    }

    #[test]
    fn test_identity_serializes() {
        let identity = NodeIdentity::current("n1");
        let json = serde_json::to_string(&identity).unwrap();
        let decoded: NodeIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, identity);
        assert_eq!(decoded.pid, std::process::id());
    }
}
