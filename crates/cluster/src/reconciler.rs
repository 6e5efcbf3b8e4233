use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use scheduler_core::{KvStore, SchedulerResult, Snapshot};
use scheduler_domain::{ClusterTopology, SnapshotDiff, TopologyType, NODE_ID_ATTRIBUTE};

use crate::keys::{KeySchema, TopologyPath};

/// 计算两次快照之间的差异，没有上一次快照时全部视为新增
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> SnapshotDiff {
    let mut result = SnapshotDiff::default();
    let Some(previous) = previous else {
        result.added = current.clone();
        return result;
    };

    for (key, value) in current {
        match previous.get(key) {
            None => {
                result.added.insert(key.clone(), value.clone());
            }
            Some(old) if old != value => {
                result.modified.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        if !current.contains_key(key) {
            result.removed.insert(key.clone(), value.clone());
        }
    }
    result
}

#[derive(Debug, Default)]
struct ReconcilerState {
    last_observed: Option<Snapshot>,
    topology: ClusterTopology,
}

/// 集群拓扑协调器
///
/// 按存储推送的完整快照重建节点和工作单元视图。差异计算和应用在同一把锁内完成，
/// 同一前缀的并发批次因此被串行化。
pub struct TopologyReconciler {
    schema: KeySchema,
    state: Mutex<ReconcilerState>,
}

impl TopologyReconciler {
    pub fn new(schema: KeySchema) -> Self {
        Self {
            schema,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    /// 拓扑的只读副本
    pub async fn topology(&self) -> ClusterTopology {
        self.state.lock().await.topology.clone()
    }

    /// leader 标志由外部提供
    pub async fn set_leader(&self, leader: bool) {
        self.state.lock().await.topology.leader = leader;
    }

    /// 应用一次快照，返回本次计算出的差异
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> SnapshotDiff {
        let mut state = self.state.lock().await;
        let changes = diff(state.last_observed.as_ref(), &snapshot);
        state.last_observed = Some(snapshot);

        for (key, value) in changes.added.iter().chain(changes.modified.iter()) {
            self.apply_upsert(&mut state.topology, key, value);
        }
        for key in changes.removed.keys() {
            self.apply_removal(&mut state.topology, key);
        }

        if !changes.is_empty() {
            debug!(
                "拓扑快照已应用: 新增 {} 修改 {} 删除 {}",
                changes.added.len(),
                changes.modified.len(),
                changes.removed.len()
            );
        }
        changes
    }

    fn apply_upsert(&self, topology: &mut ClusterTopology, key: &str, value: &str) {
        let path = match self.schema.parse(key) {
            Ok(path) => path,
            Err(e) => {
                debug!("忽略无法识别的键: {}", e);
                return;
            }
        };

        match path {
            TopologyPath::Cluster { cluster_id } => topology.cluster_id = Some(cluster_id),
            TopologyPath::Type { kind } => debug!("类型目录出现: {}", kind.as_str()),
            TopologyPath::Record { kind, id } => match kind {
                TopologyType::Node => {
                    topology.ensure_node(&id);
                    topology.link_node_workers(&id);
                }
                TopologyType::Worker => {
                    topology.ensure_worker(&id);
                    topology.link_worker(&id);
                }
            },
            // 属性可能先于记录本身到达，每次都重新确保记录存在
            TopologyPath::Attribute { kind, id, name } => match kind {
                TopologyType::Node => {
                    let created = !topology.nodes.contains_key(&id);
                    topology.ensure_node(&id).set_attribute(&name, value);
                    if created {
                        topology.link_node_workers(&id);
                    }
                }
                TopologyType::Worker => {
                    if name == NODE_ID_ATTRIBUTE {
                        topology.unlink_worker(&id);
                    }
                    topology.ensure_worker(&id).set_attribute(&name, value);
                    topology.link_worker(&id);
                }
            },
        }
    }

    fn apply_removal(&self, topology: &mut ClusterTopology, key: &str) {
        let path = match self.schema.parse(key) {
            Ok(path) => path,
            Err(e) => {
                debug!("忽略无法识别的键: {}", e);
                return;
            }
        };

        match path {
            TopologyPath::Cluster { .. } => topology.clear(),
            TopologyPath::Type { kind } => topology.clear_type(kind),
            TopologyPath::Record { kind, id } => match kind {
                TopologyType::Node => {
                    topology.remove_node(&id);
                }
                TopologyType::Worker => {
                    topology.remove_worker(&id);
                }
            },
            TopologyPath::Attribute { kind, id, name } => match kind {
                TopologyType::Node => {
                    if let Some(node) = topology.nodes.get_mut(&id) {
                        node.clear_attribute(&name);
                    }
                }
                TopologyType::Worker => {
                    if name == NODE_ID_ATTRIBUTE {
                        topology.unlink_worker(&id);
                    }
                    if let Some(worker) = topology.workers.get_mut(&id) {
                        worker.clear_attribute(&name);
                    }
                }
            },
        }
    }

    /// 订阅集群前缀并持续应用快照，直到收到关闭信号或订阅结束
    #[instrument(skip_all, fields(prefix = %self.schema.cluster_path()))]
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn KvStore>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> SchedulerResult<()> {
        let mut updates = store.watch(&self.schema.cluster_path()).await?;
        info!("拓扑协调器已启动");

        loop {
            tokio::select! {
                snapshot = updates.recv() => {
                    match snapshot {
                        Some(snapshot) => {
                            self.apply_snapshot(snapshot).await;
                        }
                        None => {
                            warn!("拓扑订阅已结束");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("拓扑协调器收到关闭信号");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, &str)]) -> Snapshot {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_without_previous_marks_everything_added() {
        let current = snapshot(&[("/c/a", "1"), ("/c/b", "2")]);
        let changes = diff(None, &current);
        assert_eq!(changes.added, current);
        assert!(changes.modified.is_empty());
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_diff_classifies_changes() {
        let previous = snapshot(&[("/c/a", "1"), ("/c/b", "2"), ("/c/c", "3")]);
        let current = snapshot(&[("/c/a", "1"), ("/c/b", "20"), ("/c/d", "4")]);
        let changes = diff(Some(&previous), &current);

        assert_eq!(changes.added, snapshot(&[("/c/d", "4")]));
        assert_eq!(changes.modified, snapshot(&[("/c/b", "20")]));
        assert_eq!(changes.removed, snapshot(&[("/c/c", "3")]));
        assert_eq!(changes.len(), 3);
    }
}
