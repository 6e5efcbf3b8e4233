//! 集群拓扑同步
//!
//! - **keys**: 存储键路径约定与解析
//! - **reconciler**: 由订阅快照重建集群拓扑
//! - **publisher**: 周期性上报本节点存活、元数据和任务统计

pub mod keys;
pub mod publisher;
pub mod reconciler;

pub use keys::{KeySchema, TopologyPath};
pub use publisher::{ClusterSyncPublisher, NodeIdentity, IDENTITY_ATTRIBUTE, STATS_ATTRIBUTE, SYNC_TASK_GROUP, SYNC_TASK_ID};
pub use reconciler::{diff, TopologyReconciler};
