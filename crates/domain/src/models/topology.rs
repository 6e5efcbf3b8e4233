use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const STATUS_ATTRIBUTE: &str = "status";
pub const WORKER_IDS_ATTRIBUTE: &str = "workerIds";
pub const HOST_ATTRIBUTE: &str = "host";
pub const UP_TIME_ATTRIBUTE: &str = "upTime";
pub const LIVE_TIME_ATTRIBUTE: &str = "liveTime";
pub const RUN_TIME_ATTRIBUTE: &str = "runTime";
pub const NODE_ID_ATTRIBUTE: &str = "nodeId";

/// 节点状态，编码: Down=0, Up=1, 其他=Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Unknown,
    Up,
    Down,
}

impl NodeStatus {
    pub fn code(&self) -> i64 {
        match self {
            NodeStatus::Down => 0,
            NodeStatus::Up => 1,
            NodeStatus::Unknown => -1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "Unknown",
            NodeStatus::Up => "Up",
            NodeStatus::Down => "Down",
        }
    }

    /// 解码数字编码或名称，无法识别时返回 Unknown
    pub fn decode(raw: &str) -> Self {
        let token = status_token(raw);
        if let Ok(code) = token.parse::<i64>() {
            return match code {
                0 => NodeStatus::Down,
                1 => NodeStatus::Up,
                _ => NodeStatus::Unknown,
            };
        }
        match token.to_ascii_lowercase().as_str() {
            "up" => NodeStatus::Up,
            "down" => NodeStatus::Down,
            _ => NodeStatus::Unknown,
        }
    }
}

/// 工作单元状态，编码: Stop=0, Start=1, 其他=Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    Stop,
    Start,
    Unknown,
}

impl WorkerStatus {
    pub fn code(&self) -> i64 {
        match self {
            WorkerStatus::Stop => 0,
            WorkerStatus::Start => 1,
            WorkerStatus::Unknown => -1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerStatus::Stop => "Stop",
            WorkerStatus::Start => "Start",
            WorkerStatus::Unknown => "Unknown",
        }
    }

    pub fn decode(raw: &str) -> Self {
        let token = status_token(raw);
        if let Ok(code) = token.parse::<i64>() {
            return match code {
                0 => WorkerStatus::Stop,
                1 => WorkerStatus::Start,
                _ => WorkerStatus::Unknown,
            };
        }
        match token.to_ascii_lowercase().as_str() {
            "stop" => WorkerStatus::Stop,
            "start" => WorkerStatus::Start,
            _ => WorkerStatus::Unknown,
        }
    }
}

fn status_token(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}

/// 解码ID列表：JSON字符串数组，或逗号分隔
pub fn decode_id_list(raw: &str) -> Vec<String> {
    if let Ok(ids) = serde_json::from_str::<Vec<String>>(raw) {
        return ids;
    }
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|id| id.trim().trim_matches('"').trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_time(raw: &str) -> Option<i64> {
    raw.trim().trim_matches('"').parse().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub host: Option<String>,
    /// None 表示从未上报
    pub status: Option<NodeStatus>,
    pub up_time: Option<i64>,
    pub live_time: Option<i64>,
    pub worker_ids: BTreeSet<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Node {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            host: None,
            status: None,
            up_time: None,
            live_time: None,
            worker_ids: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn set_attribute(&mut self, name: &str, raw: &str) {
        match name {
            STATUS_ATTRIBUTE => self.status = Some(NodeStatus::decode(raw)),
            // 只裁剪失效引用，不会添加
            WORKER_IDS_ATTRIBUTE => {
                for worker_id in decode_id_list(raw) {
                    self.worker_ids.remove(&worker_id);
                }
            }
            _ => {
                match name {
                    HOST_ATTRIBUTE => self.host = Some(raw.to_string()),
                    UP_TIME_ATTRIBUTE => self.up_time = parse_time(raw),
                    LIVE_TIME_ATTRIBUTE => self.live_time = parse_time(raw),
                    _ => {}
                }
                self.attributes.insert(name.to_string(), raw.to_string());
            }
        }
    }

    pub fn clear_attribute(&mut self, name: &str) {
        match name {
            STATUS_ATTRIBUTE => self.status = None,
            WORKER_IDS_ATTRIBUTE => {}
            _ => {
                match name {
                    HOST_ATTRIBUTE => self.host = None,
                    UP_TIME_ATTRIBUTE => self.up_time = None,
                    LIVE_TIME_ATTRIBUTE => self.live_time = None,
                    _ => {}
                }
                self.attributes.remove(name);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub up_time: Option<i64>,
    pub run_time: Option<i64>,
    /// None 表示从未上报
    pub status: Option<WorkerStatus>,
    /// 所属节点，仅为引用
    pub node_id: Option<String>,
    pub cfg: BTreeMap<String, String>,
}

impl Worker {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            up_time: None,
            run_time: None,
            status: None,
            node_id: None,
            cfg: BTreeMap::new(),
        }
    }

    pub fn set_attribute(&mut self, name: &str, raw: &str) {
        if name == STATUS_ATTRIBUTE {
            self.status = Some(WorkerStatus::decode(raw));
            return;
        }
        match name {
            UP_TIME_ATTRIBUTE => self.up_time = parse_time(raw),
            RUN_TIME_ATTRIBUTE => self.run_time = parse_time(raw),
            NODE_ID_ATTRIBUTE => {
                let node_id = raw.trim().trim_matches('"');
                self.node_id = (!node_id.is_empty()).then(|| node_id.to_string());
            }
            _ => {}
        }
        self.cfg.insert(name.to_string(), raw.to_string());
    }

    pub fn clear_attribute(&mut self, name: &str) {
        if name == STATUS_ATTRIBUTE {
            self.status = None;
            return;
        }
        match name {
            UP_TIME_ATTRIBUTE => self.up_time = None,
            RUN_TIME_ATTRIBUTE => self.run_time = None,
            NODE_ID_ATTRIBUTE => self.node_id = None,
            _ => {}
        }
        self.cfg.remove(name);
    }
}

/// 集群拓扑记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyType {
    Node,
    Worker,
}

impl TopologyType {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "Node" => Some(TopologyType::Node),
            "Worker" => Some(TopologyType::Worker),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyType::Node => "Node",
            TopologyType::Worker => "Worker",
        }
    }
}

/// 从存储快照重建的集群视图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub cluster_id: Option<String>,
    pub leader: bool,
    pub nodes: BTreeMap<String, Node>,
    pub workers: BTreeMap<String, Worker>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn worker(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn ensure_node(&mut self, id: &str) -> &mut Node {
        self.nodes
            .entry(id.to_string())
            .or_insert_with(|| Node::new(id))
    }

    pub fn ensure_worker(&mut self, id: &str) -> &mut Worker {
        self.workers
            .entry(id.to_string())
            .or_insert_with(|| Worker::new(id))
    }

    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn remove_worker(&mut self, id: &str) -> Option<Worker> {
        let removed = self.workers.remove(id);
        if let Some(node_id) = removed.as_ref().and_then(|worker| worker.node_id.as_deref()) {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.worker_ids.remove(id);
            }
        }
        removed
    }

    pub fn clear_type(&mut self, kind: TopologyType) {
        match kind {
            TopologyType::Node => self.nodes.clear(),
            TopologyType::Worker => {
                self.workers.clear();
                for node in self.nodes.values_mut() {
                    node.worker_ids.clear();
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.cluster_id = None;
        self.nodes.clear();
        self.workers.clear();
    }

    /// 工作单元的 nodeId 指向已存在的节点时，把它记入该节点
    pub fn link_worker(&mut self, worker_id: &str) {
        let Some(node_id) = self
            .workers
            .get(worker_id)
            .and_then(|worker| worker.node_id.clone())
        else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.worker_ids.insert(worker_id.to_string());
        }
    }

    pub fn unlink_worker(&mut self, worker_id: &str) {
        let Some(node_id) = self
            .workers
            .get(worker_id)
            .and_then(|worker| worker.node_id.clone())
        else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.worker_ids.remove(worker_id);
        }
    }

    /// 节点出现后补齐此前悬空的工作单元引用
    pub fn link_node_workers(&mut self, node_id: &str) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        for worker in self.workers.values() {
            if worker.node_id.as_deref() == Some(node_id) {
                node.worker_ids.insert(worker.id.clone());
            }
        }
    }

    /// 节点引用悬空的工作单元（乱序投递时会暂时出现）
    pub fn dangling_workers(&self) -> Vec<&Worker> {
        self.workers
            .values()
            .filter(|worker| {
                worker
                    .node_id
                    .as_deref()
                    .is_some_and(|node_id| !self.nodes.contains_key(node_id))
            })
            .collect()
    }
}

/// 相邻两次快照之间的差异
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: BTreeMap<String, String>,
    pub modified: BTreeMap<String, String>,
    /// 被删除键的旧值
    pub removed: BTreeMap<String, String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    pub fn clear(&mut self) {
        self.added.clear();
        self.modified.clear();
        self.removed.clear();
    }
}
