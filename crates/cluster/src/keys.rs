use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::TopologyType;

/// 集群键路径约定：`{root}/{clusterId}/{TypeName}/{typeId}[/{attributeName}]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    root: String,
    cluster_id: String,
}

/// 去掉根命名空间之后解析出的路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyPath {
    /// 深度1
    Cluster { cluster_id: String },
    /// 深度2
    Type { kind: TopologyType },
    /// 深度3
    Record { kind: TopologyType, id: String },
    /// 深度4
    Attribute {
        kind: TopologyType,
        id: String,
        name: String,
    },
}

impl KeySchema {
    pub fn new(root_namespace: &str, cluster_id: &str) -> Self {
        let root = root_namespace.trim_end_matches('/');
        let root = if root.starts_with('/') {
            root.to_string()
        } else {
            format!("/{root}")
        };
        Self {
            root,
            cluster_id: cluster_id.to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn cluster_path(&self) -> String {
        format!("{}/{}", self.root, self.cluster_id)
    }

    pub fn type_path(&self, kind: TopologyType) -> String {
        format!("{}/{}", self.cluster_path(), kind.as_str())
    }

    pub fn record_path(&self, kind: TopologyType, id: &str) -> String {
        format!("{}/{}", self.type_path(kind), id)
    }

    pub fn attribute_path(&self, kind: TopologyType, id: &str, name: &str) -> String {
        format!("{}/{}", self.record_path(kind, id), name)
    }

    /// 本进程某个引擎对应的工作单元ID
    pub fn worker_id(node_id: &str, engine_id: &str) -> String {
        format!("{node_id}.{engine_id}")
    }

    /// 去掉根命名空间后切分路径段，末尾的空段（目录风格的键）不计入深度
    pub fn segments<'a>(&self, key: &'a str) -> Option<Vec<&'a str>> {
        let rest = key.strip_prefix(self.root.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        let mut segments: Vec<&str> = rest.split('/').skip(1).collect();
        if segments.last() == Some(&"") {
            segments.pop();
        }
        Some(segments)
    }

    /// 解析键路径，无法识别的深度或类型名返回 `UnknownTopologyPath`
    pub fn parse(&self, key: &str) -> SchedulerResult<TopologyPath> {
        let unknown = |depth: usize| SchedulerError::UnknownTopologyPath {
            key: key.to_string(),
            depth,
        };
        let segments = self.segments(key).ok_or_else(|| unknown(0))?;
        let depth = segments.len();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(unknown(depth));
        }

        let kind = || {
            segments
                .get(1)
                .and_then(|segment| TopologyType::parse(segment))
                .ok_or_else(|| unknown(depth))
        };

        match depth {
            1 => Ok(TopologyPath::Cluster {
                cluster_id: segments[0].to_string(),
            }),
            2 => Ok(TopologyPath::Type { kind: kind()? }),
            3 => Ok(TopologyPath::Record {
                kind: kind()?,
                id: segments[2].to_string(),
            }),
            4 => Ok(TopologyPath::Attribute {
                kind: kind()?,
                id: segments[2].to_string(),
                name: segments[3].to_string(),
            }),
            _ => Err(unknown(depth)),
        }
    }
}
