use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/scheduler.toml",
    "scheduler.toml",
    "/etc/scheduler/config.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub cluster: ClusterConfig,
    pub logging: LoggingConfig,
    /// 内联属性集，优先级低于 `scheduler.property_files`
    pub properties: HashMap<String, String>,
}

/// 调度注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// reload 时等待全部任务退出的最长时间（秒）
    pub drain_timeout_seconds: u64,
    /// reload 等待期间的轮询间隔（毫秒）
    pub drain_poll_interval_ms: u64,
    /// 任务阶段出错后的退避时间（毫秒）
    pub phase_error_backoff_ms: u64,
    /// 额外属性文件（toml/json/ini），按顺序加载
    pub property_files: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: 30,
            drain_poll_interval_ms: 100,
            phase_error_backoff_ms: 100,
            property_files: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn phase_error_backoff(&self) -> Duration {
        Duration::from_millis(self.phase_error_backoff_ms)
    }
}

/// 集群同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub root_namespace: String,
    pub cluster_id: String,
    pub node_id: String,
    pub sync_interval_ms: u64,
    pub liveness_ttl_seconds: u64,
    /// 是否上报本节点各任务的运行统计
    pub analysis_enabled: bool,
    pub store_retry_backoff_ms: u64,
    pub store_retry_attempts: u32,
    /// 存储加密使用的本地密钥
    pub secret: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_namespace: "/cluster".to_string(),
            cluster_id: "default".to_string(),
            node_id: local_hostname(),
            sync_interval_ms: 5000,
            liveness_ttl_seconds: 15,
            analysis_enabled: true,
            store_retry_backoff_ms: 2000,
            store_retry_attempts: 3,
            secret: "scheduler-local-secret".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn liveness_ttl(&self) -> Duration {
        Duration::from_secs(self.liveness_ttl_seconds)
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    fn validate(&self) -> SchedulerResult<()> {
        if !self.root_namespace.starts_with('/') || self.root_namespace.len() < 2 {
            return Err(SchedulerError::config_error(format!(
                "cluster.root_namespace 必须以 / 开头且非空: {}",
                self.root_namespace
            )));
        }
        if self.cluster_id.is_empty() || self.cluster_id.contains('/') {
            return Err(SchedulerError::config_error(
                "cluster.cluster_id 不能为空且不能包含 /",
            ));
        }
        if self.node_id.is_empty() || self.node_id.contains('/') {
            return Err(SchedulerError::config_error(
                "cluster.node_id 不能为空且不能包含 /",
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(SchedulerError::config_error("cluster.sync_interval_ms 必须大于0"));
        }
        if self.liveness_ttl_seconds * 1000 <= self.sync_interval_ms {
            return Err(SchedulerError::config_error(format!(
                "cluster.liveness_ttl_seconds ({}s) 必须大于同步间隔 ({}ms)",
                self.liveness_ttl_seconds, self.sync_interval_ms
            )));
        }
        if self.enabled && self.secret.is_empty() {
            return Err(SchedulerError::config_error("启用集群同步时 cluster.secret 不能为空"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> SchedulerResult<()> {
        if !["trace", "debug", "info", "warn", "error"].contains(&self.level.as_str()) {
            return Err(SchedulerError::config_error(format!(
                "不支持的日志级别: {}",
                self.level
            )));
        }
        if !["json", "pretty"].contains(&self.format.as_str()) {
            return Err(SchedulerError::config_error(format!(
                "不支持的日志格式: {}",
                self.format
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// 加载配置：指定文件（必须存在）或默认路径，然后叠加 `SCHEDULER_` 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> SchedulerResult<Self> {
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(SchedulerError::config_error(format!("配置文件不存在: {path}")));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> SchedulerResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| SchedulerError::config_error(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> SchedulerResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SchedulerError::Serialization(format!("序列化配置为TOML失败: {e}")))
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.scheduler.drain_timeout_seconds == 0 {
            return Err(SchedulerError::config_error(
                "scheduler.drain_timeout_seconds 必须大于0",
            ));
        }
        if self.scheduler.drain_poll_interval_ms == 0 {
            return Err(SchedulerError::config_error(
                "scheduler.drain_poll_interval_ms 必须大于0",
            ));
        }
        self.cluster.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// 本机主机名，获取失败时为 localhost
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.drain_timeout_seconds, 30);
        assert_eq!(config.scheduler.phase_error_backoff(), Duration::from_millis(100));
        assert_eq!(config.cluster.root_namespace, "/cluster");
        assert_eq!(config.cluster.store_retry_backoff(), Duration::from_secs(2));
        assert!(!config.cluster.node_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_toml() {
        let toml_str = r#"
[scheduler]
drain_timeout_seconds = 5
property_files = ["tasks.toml"]

[cluster]
cluster_id = "prod"
node_id = "node-a"
sync_interval_ms = 1000
liveness_ttl_seconds = 3

[logging]
level = "debug"
format = "json"

[properties]
"report.parallel" = "4"
"#;
        let config = AppConfig::from_toml(toml_str).expect("valid config");
        assert_eq!(config.scheduler.drain_timeout_seconds, 5);
        assert_eq!(config.scheduler.drain_poll_interval_ms, 100);
        assert_eq!(config.scheduler.property_files, vec!["tasks.toml".to_string()]);
        assert_eq!(config.cluster.cluster_id, "prod");
        assert_eq!(config.cluster.node_id, "node-a");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.properties.get("report.parallel").map(String::as_str), Some("4"));
    }

    #[test]
    fn test_app_config_validation() {
        let mut config = AppConfig::default();
        config.cluster.root_namespace = "cluster".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cluster.liveness_ttl_seconds = 1;
        config.cluster.sync_interval_ms = 5000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cluster.secret.clear();
        assert!(config.validate().is_err());
        config.cluster.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scheduler.drain_timeout_seconds = 0;
        assert!(matches!(config.validate(), Err(SchedulerError::Configuration(_))));
    }

    #[test]
    fn test_app_config_toml_roundtrip() {
        let config = AppConfig::default();
        let serialized = config.to_toml().expect("serialize");
        let restored = AppConfig::from_toml(&serialized).expect("deserialize");
        assert_eq!(restored.cluster.sync_interval_ms, config.cluster.sync_interval_ms);
        assert_eq!(restored.logging.level, config.logging.level);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(file, "[cluster]\ncluster_id = \"from-file\"\nnode_id = \"n1\"").expect("write");

        let path = file.path().to_string_lossy().to_string();
        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.cluster.cluster_id, "from-file");
        assert_eq!(config.cluster.node_id, "n1");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Some("/nonexistent/scheduler.toml")).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }
}
