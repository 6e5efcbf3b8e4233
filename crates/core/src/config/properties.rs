use std::collections::HashMap;
use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat, Value, ValueKind};
use tracing::{debug, warn};

use crate::{AppConfig, SchedulerError, SchedulerResult};

/// 按加载顺序排列的属性集合
///
/// 同一个键出现在多个集合中时，最后加载的生效。
#[derive(Debug, Clone, Default)]
pub struct PropertySets {
    sets: Vec<(String, HashMap<String, String>)>,
}

impl PropertySets {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内联 `[properties]` 在前，`scheduler.property_files` 按顺序在后
    pub fn from_app_config(config: &AppConfig) -> SchedulerResult<Self> {
        let mut sets = Self::new();
        if !config.properties.is_empty() {
            sets.push("inline", config.properties.clone());
        }
        for path in &config.scheduler.property_files {
            let properties = Self::load_file(Path::new(path))?;
            sets.push(path.clone(), properties);
        }
        Ok(sets)
    }

    pub fn push<S: Into<String>>(&mut self, source: S, properties: HashMap<String, String>) {
        let source = source.into();
        debug!("加载属性集 {}: {} 项", source, properties.len());
        self.sets.push((source, properties));
    }

    pub fn with<S: Into<String>>(mut self, source: S, properties: HashMap<String, String>) -> Self {
        self.push(source, properties);
        self
    }

    /// 扫描全部属性集，返回最后一个匹配值
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.sets
            .iter()
            .filter_map(|(_, properties)| properties.get(key))
            .last()
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// 读取一个属性文件，嵌套表展开为以 `.` 连接的键
    pub fn load_file(path: &Path) -> SchedulerResult<HashMap<String, String>> {
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            Some("ini") | Some("properties") => FileFormat::Ini,
            other => {
                return Err(SchedulerError::config_error(format!(
                    "不支持的属性文件格式: {} ({:?})",
                    path.display(),
                    other
                )))
            }
        };
        let name = path.to_string_lossy();
        let loaded = ConfigBuilder::builder()
            .add_source(File::new(&name, format))
            .build()?;
        let table: HashMap<String, Value> = loaded.try_deserialize()?;

        let mut properties = HashMap::new();
        for (key, value) in table {
            flatten_into(&mut properties, key, value);
        }
        Ok(properties)
    }
}

fn flatten_into(properties: &mut HashMap<String, String>, key: String, value: Value) {
    match value.kind {
        ValueKind::Table(table) => {
            for (child, value) in table {
                flatten_into(properties, format!("{key}.{child}"), value);
            }
        }
        ValueKind::Array(items) => {
            let joined = items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            properties.insert(key, joined);
        }
        ValueKind::Nil => {
            warn!("忽略空属性: {}", key);
        }
        scalar => {
            properties.insert(key, scalar.to_string());
        }
    }
}
