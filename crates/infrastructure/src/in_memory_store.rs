use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use scheduler_core::{KvEntry, KvStore, PutOptions, SchedulerError, SchedulerResult, Snapshot};

/// 内存键值存储
///
/// 按 `/` 分隔的层级键组织，写入子键时隐式创建父目录。支持TTL、创建/更新条件、
/// 按修改索引的比较并交换，以及按前缀推送完整快照的订阅。适用于嵌入式部署和测试。
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<String, StoredNode>,
    index: u64,
    watchers: Vec<Watcher>,
}

#[derive(Debug, Clone)]
struct StoredNode {
    value: String,
    dir: bool,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<Snapshot>,
    last: Snapshot,
}

/// 去掉末尾的 `/`，根路径保持不变
fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn in_subtree(key: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn parents(key: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = key;
    while let Some(pos) = current.rfind('/') {
        if pos == 0 {
            break;
        }
        current = &current[..pos];
        result.push(current.to_string());
    }
    result.reverse();
    result
}

impl StoredNode {
    fn to_entry(&self, key: &str) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: self.value.clone(),
            created_index: self.created_index,
            modified_index: self.modified_index,
        }
    }
}

impl StoreState {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn snapshot(&self, prefix: &str) -> Snapshot {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix) || prefix == "/")
            .filter(|(key, _)| in_subtree(key, prefix))
            .map(|(key, node)| (key.clone(), node.value.clone()))
            .collect()
    }

    fn subtree_keys(&self, key: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|candidate| in_subtree(candidate, key))
            .cloned()
            .collect()
    }

    /// 删除到期的键及其子树，返回删除数量
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, node)| node.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            for victim in self.subtree_keys(&key) {
                if self.entries.remove(&victim).is_some() {
                    removed += 1;
                }
            }
            debug!("键已过期: {}", key);
        }
        if removed > 0 {
            self.next_index();
        }
        removed
    }

    /// 向快照发生变化的订阅者推送，顺便清理已关闭的订阅
    fn notify_watchers(&mut self) {
        let mut watchers = std::mem::take(&mut self.watchers);
        watchers.retain_mut(|watcher| {
            let snapshot = self.snapshot(&watcher.prefix);
            if snapshot == watcher.last {
                return !watcher.sender.is_closed();
            }
            watcher.last = snapshot.clone();
            watcher.sender.send(snapshot).is_ok()
        });
        self.watchers = watchers;
    }

    fn put(&mut self, key: &str, value: &str, opts: &PutOptions, now: Instant) -> SchedulerResult<KvEntry> {
        let existing = self.entries.get(key).cloned();

        match (opts.prev_exist, &existing) {
            (Some(false), Some(_)) => return Err(SchedulerError::key_already_exists(key)),
            (Some(true), None) => return Err(SchedulerError::key_not_found(key)),
            _ => {}
        }
        if let Some(expected) = opts.prev_index {
            let current = existing
                .as_ref()
                .ok_or_else(|| SchedulerError::key_not_found(key))?;
            if current.modified_index != expected {
                return Err(SchedulerError::IndexMismatch {
                    key: key.to_string(),
                    expected,
                    actual: current.modified_index,
                });
            }
        }
        if let Some(current) = &existing {
            if current.dir != opts.dir {
                return Err(SchedulerError::store_error(format!(
                    "键 {} 的类型不匹配（目录: {}）",
                    key, current.dir
                )));
            }
        }

        let parents = parents(key);
        if let Some(parent) = parents
            .iter()
            .find(|parent| self.entries.get(*parent).is_some_and(|node| !node.dir))
        {
            return Err(SchedulerError::store_error(format!(
                "父路径 {} 不是目录",
                parent
            )));
        }
        for parent in parents {
            if !self.entries.contains_key(&parent) {
                let index = self.next_index();
                self.entries.insert(
                    parent,
                    StoredNode {
                        value: String::new(),
                        dir: true,
                        created_index: index,
                        modified_index: index,
                        expires_at: None,
                    },
                );
            }
        }

        let index = self.next_index();
        let node = StoredNode {
            value: if opts.dir { String::new() } else { value.to_string() },
            dir: opts.dir,
            created_index: existing.as_ref().map_or(index, |node| node.created_index),
            modified_index: index,
            expires_at: opts.ttl.map(|ttl| now + ttl),
        };
        let entry = node.to_entry(key);
        self.entries.insert(key.to_string(), node);
        Ok(entry)
    }

    fn delete(&mut self, key: &str, recursive: bool) -> SchedulerResult<()> {
        if !self.entries.contains_key(key) {
            return Err(SchedulerError::key_not_found(key));
        }
        let victims = self.subtree_keys(key);
        if victims.len() > 1 && !recursive {
            return Err(SchedulerError::store_error(format!("目录 {} 非空", key)));
        }
        for victim in victims {
            self.entries.remove(&victim);
        }
        self.next_index();
        Ok(())
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 立即清理到期的键，返回删除数量
    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.purge_expired(Instant::now());
        if removed > 0 {
            state.notify_watchers();
        }
        removed
    }

    /// 周期性清理到期的键，使没有写入时订阅者也能观察到过期
    pub fn spawn_expiry_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.purge_expired().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        if state.purge_expired(Instant::now()) > 0 {
            state.notify_watchers();
        }
        state.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 当前全局修改索引
    pub async fn current_index(&self) -> u64 {
        self.state.lock().await.index
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn put(&self, key: &str, value: &str, opts: PutOptions) -> SchedulerResult<KvEntry> {
        let key = normalize(key);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        let result = state.put(&key, value, &opts, now);
        state.notify_watchers();
        result
    }

    async fn get(&self, key: &str) -> SchedulerResult<KvEntry> {
        let key = normalize(key);
        let mut state = self.state.lock().await;
        if state.purge_expired(Instant::now()) > 0 {
            state.notify_watchers();
        }
        state
            .entries
            .get(&key)
            .map(|node| node.to_entry(&key))
            .ok_or_else(|| SchedulerError::key_not_found(key.clone()))
    }

    async fn list(&self, prefix: &str) -> SchedulerResult<Vec<KvEntry>> {
        let prefix = normalize(prefix);
        let mut state = self.state.lock().await;
        if state.purge_expired(Instant::now()) > 0 {
            state.notify_watchers();
        }
        Ok(state
            .entries
            .iter()
            .filter(|(key, _)| in_subtree(key, &prefix))
            .map(|(key, node)| node.to_entry(key))
            .collect())
    }

    async fn delete(&self, key: &str, recursive: bool) -> SchedulerResult<()> {
        let key = normalize(key);
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        let result = state.delete(&key, recursive);
        state.notify_watchers();
        result
    }

    async fn watch(&self, prefix: &str) -> SchedulerResult<mpsc::UnboundedReceiver<Snapshot>> {
        let prefix = normalize(prefix);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.notify_watchers();

        let snapshot = state.snapshot(&prefix);
        sender
            .send(snapshot.clone())
            .map_err(|e| SchedulerError::store_error(format!("推送初始快照失败: {e}")))?;
        state.watchers.push(Watcher {
            prefix: prefix.clone(),
            sender,
            last: snapshot,
        });
        info!("新增订阅: {}", prefix);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents_and_subtree() {
        assert_eq!(
            parents("/cluster/c1/Node/n1"),
            vec!["/cluster", "/cluster/c1", "/cluster/c1/Node"]
        );
        assert!(parents("/cluster").is_empty());
        assert!(in_subtree("/cluster/c1", "/cluster"));
        assert!(in_subtree("/cluster", "/cluster"));
        assert!(!in_subtree("/clusters", "/cluster"));
        assert_eq!(normalize("cluster/c1/"), "/cluster/c1");
    }

    #[tokio::test]
    async fn test_put_creates_parent_directories() {
        let store = InMemoryKvStore::new();
        store
            .put("/cluster/c1/Node/n1/host", "10.0.0.1", PutOptions::default())
            .await
            .unwrap();

        let keys: Vec<String> = store
            .list("/cluster")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "/cluster",
                "/cluster/c1",
                "/cluster/c1/Node",
                "/cluster/c1/Node/n1",
                "/cluster/c1/Node/n1/host",
            ]
        );
        assert_eq!(
            store.get("/cluster/c1/Node/n1/host").await.unwrap().value,
            "10.0.0.1"
        );
    }
}
