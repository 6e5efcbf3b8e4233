use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use scheduler_core::{JobFactory, PropertySets, SchedulerConfig, SchedulerError, SchedulerResult};
use scheduler_domain::{EngineSnapshot, TaskConfig};

use crate::engine::{EngineListener, TaskEngine, DEFAULT_PHASE_ERROR_BACKOFF};
use crate::executor::SharedExecutor;
use crate::loader::{expand, TaskDeclaration};

/// 注册表运行参数
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
    pub phase_error_backoff: Duration,
    /// 是否保留已退出引擎的快照，只有存在消费者（集群状态上报）时才需要开启
    pub retain_retired: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(100),
            phase_error_backoff: DEFAULT_PHASE_ERROR_BACKOFF,
            retain_retired: true,
        }
    }
}

impl From<&SchedulerConfig> for RegistrySettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            drain_timeout: config.drain_timeout(),
            drain_poll_interval: config.drain_poll_interval(),
            phase_error_backoff: config.phase_error_backoff(),
            retain_retired: true,
        }
    }
}

struct EngineHandle {
    id: String,
    daemon: bool,
    handle: JoinHandle<()>,
}

/// 一次加载的声明及其使用的属性集，重新加载时按原属性集展开
struct LoadedBatch {
    declarations: Vec<TaskDeclaration>,
    properties: PropertySets,
}

#[derive(Clone)]
struct Registration {
    config: TaskConfig,
    factory: JobFactory,
}

/// 调度器注册表：持有全部存活的执行引擎
///
/// 每个进程构造一个实例并以 `Arc` 共享，引擎退出时通过 [`EngineListener`] 回调解除绑定。
pub struct SchedulerRegistry {
    executor: Arc<SharedExecutor>,
    settings: RegistrySettings,
    active: RwLock<HashMap<String, Arc<TaskEngine>>>,
    pending: Mutex<Vec<Arc<TaskEngine>>>,
    retired: Mutex<Vec<EngineSnapshot>>,
    handles: Mutex<Vec<EngineHandle>>,
    batches: Mutex<Vec<LoadedBatch>>,
    registrations: Mutex<Vec<Registration>>,
}

impl SchedulerRegistry {
    pub fn new(executor: Arc<SharedExecutor>, settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            executor,
            settings,
            active: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
        })
    }

    pub fn executor(&self) -> &Arc<SharedExecutor> {
        &self.executor
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// 展开并校验一批任务声明，放入待启动队列
    ///
    /// 任意声明出错（包括ID重复）时整批放弃，不会留下部分加载的引擎。
    pub async fn load(
        &self,
        declarations: Vec<TaskDeclaration>,
        properties: PropertySets,
    ) -> SchedulerResult<usize> {
        let mut configs = Vec::new();
        for declaration in &declarations {
            for config in expand(&declaration.declared, &properties)? {
                configs.push((config, declaration.factory.clone()));
            }
        }

        let engines = self.build_engines(configs).await?;
        let count = engines.len();
        self.pending.lock().await.extend(engines);
        self.batches.lock().await.push(LoadedBatch {
            declarations,
            properties,
        });

        info!("已加载 {} 个任务引擎", count);
        Ok(count)
    }

    /// 注册一个由程序直接构造的任务（例如集群同步任务）
    pub async fn register(&self, config: TaskConfig, factory: JobFactory) -> SchedulerResult<()> {
        let engines = self
            .build_engines(vec![(config.clone(), factory.clone())])
            .await?;
        self.pending.lock().await.extend(engines);
        self.registrations
            .lock()
            .await
            .push(Registration { config, factory });
        Ok(())
    }

    async fn build_engines(
        &self,
        configs: Vec<(TaskConfig, JobFactory)>,
    ) -> SchedulerResult<Vec<Arc<TaskEngine>>> {
        let mut known: HashSet<String> = self.active.read().await.keys().cloned().collect();
        known.extend(
            self.pending
                .lock()
                .await
                .iter()
                .map(|engine| engine.id().to_string()),
        );

        let mut engines = Vec::with_capacity(configs.len());
        for (config, factory) in configs {
            if !known.insert(config.id.clone()) {
                error!("任务ID重复: {}", config.id);
                return Err(SchedulerError::DuplicateTask { id: config.id });
            }
            let job = factory(config.shard);
            let engine = TaskEngine::new(config, job, self.executor.clone())?
                .with_phase_error_backoff(self.settings.phase_error_backoff);
            engines.push(Arc::new(engine));
        }
        Ok(engines)
    }

    /// 启动待启动队列中的全部引擎，队列为空时不做任何事
    pub async fn start_all(self: &Arc<Self>) -> SchedulerResult<usize> {
        let pending: Vec<Arc<TaskEngine>> = self.pending.lock().await.drain(..).collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let listener: Arc<dyn EngineListener> = self.clone();
        let mut handles = self.handles.lock().await;
        handles.retain(|entry| !entry.handle.is_finished());

        let mut started = 0;
        let mut pending = pending.into_iter();
        while let Some(engine) = pending.next() {
            self.bind(engine.clone()).await;
            let daemon = engine.config().daemon;
            match self
                .executor
                .spawn(engine.clone().run(Some(listener.clone())))
            {
                Ok(handle) => {
                    handles.push(EngineHandle {
                        id: engine.id().to_string(),
                        daemon,
                        handle,
                    });
                    started += 1;
                }
                Err(e) => {
                    self.active.write().await.remove(engine.id());
                    let mut unstarted = vec![engine];
                    unstarted.extend(pending);
                    error!(
                        "启动任务引擎失败，{} 个引擎退回待启动队列: {}",
                        unstarted.len(),
                        e
                    );
                    let mut queue = self.pending.lock().await;
                    unstarted.append(&mut queue);
                    *queue = unstarted;
                    return Err(e);
                }
            }
        }

        info!("已启动 {} 个任务引擎", started);
        Ok(started)
    }

    /// 加入存活集合，同一ID重复绑定时后者覆盖前者
    pub async fn bind(&self, engine: Arc<TaskEngine>) -> Arc<TaskEngine> {
        let previous = self
            .active
            .write()
            .await
            .insert(engine.id().to_string(), engine.clone());
        if previous.is_some() {
            warn!("任务 {} 被重复绑定，旧实例已被替换", engine.id());
        }
        engine
    }

    /// 从存活集合移除，并保留一份退出时的快照
    pub async fn unbind(&self, engine: &Arc<TaskEngine>) -> bool {
        let snapshot = engine.snapshot().await;
        // 持有 retired 锁直到快照入队，存活数量变化后快照立即可见
        let mut retired = self.retired.lock().await;
        let removed = {
            let mut active = self.active.write().await;
            match active.get(engine.id()) {
                Some(current) if Arc::ptr_eq(current, engine) => {
                    active.remove(engine.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.retain_snapshot(&mut retired, snapshot);
            debug!("任务 {} 已解除绑定", engine.id());
        }
        removed
    }

    pub async fn close_group(&self, group: &str) -> usize {
        let engines: Vec<Arc<TaskEngine>> = self
            .active
            .read()
            .await
            .values()
            .filter(|engine| engine.group() == group)
            .cloned()
            .collect();
        for engine in &engines {
            engine.close(true).await;
        }
        info!("已请求关闭分组 {} 的 {} 个任务", group, engines.len());
        engines.len()
    }

    pub async fn close_all(&self) -> usize {
        let engines: Vec<Arc<TaskEngine>> = self.active.read().await.values().cloned().collect();
        for engine in &engines {
            engine.close(true).await;
        }
        info!("已请求关闭全部 {} 个任务", engines.len());
        engines.len()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TaskEngine>> {
        self.active.read().await.get(id).cloned()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshots(&self) -> Vec<EngineSnapshot> {
        let engines: Vec<Arc<TaskEngine>> = self.active.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(engines.len());
        for engine in engines {
            snapshots.push(engine.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// 同一ID只保留最近一次退出的快照
    fn retain_snapshot(&self, retired: &mut Vec<EngineSnapshot>, snapshot: EngineSnapshot) {
        if !self.settings.retain_retired {
            return;
        }
        retired.retain(|existing| existing.id != snapshot.id);
        retired.push(snapshot);
    }

    /// 取走已退出引擎的快照
    pub async fn drain_retired(&self) -> Vec<EngineSnapshot> {
        std::mem::take(&mut *self.retired.lock().await)
    }

    /// 把未处理完的快照放回队首；期间同ID又有新快照入队时以新快照为准
    pub async fn requeue_retired(&self, snapshots: Vec<EngineSnapshot>) {
        if !self.settings.retain_retired || snapshots.is_empty() {
            return;
        }
        let mut retired = self.retired.lock().await;
        let newer: HashSet<String> = retired.iter().map(|s| s.id.clone()).collect();
        let mut restored: Vec<EngineSnapshot> = snapshots
            .into_iter()
            .filter(|s| !newer.contains(&s.id))
            .collect();
        debug!("{} 个退出快照放回队列", restored.len());
        restored.append(&mut retired);
        *retired = restored;
    }

    /// 关闭全部引擎，在超时内等待它们退出，然后按已加载的声明重新构建并启动
    pub async fn reload(self: &Arc<Self>) -> SchedulerResult<usize> {
        info!("开始重新加载调度器");
        self.pending.lock().await.clear();
        self.close_all().await;
        self.drain().await?;

        let mut configs = Vec::new();
        for batch in self.batches.lock().await.iter() {
            for declaration in &batch.declarations {
                for config in expand(&declaration.declared, &batch.properties)? {
                    configs.push((config, declaration.factory.clone()));
                }
            }
        }
        for registration in self.registrations.lock().await.iter() {
            configs.push((registration.config.clone(), registration.factory.clone()));
        }

        let engines = self.build_engines(configs).await?;
        self.pending.lock().await.extend(engines);
        self.start_all().await
    }

    /// 轮询等待存活数量归零，超时后强制中止剩余引擎
    async fn drain(&self) -> SchedulerResult<()> {
        let started = Instant::now();
        loop {
            let remaining = self.active_count().await;
            if remaining == 0 {
                debug!("全部任务已退出，耗时 {}ms", started.elapsed().as_millis());
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.settings.drain_timeout {
                let stuck = self.force_abort().await;
                warn!("等待任务退出超时，已强制中止: {:?}", stuck);
                return Err(SchedulerError::DrainTimeout {
                    remaining,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.settings.drain_poll_interval).await;
        }
    }

    async fn force_abort(&self) -> Vec<String> {
        let stuck: Vec<Arc<TaskEngine>> = self
            .active
            .write()
            .await
            .drain()
            .map(|(_, engine)| engine)
            .collect();
        let ids: HashSet<&str> = stuck.iter().map(|engine| engine.id()).collect();

        let mut handles = self.handles.lock().await;
        for entry in handles.iter().filter(|entry| ids.contains(entry.id.as_str())) {
            entry.handle.abort();
        }
        handles.retain(|entry| !ids.contains(entry.id.as_str()));
        drop(handles);

        let mut retired = self.retired.lock().await;
        for engine in &stuck {
            let snapshot = engine.snapshot().await;
            self.retain_snapshot(&mut retired, snapshot);
        }
        stuck.iter().map(|engine| engine.id().to_string()).collect()
    }

    /// 关闭执行器并请求全部引擎退出
    pub async fn shutdown(&self) -> usize {
        self.executor.shutdown();
        self.pending.lock().await.clear();
        self.close_all().await
    }

    /// 等待非守护引擎退出，超时返回 false
    pub async fn await_non_daemon(&self, timeout: Duration) -> bool {
        let handles: Vec<EngineHandle> = {
            let mut handles = self.handles.lock().await;
            let (non_daemon, daemon): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|entry| !entry.daemon);
            *handles = daemon;
            non_daemon
        };
        let count = handles.len();

        let joined = tokio::time::timeout(timeout, async {
            for entry in handles {
                if let Err(e) = entry.handle.await {
                    warn!("任务 {} 异常退出: {}", entry.id, e);
                }
            }
        })
        .await;

        match joined {
            Ok(()) => {
                debug!("{} 个非守护任务已退出", count);
                true
            }
            Err(_) => {
                warn!("等待非守护任务退出超时");
                false
            }
        }
    }
}

#[async_trait]
impl EngineListener for SchedulerRegistry {
    async fn engine_closed(&self, engine: &Arc<TaskEngine>) {
        self.unbind(engine).await;
    }
}
