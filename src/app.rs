use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use scheduler_cluster::{ClusterSyncPublisher, KeySchema, TopologyReconciler};
use scheduler_core::{AppConfig, JobFactory, KvStore, PropertySets, ScheduledJob};
use scheduler_dispatcher::{RegistrySettings, SchedulerRegistry, SharedExecutor, TaskDeclaration};
use scheduler_infrastructure::{Encryptor, InMemoryKvStore, ValueCipher};

/// 内存存储清理过期键的周期
const STORE_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// 主应用程序
///
/// 持有注册表、存储和拓扑协调器，负责启动顺序和关闭顺序。
pub struct Application {
    config: AppConfig,
    properties: PropertySets,
    store: Arc<dyn KvStore>,
    registry: Arc<SchedulerRegistry>,
    reconciler: Option<Arc<TopologyReconciler>>,
    expiry_task: Option<JoinHandle<()>>,
}

impl Application {
    /// 使用进程内存储创建应用
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(InMemoryKvStore::new());
        let expiry_task = store.spawn_expiry_task(STORE_EXPIRY_INTERVAL);
        let mut app = Self::with_store(config, store)?;
        app.expiry_task = Some(expiry_task);
        Ok(app)
    }

    /// 使用外部提供的存储创建应用
    pub fn with_store(config: AppConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        config.validate().context("配置校验失败")?;
        let properties = PropertySets::from_app_config(&config).context("加载属性文件失败")?;

        let executor = SharedExecutor::current().context("获取运行时失败")?;
        let settings = RegistrySettings {
            retain_retired: config.cluster.enabled && config.cluster.analysis_enabled,
            ..RegistrySettings::from(&config.scheduler)
        };
        let registry = SchedulerRegistry::new(executor, settings);

        let reconciler = config.cluster.enabled.then(|| {
            Arc::new(TopologyReconciler::new(KeySchema::new(
                &config.cluster.root_namespace,
                &config.cluster.cluster_id,
            )))
        });

        info!(
            "应用初始化完成，集群同步: {}，属性集: {}",
            config.cluster.enabled,
            properties.len()
        );
        Ok(Self {
            config,
            properties,
            store,
            registry,
            reconciler,
            expiry_task: None,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn reconciler(&self) -> Option<&Arc<TopologyReconciler>> {
        self.reconciler.as_ref()
    }

    /// 加载发现组件提供的任务声明，加载失败时整个调度子系统不能启动
    pub async fn load_tasks(&self, declarations: Vec<TaskDeclaration>) -> Result<usize> {
        let count = self
            .registry
            .load(declarations, self.properties.clone())
            .await
            .context("加载任务声明失败")?;
        Ok(count)
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let reconciler_handle = match &self.reconciler {
            Some(reconciler) => {
                self.register_publisher().await?;
                let reconciler = Arc::clone(reconciler);
                let store = Arc::clone(&self.store);
                let shutdown_rx = shutdown_rx.resubscribe();
                Some(tokio::spawn(async move {
                    if let Err(e) = reconciler.run(store, shutdown_rx).await {
                        error!("拓扑协调器失败: {}", e);
                    }
                }))
            }
            None => None,
        };

        let started = self.registry.start_all().await.context("启动任务失败")?;
        info!("调度器已启动，运行中的任务: {}", started);

        let _ = shutdown_rx.recv().await;
        info!("调度器收到关闭信号");

        self.stop(reconciler_handle).await;
        Ok(())
    }

    async fn register_publisher(&self) -> Result<()> {
        let encryptor: Arc<dyn Encryptor> = Arc::new(
            ValueCipher::new(&self.config.cluster.secret).context("初始化存储加密失败")?,
        );
        let publisher: Arc<dyn ScheduledJob> = Arc::new(ClusterSyncPublisher::new(
            &self.registry,
            Arc::clone(&self.store),
            encryptor,
            self.config.cluster.clone(),
        ));
        let factory: JobFactory = Arc::new(move |_| Arc::clone(&publisher));
        self.registry
            .register(ClusterSyncPublisher::task_config(&self.config.cluster), factory)
            .await
            .context("注册集群同步任务失败")?;
        Ok(())
    }

    async fn stop(&self, reconciler_handle: Option<JoinHandle<()>>) {
        let closing = self.registry.shutdown().await;
        info!("正在关闭 {} 个任务", closing);

        if !self
            .registry
            .await_non_daemon(self.config.scheduler.drain_timeout())
            .await
        {
            warn!("非守护任务未在限定时间内退出");
        }
        let poll_interval = self.config.scheduler.drain_poll_interval();
        let drained = tokio::time::timeout(self.config.scheduler.drain_timeout(), async {
            while self.registry.active_count().await > 0 {
                tokio::time::sleep(poll_interval).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "仍有 {} 个任务未退出",
                self.registry.active_count().await
            );
        }

        if let Some(handle) = reconciler_handle {
            if let Err(e) = handle.await {
                warn!("拓扑协调器异常退出: {}", e);
            }
        }
        if let Some(task) = &self.expiry_task {
            task.abort();
        }
        info!("调度器已停止");
    }
}
