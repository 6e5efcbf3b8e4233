#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use scheduler_core::{PropertySets, SchedulerError};
    use scheduler_dispatcher::{
        RegistrySettings, SchedulerRegistry, SharedExecutor, TaskDeclaration,
    };
    use scheduler_testing_utils::{
        property_map, DeclaredTaskBuilder, RecordingFactory, TaskConfigBuilder, TestEnv,
    };

    fn registry() -> Arc<SchedulerRegistry> {
        SchedulerRegistry::new(SharedExecutor::current().unwrap(), RegistrySettings::default())
    }

    async fn wait_active(registry: &Arc<SchedulerRegistry>, expected: usize) -> bool {
        let registry = registry.clone();
        TestEnv::wait_for(
            move || {
                let registry = registry.clone();
                async move { registry.active_count().await == expected }
            },
            Duration::from_secs(5),
        )
        .await
    }

    async fn wait_executions(factory: &RecordingFactory, expected: usize) -> bool {
        let factory = factory.clone();
        TestEnv::wait_for(
            move || {
                let factory = factory.clone();
                async move { factory.total_executions() >= expected }
            },
            Duration::from_secs(5),
        )
        .await
    }

    async fn wait_destroyed(factory: &RecordingFactory, count: usize) -> bool {
        let factory = factory.clone();
        TestEnv::wait_for(
            move || {
                let factory = factory.clone();
                async move {
                    factory
                        .jobs()
                        .iter()
                        .take(count)
                        .all(|job| job.destroy_count() == 1)
                }
            },
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn test_parallel_expansion_and_duplicate_detection() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let report = TaskDeclaration::new(
            DeclaredTaskBuilder::new("report")
                .with_parallel(3)
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );

        assert_eq!(
            registry
                .load(vec![report], PropertySets::new())
                .await
                .unwrap(),
            3
        );
        assert_eq!(registry.start_all().await.unwrap(), 3);
        assert_eq!(
            registry.active_ids().await,
            vec!["report-0", "report-1", "report-2"]
        );
        for id in ["report-0", "report-1", "report-2"] {
            let engine = registry.get(id).await.unwrap();
            assert!(Arc::ptr_eq(engine.executor(), registry.executor()));
        }

        // 另一个声明的ID与已有分片冲突，整批加载失败
        let colliding = TaskDeclaration::new(
            DeclaredTaskBuilder::new("other").with_id("report").build(),
            factory.job_factory(),
        );
        let fresh = TaskDeclaration::new(
            DeclaredTaskBuilder::new("fresh").build(),
            factory.job_factory(),
        );
        let err = registry
            .load(vec![fresh, colliding], PropertySets::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { ref id } if id == "report-0"));
        assert!(err.is_fatal());
        assert_eq!(registry.pending_count().await, 0);

        // 启动是幂等的
        assert_eq!(registry.start_all().await.unwrap(), 0);
        registry.close_all().await;
        assert!(wait_active(&registry, 0).await);
    }

    #[tokio::test]
    async fn test_duplicate_within_one_batch() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let first = TaskDeclaration::new(
            DeclaredTaskBuilder::new("sync").with_parallel(2).build(),
            factory.job_factory(),
        );
        let second = TaskDeclaration::new(
            DeclaredTaskBuilder::new("sync-copy").with_id("sync").build(),
            factory.job_factory(),
        );
        let err = registry
            .load(vec![first, second], PropertySets::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { .. }));
        assert_eq!(registry.pending_count().await, 0);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_group_leaves_other_groups() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let declarations = vec![
            TaskDeclaration::new(
                DeclaredTaskBuilder::new("alpha")
                    .with_parallel(2)
                    .with_interval_millis(3_600_000)
                    .build(),
                factory.job_factory(),
            ),
            TaskDeclaration::new(
                DeclaredTaskBuilder::new("beta")
                    .with_interval_millis(3_600_000)
                    .build(),
                factory.job_factory(),
            ),
        ];
        registry.load(declarations, PropertySets::new()).await.unwrap();
        registry.start_all().await.unwrap();
        assert!(wait_executions(&factory, 3).await);

        assert_eq!(registry.close_group("alpha").await, 2);
        assert!(wait_active(&registry, 1).await);
        assert_eq!(registry.active_ids().await, vec!["beta-0"]);

        let retired = registry.drain_retired().await;
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(|s| s.group == "alpha" && s.is_removed()));
        assert!(registry.drain_retired().await.is_empty());

        assert_eq!(registry.close_all().await, 1);
        assert!(wait_active(&registry, 0).await);
        assert!(wait_destroyed(&factory, 3).await);
    }

    #[tokio::test]
    async fn test_exhausted_engine_unbinds_without_removal_mark() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let config = TaskConfigBuilder::new("oneshot-0")
            .with_group("oneshot")
            .with_run_count(2)
            .build();
        registry.register(config, factory.job_factory()).await.unwrap();
        registry.start_all().await.unwrap();

        assert!(wait_active(&registry, 0).await);
        assert_eq!(factory.total_executions(), 2);
        let retired = registry.drain_retired().await;
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].cycle_count, 2);
        assert!(!retired[0].is_removed());
    }

    #[tokio::test]
    async fn test_parallel_property_last_set_wins() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let declaration = TaskDeclaration::new(
            DeclaredTaskBuilder::new("worker")
                .with_parallel_property("worker.parallel")
                .with_cron_property("worker.cron")
                .build(),
            factory.job_factory(),
        );
        let properties = PropertySets::new()
            .with("first", property_map(&[("worker.parallel", "5")]))
            .with(
                "second",
                property_map(&[("worker.parallel", "2"), ("worker.cron", "0 0 12 * * ?")]),
            );

        assert_eq!(registry.load(vec![declaration], properties).await.unwrap(), 2);
        registry.start_all().await.unwrap();
        let engine = registry.get("worker-1").await.unwrap();
        assert_eq!(
            engine.config().cron_expression.as_deref(),
            Some("0 0 12 * * ?")
        );
        registry.close_all().await;
        assert!(wait_active(&registry, 0).await);
    }

    #[tokio::test]
    async fn test_reload_rebuilds_engines() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let declaration = TaskDeclaration::new(
            DeclaredTaskBuilder::new("job")
                .with_parallel(2)
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );
        registry
            .load(vec![declaration], PropertySets::new())
            .await
            .unwrap();
        registry.start_all().await.unwrap();
        assert!(wait_executions(&factory, 2).await);

        assert_eq!(registry.reload().await.unwrap(), 2);
        assert_eq!(factory.created(), 4);
        assert_eq!(registry.active_ids().await, vec!["job-0", "job-1"]);

        assert!(wait_destroyed(&factory, 2).await);
        assert!(wait_executions(&factory, 4).await);

        registry.close_all().await;
        assert!(wait_active(&registry, 0).await);
    }

    #[tokio::test]
    async fn test_reload_times_out_on_stuck_engine() {
        let settings = RegistrySettings {
            drain_timeout: Duration::from_millis(200),
            drain_poll_interval: Duration::from_millis(20),
            ..RegistrySettings::default()
        };
        let registry = SchedulerRegistry::new(SharedExecutor::current().unwrap(), settings);
        let factory = RecordingFactory::new().with_execute_delay(Duration::from_secs(30));
        let declaration = TaskDeclaration::new(
            DeclaredTaskBuilder::new("stuck").build(),
            factory.job_factory(),
        );
        registry
            .load(vec![declaration], PropertySets::new())
            .await
            .unwrap();
        registry.start_all().await.unwrap();
        assert!(wait_executions(&factory, 1).await);

        let started = std::time::Instant::now();
        let err = registry.reload().await.unwrap_err();
        assert!(matches!(err, SchedulerError::DrainTimeout { remaining: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(registry.drain_retired().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_non_daemon_engines() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let declaration = TaskDeclaration::new(
            DeclaredTaskBuilder::new("keeper")
                .non_daemon()
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );
        registry
            .load(vec![declaration], PropertySets::new())
            .await
            .unwrap();
        registry.start_all().await.unwrap();
        assert!(wait_executions(&factory, 1).await);

        assert_eq!(registry.shutdown().await, 1);
        assert!(registry.await_non_daemon(Duration::from_secs(2)).await);
        assert_eq!(registry.active_count().await, 0);
        assert!(registry.executor().is_shutdown());

        for id in ["late-0", "late-1"] {
            let late = TaskConfigBuilder::new(id).build();
            registry.register(late, factory.job_factory()).await.unwrap();
        }
        assert!(matches!(
            registry.start_all().await,
            Err(SchedulerError::ExecutorShutdown)
        ));
        // 未能启动的引擎留在待启动队列中
        assert_eq!(registry.pending_count().await, 2);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_reload_uses_properties_of_each_batch() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let alpha = TaskDeclaration::new(
            DeclaredTaskBuilder::new("alpha")
                .with_parallel_property("alpha.parallel")
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );
        let beta = TaskDeclaration::new(
            DeclaredTaskBuilder::new("beta")
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );
        let alpha_properties =
            PropertySets::new().with("alpha", property_map(&[("alpha.parallel", "3")]));

        assert_eq!(registry.load(vec![alpha], alpha_properties).await.unwrap(), 3);
        assert_eq!(registry.load(vec![beta], PropertySets::new()).await.unwrap(), 1);
        registry.start_all().await.unwrap();

        assert_eq!(registry.reload().await.unwrap(), 4);
        assert_eq!(
            registry.active_ids().await,
            vec!["alpha-0", "alpha-1", "alpha-2", "beta-0"]
        );
        registry.close_all().await;
        assert!(wait_active(&registry, 0).await);
    }

    #[tokio::test]
    async fn test_retired_snapshots_keep_latest_per_id() {
        let registry = registry();
        let factory = RecordingFactory::new();
        let declaration = TaskDeclaration::new(
            DeclaredTaskBuilder::new("shard")
                .with_parallel(2)
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );
        registry
            .load(vec![declaration], PropertySets::new())
            .await
            .unwrap();
        registry.start_all().await.unwrap();

        for _ in 0..5 {
            registry.reload().await.unwrap();
        }
        let retired = registry.drain_retired().await;
        assert_eq!(retired.len(), 2);

        registry.close_all().await;
        assert!(wait_active(&registry, 0).await);
    }

    #[tokio::test]
    async fn test_retired_snapshots_dropped_without_consumer() {
        let settings = RegistrySettings {
            retain_retired: false,
            ..RegistrySettings::default()
        };
        let registry = SchedulerRegistry::new(SharedExecutor::current().unwrap(), settings);
        let factory = RecordingFactory::new();
        let declaration = TaskDeclaration::new(
            DeclaredTaskBuilder::new("quiet")
                .with_parallel(4)
                .with_interval_millis(3_600_000)
                .build(),
            factory.job_factory(),
        );
        registry
            .load(vec![declaration], PropertySets::new())
            .await
            .unwrap();
        registry.start_all().await.unwrap();

        for _ in 0..3 {
            registry.reload().await.unwrap();
        }
        registry.close_all().await;
        assert!(wait_active(&registry, 0).await);
        assert!(registry.drain_retired().await.is_empty());
    }

    #[tokio::test]
    async fn test_requeued_snapshot_yields_to_newer_one() {
        let registry = registry();
        let factory = RecordingFactory::new();
        registry
            .register(
                TaskConfigBuilder::new("sync-0").with_run_count(1).build(),
                factory.job_factory(),
            )
            .await
            .unwrap();
        registry.start_all().await.unwrap();
        assert!(wait_active(&registry, 0).await);

        let stale = registry.drain_retired().await;
        assert_eq!(stale.len(), 1);

        registry.reload().await.unwrap();
        assert!(wait_active(&registry, 0).await);
        registry.requeue_retired(stale).await;

        let retired = registry.drain_retired().await;
        assert_eq!(retired.len(), 1);
        assert_eq!(factory.created(), 2);
    }
}
