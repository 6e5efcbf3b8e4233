#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Days, Local};
    use tokio::time::Instant;

    use scheduler_dispatcher::{SharedExecutor, TaskEngine};
    use scheduler_domain::{EngineState, TaskConfig};
    use scheduler_testing_utils::{RecordingJob, TaskConfigBuilder, TestEnv};

    fn engine(config: TaskConfig, job: Arc<RecordingJob>) -> Arc<TaskEngine> {
        let executor = SharedExecutor::current().unwrap();
        Arc::new(TaskEngine::new(config, job, executor).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_run_count_executes_exactly_n_times() {
        let job = Arc::new(RecordingJob::new());
        let config = TaskConfigBuilder::new("bounded-0")
            .with_interval_millis(1000)
            .with_run_count(4)
            .build();
        let engine = engine(config, job.clone());

        let started = Instant::now();
        engine.clone().run(None).await;
        let elapsed = started.elapsed();

        assert_eq!(job.execute_count(), 4);
        assert_eq!(job.before_count(), 4);
        assert_eq!(job.after_count(), 4);
        assert_eq!(job.destroy_count(), 1);
        // 最后一次执行后不再等待
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.state, EngineState::Closed);
        assert_eq!(snapshot.cycle_count, 4);
        assert_eq!(snapshot.stats.cycles, 4);
        assert!(!snapshot.marked_for_removal);
        assert!(engine.is_finished());
    }

    #[tokio::test]
    async fn test_close_interrupts_long_sleep() {
        let job = Arc::new(RecordingJob::new());
        let config = TaskConfigBuilder::new("sleepy-0")
            .with_interval_millis(3_600_000)
            .build();
        let engine = engine(config, job.clone());
        let handle = tokio::spawn(engine.clone().run(None));

        let job_ref = job.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let job = job_ref.clone();
                    async move { job.execute_count() == 1 }
                },
                Duration::from_secs(5),
            )
            .await
        );
        assert_eq!(engine.state().await, EngineState::Running);

        let started = std::time::Instant::now();
        engine.close(true).await;
        tokio::time::timeout(Duration::from_secs(2), engine.wait_closed())
            .await
            .expect("engine should exit promptly");
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.await.unwrap();

        assert_eq!(job.execute_count(), 1);
        assert_eq!(job.destroy_count(), 1);
        assert!(engine.snapshot().await.is_removed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_before_after_once_across_cycles() {
        let job = Arc::new(RecordingJob::new());
        let config = TaskConfigBuilder::new("once-0")
            .with_interval_millis(1000)
            .with_run_count(5)
            .before_after_once()
            .build();
        let engine = engine(config, job.clone());
        engine.clone().run(None).await;

        assert_eq!(job.before_count(), 1);
        assert_eq!(job.execute_count(), 5);
        assert_eq!(job.after_count(), 1);
        assert_eq!(job.destroy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_runs_even_when_before_fails() {
        let job = Arc::new(RecordingJob::new().failing_before());
        let config = TaskConfigBuilder::new("stubborn-0")
            .with_interval_millis(1000)
            .with_run_count(3)
            .before_after_once()
            .build();
        let engine = engine(config, job.clone());
        engine.clone().run(None).await;

        // before 直到成功前每个周期都会重试，execute 照常执行
        assert_eq!(job.before_count(), 3);
        assert_eq!(job.execute_count(), 3);
        assert_eq!(job.after_count(), 1);

        let stats = engine.snapshot().await.stats;
        assert_eq!(stats.before_failures, 3);
        assert_eq!(stats.execute_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_failure_backs_off_and_continues() {
        let job = Arc::new(RecordingJob::new().failing_execute());
        let config = TaskConfigBuilder::new("flaky-0")
            .with_interval_millis(1000)
            .with_run_count(2)
            .build();
        let engine = engine(config, job.clone());

        let started = Instant::now();
        engine.clone().run(None).await;
        let elapsed = started.elapsed();

        assert_eq!(job.before_count(), 2);
        assert_eq!(job.execute_count(), 2);
        assert_eq!(job.after_count(), 2);
        // 两次100ms退避加一次1s间隔
        assert!(elapsed >= Duration::from_millis(1200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1300), "{elapsed:?}");

        let stats = engine.snapshot().await.stats;
        assert_eq!(stats.execute_failures, 2);
        assert_eq!(stats.total_failures(), 2);
        assert_eq!(stats.cycles, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_start_waits_before_first_cycle() {
        let job = Arc::new(RecordingJob::new());
        let config = TaskConfigBuilder::new("lazy-0")
            .with_interval_millis(500)
            .with_run_count(1)
            .lazy()
            .build();
        let engine = engine(config, job.clone());

        let started = Instant::now();
        engine.clone().run(None).await;

        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(job.execute_count(), 1);
    }

    #[tokio::test]
    async fn test_noon_cron_delay() {
        let job = Arc::new(RecordingJob::new());
        let config = TaskConfigBuilder::new("noon-0")
            .with_interval_millis(0)
            .with_cron("0 0 12 * * ?")
            .build();
        let engine = engine(config, job);

        let now = Local::now();
        let noon_on = |days: u64| {
            (now.date_naive() + Days::new(days))
                .and_hms_opt(12, 0, 0)
                .unwrap()
                .and_local_timezone(Local)
                .earliest()
                .unwrap()
        };
        let today = noon_on(0);
        let expected_next = if today > now { today } else { noon_on(1) };
        let expected = (expected_next - now).to_std().unwrap();

        let delay = engine.next_delay(now).unwrap();
        let diff = if delay > expected {
            delay - expected
        } else {
            expected - delay
        };
        assert!(diff < Duration::from_secs(1), "{delay:?} vs {expected:?}");
        assert_eq!(engine.initial_delay(now).unwrap(), None);
    }

    #[tokio::test]
    async fn test_executor_shutdown_stops_loop() {
        let job = Arc::new(RecordingJob::new());
        let executor = SharedExecutor::current().unwrap();
        let config = TaskConfigBuilder::new("stop-0").with_interval_millis(20).build();
        let engine = Arc::new(TaskEngine::new(config, job.clone(), executor.clone()).unwrap());
        let handle = tokio::spawn(engine.clone().run(None));

        let job_ref = job.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let job = job_ref.clone();
                    async move { job.execute_count() >= 2 }
                },
                Duration::from_secs(5),
            )
            .await
        );

        executor.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("engine should observe executor shutdown")
            .unwrap();
        assert_eq!(engine.state().await, EngineState::Closed);
        assert_eq!(job.destroy_count(), 1);
        // 不是注册表发起的关闭
        assert!(!engine.snapshot().await.marked_for_removal);
    }
}
