//! 测试辅助工具

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// 测试环境工具
pub struct TestEnv;

impl TestEnv {
    /// 轮询等待条件成立，超时返回 false
    ///
    /// 使用 tokio 时钟，在 `start_paused` 的测试中同样适用。
    pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(10)).await
    }

    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(poll_interval).await;
        }
        condition().await
    }

    /// 初始化测试日志（每个测试二进制调用一次即可）
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

/// 由键值对构造属性集
pub fn property_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
