//! 冲突重试
//!
//! 对 "读取-修改-写入" 过程整体重试：只有乐观并发冲突才会触发重试，
//! 其他错误立即返回。传入的操作必须只依赖它自己观察到的状态，才能安全地重复执行。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// 冲突重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 初始间隔
    pub initial_delay: Duration,
    /// 最大间隔
    pub max_delay: Duration,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 不等待的配置，便于测试
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// 遇到冲突时以指数退避重试整个操作
///
/// 冲突次数耗尽后返回最后一次冲突错误。
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match f().await {
            Err(e) if e.is_conflict() && attempt < config.max_attempts.max(1) => {
                // 抖动范围 0.5x ~ 1.5x
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(operation, attempt, delay_ms = sleep_for.as_millis() as u64, "资源版本冲突，重试");
                tokio::time::sleep(sleep_for).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(operation, attempt, "冲突重试次数耗尽: {}", e);
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}
