/// 速率限制器模块
///
/// 使用 token bucket 算法限制单个入站接受新连接的速率
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;

/// 速率限制器包装器
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// 创建新的速率限制器（为 0 的参数按 1 处理，配置验证会提前拒绝它们）
    pub fn new(config: RateLimitConfig) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            config,
        }
    }

    /// 尝试获取一个令牌（非阻塞）
    /// 返回 Ok(()) 如果允许请求，否则返回 Err(Duration) 表示需要等待的时间
    pub fn check(&self) -> Result<(), Duration> {
        match self.inner.check() {
            Ok(_) => Ok(()),
            Err(not_until) => Err(not_until.wait_time_from(DefaultClock::default().now())),
        }
    }

    /// 异步等待直到可以获取令牌
    pub async fn wait(&self) {
        while let Err(wait_time) = self.check() {
            tokio::time::sleep(wait_time).await;
        }
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
