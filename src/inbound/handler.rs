use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{AlwaysOnInboundHandler, DynamicInboundHandler, ForwardInbound, InboundProxy, WorkerConfig};
use crate::config::{AllocationStrategy, InboundConfig, InboundProtocol};
use crate::dispatcher::Dispatch;
use crate::error::{DispatchError, Result};
use crate::rate_limiter::RateLimiter;
use crate::stats::StatsManager;

/// 一个配置入站的全部 Worker，按端口分配策略区分
pub enum InboundHandler {
    AlwaysOn(AlwaysOnInboundHandler),
    Dynamic(DynamicInboundHandler),
}

impl InboundHandler {
    /// 根据入站配置创建处理器（不绑定端口，`start` 时才绑定）
    pub fn from_config(config: &InboundConfig, dispatcher: Arc<dyn Dispatch>, stats: &StatsManager) -> Result<Self> {
        let address: IpAddr = config.listen.parse().map_err(|_| {
            DispatchError::config_error(format!("[{}] invalid listen address '{}'", config.tag, config.listen))
        })?;
        if config.port_range.is_empty() {
            return Err(DispatchError::config_error(format!(
                "[{}] empty port range {}",
                config.tag, config.port_range
            )));
        }

        let proxy: Arc<dyn InboundProxy> = match config.protocol {
            InboundProtocol::Forward => Arc::new(ForwardInbound::new(
                config.destination.clone(),
                config.network.clone(),
                config.receive_original_destination,
            )),
        };

        let template = WorkerConfig {
            tag: config.tag.clone(),
            address,
            port: config.port_range.from,
            proxy,
            dispatcher,
            sniffing: config.sniffing.clone(),
            receive_original_destination: config.receive_original_destination,
            allow_passive_connection: config.allow_passive_connection,
            stats: stats.register_inbound(&config.tag),
            rate_limiter: config.rate_limit.clone().map(RateLimiter::new),
        };

        let handler = match config.allocation.strategy {
            AllocationStrategy::Always => Self::AlwaysOn(AlwaysOnInboundHandler::new(config.port_range, template)),
            AllocationStrategy::Random => {
                let allocation = &config.allocation;
                if allocation.concurrency == 0 || allocation.concurrency > config.port_range.len() {
                    return Err(DispatchError::config_error(format!(
                        "[{}] concurrency {} does not fit port range {}",
                        config.tag, allocation.concurrency, config.port_range
                    )));
                }
                let refresh = Duration::from_secs(u64::from(allocation.refresh_minutes.max(1)) * 60);
                Self::Dynamic(DynamicInboundHandler::new(
                    config.port_range,
                    allocation.concurrency as usize,
                    refresh,
                    template,
                ))
            }
        };
        Ok(handler)
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::AlwaysOn(h) => h.tag(),
            Self::Dynamic(h) => h.tag(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            Self::AlwaysOn(h) => h.start().await,
            Self::Dynamic(h) => h.start().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::AlwaysOn(h) => h.close().await,
            Self::Dynamic(h) => h.close().await,
        }
    }

    pub fn get_random_inbound_proxy(&self) -> Option<(Arc<dyn InboundProxy>, u16)> {
        match self {
            Self::AlwaysOn(h) => h.get_random_inbound_proxy(),
            Self::Dynamic(h) => h.get_random_inbound_proxy(),
        }
    }
}
