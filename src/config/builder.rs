use anyhow::{Context, Result};

use crate::destination::{Destination, Network};
use crate::sniff::SniffProtocol;

use super::{
    validator::ConfigValidator, AllocationConfig, AllocationStrategy, InboundConfig,
    InboundProtocol, PortRange, RateLimitConfig,
};

/// InboundConfig Builder
#[derive(Debug, Default)]
pub struct InboundConfigBuilder {
    tag: Option<String>,
    listen: Option<String>,
    port_range: Option<PortRange>,
    allocation: AllocationConfig,
    sniffing: Vec<SniffProtocol>,
    receive_original_destination: bool,
    allow_passive_connection: bool,
    destination: Option<Destination>,
    network: Option<Vec<Network>>,
    rate_limit: Option<RateLimitConfig>,
}

impl InboundConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置入站标签
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// 设置监听地址
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    /// 设置端口范围
    pub fn port_range(mut self, range: PortRange) -> Self {
        self.port_range = Some(range);
        self
    }

    /// 使用随机端口分配
    pub fn random_allocation(mut self, concurrency: u32, refresh_minutes: u32) -> Self {
        self.allocation = AllocationConfig {
            strategy: AllocationStrategy::Random,
            concurrency,
            refresh_minutes,
        };
        self
    }

    /// 设置嗅探候选协议
    pub fn sniffing(mut self, candidates: Vec<SniffProtocol>) -> Self {
        self.sniffing = candidates;
        self
    }

    pub fn receive_original_destination(mut self, enable: bool) -> Self {
        self.receive_original_destination = enable;
        self
    }

    pub fn allow_passive_connection(mut self, allow: bool) -> Self {
        self.allow_passive_connection = allow;
        self
    }

    /// 设置转发目标
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// 设置接受的网络
    pub fn network(mut self, network: Vec<Network>) -> Self {
        self.network = Some(network);
        self
    }

    /// 设置速率限制
    pub fn rate_limit(mut self, requests_per_second: u32, burst_size: u32) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            requests_per_second,
            burst_size,
        });
        self
    }

    /// 构建 InboundConfig 并验证
    pub fn build(self) -> Result<InboundConfig> {
        let config = InboundConfig {
            tag: self.tag.unwrap_or_default(),
            listen: self.listen.unwrap_or_else(|| "127.0.0.1".to_string()),
            port_range: self.port_range.context("port_range is required")?,
            protocol: InboundProtocol::Forward,
            allocation: self.allocation,
            sniffing: self.sniffing,
            receive_original_destination: self.receive_original_destination,
            allow_passive_connection: self.allow_passive_connection,
            destination: self.destination,
            network: self.network.unwrap_or_else(|| vec![Network::Tcp]),
            rate_limit: self.rate_limit,
        };

        // 验证配置
        ConfigValidator::validate_inbound(&config)?;

        Ok(config)
    }
}
