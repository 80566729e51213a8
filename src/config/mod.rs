// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

pub use builder::InboundConfigBuilder;
pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::destination::{Destination, Network};
use crate::sniff::SniffProtocol;

/// 动态分配默认并发 Worker 数
pub const DEFAULT_CONCURRENCY: u32 = 3;

/// 动态分配默认刷新间隔（分钟）
pub const DEFAULT_REFRESH_MINUTES: u32 = 5;

/// 端口范围（闭区间）
///
/// 配置中可以写成单个端口 `8080` 或字符串 `"10000-10002"`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn new(from: u16, to: u16) -> Self {
        Self { from, to }
    }

    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    /// 范围内端口数量（from > to 时为 0）
    pub fn len(&self) -> u32 {
        if self.from > self.to {
            0
        } else {
            u32::from(self.to) - u32::from(self.from) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.from && port <= self.to
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.from..=self.to
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}' in range '{}'", v.trim(), s))
        };
        match s.split_once('-') {
            Some((from, to)) => Ok(Self::new(parse(from)?, parse(to)?)),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.from == self.to {
            serializer.serialize_u16(self.from)
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Port(u16),
            Range(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Port(port) => Ok(PortRange::single(port)),
            Raw::Range(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// 端口分配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// 范围内每个端口一个 Worker
    #[default]
    Always,
    /// 在范围内随机选择端口并定期轮换
    Random,
}

/// 端口分配配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default)]
    pub strategy: AllocationStrategy,
    /// 仅 random 策略：同时存活的 Worker 数
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// 仅 random 策略：刷新间隔（分钟）
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: u32,
}

fn default_concurrency() -> u32 {
    DEFAULT_CONCURRENCY
}

fn default_refresh_minutes() -> u32 {
    DEFAULT_REFRESH_MINUTES
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::Always,
            concurrency: DEFAULT_CONCURRENCY,
            refresh_minutes: DEFAULT_REFRESH_MINUTES,
        }
    }
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量（允许短时间内的峰值连接数）
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 200,
        }
    }
}

/// 入站协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InboundProtocol {
    /// 端口转发：所有流发往固定目标（或透明代理的原始目标）
    #[default]
    Forward,
}

/// 入站配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// 入站标签（可选，用于路由规则）
    #[serde(default)]
    pub tag: String,
    /// 监听地址
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 监听端口范围
    pub port_range: PortRange,
    #[serde(default)]
    pub protocol: InboundProtocol,
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// 嗅探候选协议（为空表示不嗅探）
    #[serde(default)]
    pub sniffing: Vec<SniffProtocol>,
    /// 恢复透明代理重定向前的原始目标
    #[serde(default)]
    pub receive_original_destination: bool,
    /// 跳过嗅探，立即分发
    #[serde(default)]
    pub allow_passive_connection: bool,
    /// forward 协议的固定目标
    #[serde(default)]
    pub destination: Option<Destination>,
    /// 入站接受的网络
    #[serde(default = "default_networks")]
    pub network: Vec<Network>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_networks() -> Vec<Network> {
    vec![Network::Tcp]
}

impl InboundConfig {
    /// 创建 Builder
    pub fn builder() -> InboundConfigBuilder {
        InboundConfigBuilder::new()
    }
}

/// 出站协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundProtocol {
    Direct,
    #[serde(alias = "blackhole")]
    Block,
}

/// 出站配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: OutboundProtocol,
}

/// 路由规则：所有非空条件都满足时命中
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub inbound_tags: Vec<String>,
    /// 嗅探出的协议
    #[serde(default)]
    pub protocols: Vec<SniffProtocol>,
    #[serde(default)]
    pub networks: Vec<Network>,
    pub outbound_tag: String,
}

/// 路由配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    /// 默认出站标签（未设置时使用第一个出站）
    #[serde(default)]
    pub default_outbound: Option<String>,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// 日志级别（命令行 --log-level 优先）
    #[serde(default)]
    pub level: Option<String>,
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl AppConfig {
    /// 从 TOML 字符串解析并验证
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_app_config(self)
    }
}
