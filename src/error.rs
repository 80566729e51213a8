/// 自定义错误类型
///
/// 使用 thiserror 定义分发引擎的错误分类，调用者可以据此区分
/// 配置错误、单个流的瞬时错误、资源耗尽与正常的取消信号
use std::io;
use thiserror::Error;

/// 分发引擎的主要错误类型
#[derive(Error, Debug)]
pub enum DispatchError {
    /// 目标地址无效（地址或端口缺失）
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// 没有可用的出站处理器（包括默认处理器）
    #[error("No outbound handler available: {0}")]
    NoOutbound(String),

    /// 路由器无法给出决定，调用方应使用默认出站
    #[error("No routing decision")]
    NoClue,

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 监听端口绑定失败
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 资源耗尽（端口分配失败等）
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// 流被取消（不是真正的 I/O 故障）
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// 创建无效目标错误
    pub fn invalid_destination(msg: impl Into<String>) -> Self {
        Self::InvalidDestination(msg.into())
    }

    /// 创建无出站错误
    pub fn no_outbound(msg: impl Into<String>) -> Self {
        Self::NoOutbound(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建绑定失败错误
    pub fn bind_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// 创建资源耗尽错误
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// 检查是否为取消信号
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 检查是否为 "无路由决定"
    pub fn is_no_clue(&self) -> bool {
        matches!(self, Self::NoClue)
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
