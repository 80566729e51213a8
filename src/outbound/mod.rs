/// 出站处理器
///
/// 出站处理器驱动 Link 的出站一侧：从上行读取入站数据并发往目标，
/// 把目标返回的数据写入下行。
mod block;
mod direct;
mod manager;

pub use block::BlockOutbound;
pub use direct::DirectOutbound;
pub use manager::OutboundManager;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{OutboundConfig, OutboundProtocol};
use crate::context::RequestContext;
use crate::error::Result;
use crate::link::Link;

#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    /// 驱动一个流的出站侧，直到两个方向都结束
    async fn dispatch(&self, ctx: Arc<RequestContext>, link: Link) -> Result<()>;
}

/// 根据配置创建内置出站处理器
pub fn build_outbound(config: &OutboundConfig) -> Arc<dyn OutboundHandler> {
    match config.protocol {
        OutboundProtocol::Direct => Arc::new(DirectOutbound::new(config.tag.clone())),
        OutboundProtocol::Block => Arc::new(BlockOutbound::new(config.tag.clone())),
    }
}
