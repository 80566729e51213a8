use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::OutboundHandler;
use crate::context::RequestContext;
use crate::error::Result;
use crate::link::Link;

/// 黑洞出站：不读取任何数据，直接关闭 Link
pub struct BlockOutbound {
    tag: String,
}

impl BlockOutbound {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl OutboundHandler for BlockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, ctx: Arc<RequestContext>, link: Link) -> Result<()> {
        debug!("[{}] Flow {} blocked", self.tag, ctx.id());
        link.reader.close();
        link.writer.close();
        Ok(())
    }
}
