use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Connection, InboundProxy};
use crate::context::RequestContext;
use crate::destination::{Destination, Network};
use crate::dispatcher::Dispatch;
use crate::error::{DispatchError, Result};
use crate::link::{copy_from_link, copy_to_link, Link};

/// 端口转发入站
///
/// 不解析任何协议：每个流都发往固定目标，或在开启
/// `receive_original_destination` 时发往透明代理恢复出的原始目标。
pub struct ForwardInbound {
    destination: Option<Destination>,
    networks: Vec<Network>,
    follow_redirect: bool,
}

impl ForwardInbound {
    pub fn new(destination: Option<Destination>, networks: Vec<Network>, follow_redirect: bool) -> Self {
        Self {
            destination,
            networks,
            follow_redirect,
        }
    }

    fn target_for(&self, ctx: &RequestContext, network: Network) -> Result<Destination> {
        let base = if self.follow_redirect {
            ctx.original_target().or(self.destination.as_ref())
        } else {
            self.destination.as_ref()
        };

        match base {
            Some(dest) => Ok(Destination::new(network, dest.address.clone(), dest.port)),
            None => Err(DispatchError::invalid_destination(format!(
                "no destination for flow {}",
                ctx.id()
            ))),
        }
    }
}

#[async_trait]
impl InboundProxy for ForwardInbound {
    fn networks(&self) -> Vec<Network> {
        self.networks.clone()
    }

    async fn process(
        &self,
        ctx: Arc<RequestContext>,
        network: Network,
        conn: Box<dyn Connection>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Result<()> {
        let target = self.target_for(&ctx, network)?;
        let Link { reader, writer } = dispatcher.dispatch(ctx.clone(), target).await?;

        let (mut conn_reader, mut conn_writer) = tokio::io::split(conn);
        let uplink = async {
            let r = copy_to_link(&mut conn_reader, &writer).await;
            writer.close();
            r
        };
        let downlink = async {
            let r = copy_from_link(&reader, &mut conn_writer).await;
            reader.close();
            r
        };

        let (up, down) = tokio::join!(uplink, downlink);
        debug!(
            "Flow {} forwarded: {:?} bytes up, {:?} bytes down",
            ctx.id(),
            up.as_ref().ok(),
            down.as_ref().ok()
        );
        up?;
        down?;
        Ok(())
    }
}
