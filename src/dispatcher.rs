/// 分发器
///
/// 单个流的顶层入口：校验目标、创建 Link、按需嗅探、询问路由器、
/// 选择出站处理器并在独立任务中驱动出站一侧。
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::RequestContext;
use crate::destination::{Address, Destination};
use crate::error::{DispatchError, Result};
use crate::link::{link_pair, Link, DEFAULT_LINK_CAPACITY};
use crate::outbound::{OutboundHandler, OutboundManager};
use crate::routing::{Router, RoutingContext};
use crate::sniff::sniff_link;
use crate::stats::StatsManager;

/// 入站处理器依赖的分发能力
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// 为一个流创建 Link，返回入站一侧
    async fn dispatch(&self, ctx: Arc<RequestContext>, destination: Destination) -> Result<Link>;
}

#[derive(Clone)]
pub struct Dispatcher {
    outbounds: Arc<OutboundManager>,
    router: Arc<dyn Router>,
    stats: StatsManager,
}

impl Dispatcher {
    pub fn new(outbounds: Arc<OutboundManager>, router: Arc<dyn Router>, stats: StatsManager) -> Self {
        Self {
            outbounds,
            router,
            stats,
        }
    }

    pub fn outbounds(&self) -> &Arc<OutboundManager> {
        &self.outbounds
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }

    /// 询问路由器并解析出站处理器，返回 (处理器, 是否回退到默认)
    async fn resolve_outbound(
        &self,
        ctx: &RequestContext,
        target: &Destination,
    ) -> Result<(Arc<dyn OutboundHandler>, bool)> {
        let routing_ctx = RoutingContext {
            inbound_tag: ctx.inbound_tag().to_string(),
            source: ctx.source().cloned(),
            target: target.clone(),
            protocol: ctx.sniffed().map(|s| s.protocol_name().to_string()),
        };

        let fallback = match self.router.pick_route(&routing_ctx).await {
            Ok(decision) => match self.outbounds.get_handler(&decision.outbound_tag) {
                Some(handler) => {
                    debug!(
                        "Flow {} to {} routed to '{}'",
                        ctx.id(),
                        target,
                        decision.outbound_tag
                    );
                    return Ok((handler, false));
                }
                None => {
                    warn!(
                        "Outbound '{}' not found for flow {} to {}, falling back to default",
                        decision.outbound_tag,
                        ctx.id(),
                        target
                    );
                    true
                }
            },
            Err(e) if e.is_no_clue() => {
                debug!("No routing decision for {}, using default outbound", target);
                false
            }
            Err(e) => {
                warn!("Router failed for {}: {}, using default outbound", target, e);
                true
            }
        };

        self.outbounds
            .get_default_handler()
            .map(|handler| (handler, fallback))
            .ok_or_else(|| DispatchError::no_outbound(format!("no default outbound for {}", target)))
    }

    /// 在独立任务中驱动出站一侧；出错时中断两个方向
    fn spawn_outbound(
        &self,
        ctx: Arc<RequestContext>,
        handler: Arc<dyn OutboundHandler>,
        fallback: bool,
        link: Link,
        link_cancel: CancellationToken,
    ) {
        self.stats.record_dispatch(handler.tag(), fallback);
        tokio::spawn(async move {
            match handler.dispatch(ctx.clone(), link).await {
                Ok(()) => debug!("[{}] Flow {} finished", handler.tag(), ctx.id()),
                Err(e) if e.is_cancelled() => debug!("[{}] Flow {} cancelled", handler.tag(), ctx.id()),
                Err(e) => {
                    warn!("[{}] Flow {} failed: {}", handler.tag(), ctx.id(), e);
                    link_cancel.cancel();
                }
            }
        });
    }

    /// 路由并交给出站；失败时关闭 Link 的两端
    async fn route_and_spawn(
        &self,
        ctx: Arc<RequestContext>,
        target: Destination,
        link: Link,
        link_cancel: CancellationToken,
    ) -> Result<()> {
        match self.resolve_outbound(&ctx, &target).await {
            Ok((handler, fallback)) => {
                ctx.set_target(target);
                self.spawn_outbound(ctx, handler, fallback, link, link_cancel);
                Ok(())
            }
            Err(e) => {
                link_cancel.cancel();
                link.reader.close();
                link.writer.close();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, ctx: Arc<RequestContext>, destination: Destination) -> Result<Link> {
        if !destination.is_valid() {
            return Err(DispatchError::invalid_destination(destination.to_string()));
        }

        let link_cancel = ctx.cancel_token().child_token();
        let (inbound_link, outbound_link) = link_pair(DEFAULT_LINK_CAPACITY, &link_cancel);

        let skip_sniffing = destination.address.is_domain()
            || ctx.sniffing().is_empty()
            || ctx.allow_passive_connection();
        if skip_sniffing {
            self.route_and_spawn(ctx, destination, outbound_link, link_cancel)
                .await?;
            return Ok(inbound_link);
        }

        // 入站一侧可以立即开始写入，路由推迟到嗅探结束
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let candidates = ctx.sniffing().to_vec();
            let mut target = destination;
            match sniff_link(&outbound_link.reader, &candidates, &link_cancel).await {
                Ok(Some(result)) => {
                    if let Some(host) = result.domain() {
                        debug!("Flow {} target {} overridden by sniffed host {}", ctx.id(), target, host);
                        target = target.with_address(Address::parse(host));
                    }
                    ctx.set_sniffed(result);
                }
                Ok(None) => {}
                Err(e) if e.is_cancelled() => {
                    debug!("Flow {} cancelled while sniffing", ctx.id());
                    return;
                }
                Err(e) => debug!("Sniffing failed for flow {}: {}", ctx.id(), e),
            }

            if let Err(e) = dispatcher
                .route_and_spawn(ctx.clone(), target, outbound_link, link_cancel)
                .await
            {
                error!("Dropping flow {}: {}", ctx.id(), e);
            }
        });

        Ok(inbound_link)
    }
}
