//! Inbound side: listening workers, port allocation and inbound protocols.
//!
//! A [`Worker`] owns one bound socket. An [`InboundHandler`] owns the workers
//! of one configured listener and decides which ports they bind. Accepted
//! flows are handed to an [`InboundProxy`], which talks to the client and
//! calls the dispatcher to obtain a [`Link`](crate::link::Link).

mod always;
mod dynamic;
mod forward;
mod handler;
mod manager;
mod tcp_worker;
mod transparent;
mod udp_worker;
mod worker;

pub use always::AlwaysOnInboundHandler;
pub use dynamic::{DynamicInboundHandler, MAX_PORT_PICK_ATTEMPTS, MAX_WORKER_START_RETRIES};
pub use forward::ForwardInbound;
pub use handler::InboundHandler;
pub use manager::InboundManager;
pub use tcp_worker::TcpWorker;
pub use udp_worker::{UdpConnection, UdpWorker, UDP_CLEANUP_INTERVAL, UDP_IDLE_TIMEOUT, UDP_QUEUE_SIZE};
pub use worker::{Worker, WorkerConfig, WorkerState};

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::context::RequestContext;
use crate::destination::Network;
use crate::dispatcher::Dispatch;
use crate::error::Result;
use crate::stats::InboundStatsTracker;

/// 入站连接：任何可读写的字节流（TCP 流、UDP 伪连接）
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 入站协议处理器
#[async_trait]
pub trait InboundProxy: Send + Sync {
    /// 该协议接受的网络
    fn networks(&self) -> Vec<Network>;

    /// 处理一个流；错误只终止这一个流
    async fn process(
        &self,
        ctx: Arc<RequestContext>,
        network: Network,
        conn: Box<dyn Connection>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Result<()>;
}

/// 统计收发字节数的连接包装
pub struct TrackedConnection<C> {
    inner: C,
    tracker: InboundStatsTracker,
}

impl<C> TrackedConnection<C> {
    pub fn new(inner: C, tracker: InboundStatsTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for TrackedConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            self.tracker.add_uplink_bytes(n as u64);
        }
        result
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for TrackedConnection<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.tracker.add_downlink_bytes(n as u64);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
