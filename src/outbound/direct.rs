use async_trait::async_trait;
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use super::OutboundHandler;
use crate::context::RequestContext;
use crate::destination::{Destination, Network};
use crate::error::{DispatchError, Result};
use crate::link::{copy_from_link, copy_to_link, Link};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const UDP_RECV_BUFFER_SIZE: usize = 64 * 1024;

/// 直连出站：按最终目标直接拨号（域名由系统解析器解析）
pub struct DirectOutbound {
    tag: String,
}

impl DirectOutbound {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }

    async fn dial_tcp(&self, target: &Destination) -> Result<TcpStream> {
        let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target.host_port())).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", target),
                )
                .into())
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] Failed to set TCP_NODELAY: {}", self.tag, e);
        }
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("[{}] Failed to set TCP keepalive on {}: {}", self.tag, target, e);
        }
        Ok(stream)
    }

    async fn relay_tcp(&self, ctx: &RequestContext, target: &Destination, link: Link) -> Result<()> {
        let stream = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return Err(DispatchError::Cancelled),
            r = self.dial_tcp(target) => r?,
        };
        debug!("[{}] Flow {} connected to {}", self.tag, ctx.id(), target);

        let (mut read_half, mut write_half) = stream.into_split();
        let Link { reader, writer } = link;

        let uplink = async {
            let r = copy_from_link(&reader, &mut write_half).await;
            reader.close();
            r
        };
        let downlink = async {
            let r = copy_to_link(&mut read_half, &writer).await;
            writer.close();
            r
        };

        let (up, down) = tokio::join!(uplink, downlink);
        let up = up?;
        let down = down?;
        debug!(
            "[{}] Flow {} finished: {} bytes up, {} bytes down",
            self.tag,
            ctx.id(),
            up,
            down
        );
        Ok(())
    }

    async fn relay_udp(&self, ctx: &RequestContext, target: &Destination, link: Link) -> Result<()> {
        let peer = match target.socket_addr() {
            Some(addr) => addr,
            None => tokio::net::lookup_host(target.host_port())
                .await?
                .next()
                .ok_or_else(|| DispatchError::invalid_destination(format!("cannot resolve {}", target)))?,
        };
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        debug!("[{}] Flow {} relaying datagrams to {}", self.tag, ctx.id(), peer);

        let Link { reader, writer } = link;

        // 每个分块对应一个数据报
        let uplink = async {
            while let Some(chunks) = reader.read().await? {
                for chunk in chunks {
                    socket.send(&chunk).await?;
                }
            }
            Ok::<_, DispatchError>(())
        };
        let downlink = async {
            let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
            let result: Result<()> = loop {
                let n = match socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                if let Err(e) = writer.write(Bytes::copy_from_slice(&buf[..n])).await {
                    break Err(e);
                }
            };
            result
        };

        // UDP 没有 EOF：上行结束后仍继续接收，直到流被取消
        let result = tokio::select! {
            _ = ctx.cancel_token().cancelled() => Ok(()),
            r = async { tokio::try_join!(uplink, downlink).map(|_| ()) } => r,
        };
        writer.close();
        reader.close();
        match result {
            Err(e) if e.is_cancelled() => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, ctx: Arc<RequestContext>, link: Link) -> Result<()> {
        let target = ctx
            .target()
            .cloned()
            .ok_or_else(|| DispatchError::invalid_destination("flow has no target"))?;

        match target.network {
            Network::Tcp => self.relay_tcp(&ctx, &target, link).await,
            Network::Udp => self.relay_udp(&ctx, &target, link).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_direct_tcp_relay_with_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(&request).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let cancel = CancellationToken::new();
        let ctx = Arc::new(RequestContext::new("in", cancel.clone()));
        ctx.set_target(Destination::from_socket_addr(Network::Tcp, addr));

        let (inbound, outbound) = link_pair(1024, &cancel);
        let handler = DirectOutbound::new("direct".to_string());
        let task = tokio::spawn(async move { handler.dispatch(ctx, outbound).await });

        inbound.writer.write(Bytes::from_static(b"hello")).await.unwrap();
        inbound.writer.close();

        let mut echoed = Vec::new();
        while let Some(chunks) = inbound.reader.read().await.unwrap() {
            for c in chunks {
                echoed.extend_from_slice(&c);
            }
        }
        assert_eq!(echoed, b"hello");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_direct_udp_relay() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let ctx = Arc::new(RequestContext::new("in", cancel.clone()));
        ctx.set_target(Destination::from_socket_addr(Network::Udp, addr));

        let (inbound, outbound) = link_pair(1024, &cancel);
        let handler = DirectOutbound::new("direct".to_string());
        let task = tokio::spawn(async move { handler.dispatch(ctx, outbound).await });

        inbound.writer.write(Bytes::from_static(b"ping")).await.unwrap();
        let reply = inbound.reader.read().await.unwrap().unwrap();
        assert_eq!(reply.concat(), b"ping");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_target() {
        let cancel = CancellationToken::new();
        let ctx = Arc::new(RequestContext::new("in", cancel.clone()));
        let (_inbound, outbound) = link_pair(1024, &cancel);
        let err = DirectOutbound::new("direct".to_string())
            .dispatch(ctx, outbound)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidDestination(_)));
    }
}
