//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, UdpSocket};
use tokio::time::timeout;

use traffic_dispatch::outbound::OutboundHandler;
use traffic_dispatch::routing::{Router, RoutingContext, RoutingDecision};
use traffic_dispatch::{Destination, Dispatcher, Link, OutboundManager, RequestContext, Result, StatsManager};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Find a base port with `count` consecutive ports free for TCP right now
pub fn get_available_port_range(count: u16) -> u16 {
    for _ in 0..32 {
        let base = get_available_port();
        if base.checked_add(count).is_none() {
            continue;
        }
        let all_free = (base..base + count).all(|port| TcpListener::bind(("127.0.0.1", port)).is_ok());
        if all_free {
            return base;
        }
    }
    panic!("Failed to find {} consecutive free ports", count);
}

/// Create a simple TCP echo server; the server half-closes after the client does
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo server addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Create a UDP echo server
pub async fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind UDP echo server");
    let addr = socket.local_addr().expect("Failed to get UDP echo server addr");

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });

    addr
}

/// 出站侧观察到的一个流
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub target: Option<Destination>,
    pub protocol: Option<String>,
    pub domain: Option<String>,
}

/// 记录每个流并把上行数据原样写回下行的出站
pub struct RecordingOutbound {
    tag: String,
    flows: Mutex<Vec<FlowRecord>>,
}

impl RecordingOutbound {
    pub fn new(tag: &str) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            flows: Mutex::new(Vec::new()),
        })
    }

    pub fn flows(&self) -> Vec<FlowRecord> {
        self.flows.lock().clone()
    }

    /// Wait until `count` flows have reached this outbound
    pub async fn wait_for_flows(&self, count: usize) -> Vec<FlowRecord> {
        timeout(Duration::from_secs(5), async {
            loop {
                let flows = self.flows();
                if flows.len() >= count {
                    return flows;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for flows")
    }
}

#[async_trait]
impl OutboundHandler for RecordingOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, ctx: Arc<RequestContext>, link: Link) -> Result<()> {
        self.flows.lock().push(FlowRecord {
            target: ctx.target().cloned(),
            protocol: ctx.sniffed().map(|s| s.protocol_name().to_string()),
            domain: ctx.sniffed().and_then(|s| s.domain()).map(|d| d.to_string()),
        });

        while let Some(chunks) = link.reader.read().await? {
            link.writer.write_multi(chunks).await?;
        }
        link.writer.close();
        Ok(())
    }
}

/// 总是返回同一个出站标签并记录路由上下文的路由器
pub struct FixedRouter {
    tag: String,
    seen: Mutex<Vec<RoutingContext>>,
}

impl FixedRouter {
    pub fn new(tag: &str) -> Arc<Self> {
        Arc::new(Self {
            tag: tag.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<RoutingContext> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Router for FixedRouter {
    async fn pick_route(&self, ctx: &RoutingContext) -> Result<RoutingDecision> {
        self.seen.lock().push(ctx.clone());
        Ok(RoutingDecision::new(self.tag.clone()))
    }
}

/// Build a dispatcher whose only (and default) outbound is `outbound`
pub fn build_dispatcher(outbound: Arc<dyn OutboundHandler>, router: Arc<dyn Router>) -> Arc<Dispatcher> {
    let manager = Arc::new(OutboundManager::new());
    manager.add_handler(outbound);
    Arc::new(Dispatcher::new(manager, router, StatsManager::new()))
}

/// Send one line over TCP and read the echoed reply
pub async fn tcp_roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = timeout(Duration::from_secs(5), tokio::net::TcpStream::connect(addr))
        .await
        .expect("Connect timed out")
        .expect("Failed to connect");
    stream.write_all(payload).await.expect("Failed to write");

    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Read timed out")
        .expect("Failed to read");
    buf
}
