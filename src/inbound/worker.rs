use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::{InboundProxy, TcpWorker, UdpWorker};
use crate::destination::Network;
use crate::dispatcher::Dispatch;
use crate::error::Result;
use crate::rate_limiter::RateLimiter;
use crate::sniff::SniffProtocol;
use crate::stats::InboundStatsTracker;

/// Worker 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Closing,
    Closed,
}

/// 创建 Worker 所需的全部参数
#[derive(Clone)]
pub struct WorkerConfig {
    pub tag: String,
    pub address: IpAddr,
    pub port: u16,
    pub proxy: Arc<dyn InboundProxy>,
    pub dispatcher: Arc<dyn Dispatch>,
    pub sniffing: Vec<SniffProtocol>,
    pub receive_original_destination: bool,
    pub allow_passive_connection: bool,
    pub stats: InboundStatsTracker,
    pub rate_limiter: Option<RateLimiter>,
}

impl WorkerConfig {
    /// 同一配置换一个端口
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// 一个绑定的监听资源
pub enum Worker {
    Tcp(TcpWorker),
    Udp(UdpWorker),
}

impl Worker {
    /// 按网络类型创建 Worker
    pub fn new(network: Network, config: WorkerConfig) -> Self {
        match network {
            Network::Tcp => Worker::Tcp(TcpWorker::new(config)),
            Network::Udp => Worker::Udp(UdpWorker::new(config)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            Worker::Tcp(w) => w.start().await,
            Worker::Udp(w) => w.start().await,
        }
    }

    /// 关闭并等待套接字释放
    pub async fn close(&self) {
        match self {
            Worker::Tcp(w) => w.close().await,
            Worker::Udp(w) => w.close().await,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Worker::Tcp(w) => w.port(),
            Worker::Udp(w) => w.port(),
        }
    }

    pub fn proxy(&self) -> Arc<dyn InboundProxy> {
        match self {
            Worker::Tcp(w) => w.proxy(),
            Worker::Udp(w) => w.proxy(),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            Worker::Tcp(_) => Network::Tcp,
            Worker::Udp(_) => Network::Udp,
        }
    }

    pub fn state(&self) -> WorkerState {
        match self {
            Worker::Tcp(w) => w.state(),
            Worker::Udp(w) => w.state(),
        }
    }

    /// 实际绑定的地址（启动后才有）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Worker::Tcp(w) => w.local_addr(),
            Worker::Udp(w) => w.local_addr(),
        }
    }
}
