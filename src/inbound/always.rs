use futures::future::join_all;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::{info, warn};

use super::{InboundProxy, Worker, WorkerConfig};
use crate::config::PortRange;
use crate::destination::Network;
use crate::error::Result;

/// 固定端口分配：范围内每个端口、每种网络各一个 Worker
pub struct AlwaysOnInboundHandler {
    tag: String,
    proxy: Arc<dyn InboundProxy>,
    workers: Vec<Worker>,
}

impl AlwaysOnInboundHandler {
    /// `template` 的端口会被范围内的每个端口替换
    pub fn new(range: PortRange, template: WorkerConfig) -> Self {
        let proxy = template.proxy.clone();
        let networks = proxy.networks();

        let mut workers = Vec::with_capacity(range.len() as usize * networks.len());
        for port in range.iter() {
            if networks.contains(&Network::Tcp) {
                workers.push(Worker::new(Network::Tcp, template.with_port(port)));
            }
            if networks.contains(&Network::Udp) {
                workers.push(Worker::new(Network::Udp, template.with_port(port)));
            }
        }

        Self {
            tag: template.tag,
            proxy,
            workers,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn proxy(&self) -> Arc<dyn InboundProxy> {
        self.proxy.clone()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// 启动所有 Worker，遇到第一个错误即停止并关闭已启动的 Worker
    pub async fn start(&self) -> Result<()> {
        for (index, worker) in self.workers.iter().enumerate() {
            if let Err(e) = worker.start().await {
                warn!(
                    "[{}] Failed to start {} worker on port {}: {}",
                    self.tag,
                    worker.network(),
                    worker.port(),
                    e
                );
                for started in &self.workers[..index] {
                    started.close().await;
                }
                return Err(e);
            }
        }
        info!("[{}] Started {} worker(s)", self.tag, self.workers.len());
        Ok(())
    }

    /// 并发关闭所有 Worker
    pub async fn close(&self) {
        join_all(self.workers.iter().map(|w| w.close())).await;
    }

    /// 随机挑选一个 (入站协议, 端口)；不在分发路径上使用
    pub fn get_random_inbound_proxy(&self) -> Option<(Arc<dyn InboundProxy>, u16)> {
        self.workers
            .choose(&mut rand::rng())
            .map(|w| (w.proxy(), w.port()))
    }
}
