use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InboundProxy, Worker, WorkerConfig};
use crate::config::PortRange;
use crate::destination::Network;
use crate::error::{DispatchError, Result};

/// 随机选择一个空闲端口时的最大尝试次数（之后退化为扫描空闲端口）
pub const MAX_PORT_PICK_ATTEMPTS: usize = 64;

/// 单个槽位启动失败后的最大重试次数（每次换一个端口）
pub const MAX_WORKER_START_RETRIES: usize = 3;

const START_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// 同一端口上按网络划分的一组 Worker
struct PortWorkers {
    port: u16,
    workers: Vec<Worker>,
}

impl PortWorkers {
    async fn start(&self) -> Result<()> {
        for (index, worker) in self.workers.iter().enumerate() {
            if let Err(e) = worker.start().await {
                for started in &self.workers[..index] {
                    started.close().await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        join_all(self.workers.iter().map(|w| w.close())).await;
    }
}

struct DynamicInner {
    tag: String,
    range: PortRange,
    concurrency: usize,
    refresh_interval: Duration,
    template: WorkerConfig,
    networks: Vec<Network>,
    live: Mutex<Vec<Arc<PortWorkers>>>,
    recycle: Mutex<Vec<Arc<PortWorkers>>>,
    /// 存活和待回收 Worker 占用的端口
    ports_in_use: Mutex<HashSet<u16>>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl DynamicInner {
    fn allocate_port(&self) -> Option<u16> {
        let mut in_use = self.ports_in_use.lock();
        let mut rng = rand::rng();

        for _ in 0..MAX_PORT_PICK_ATTEMPTS {
            let port = rng.random_range(self.range.from..=self.range.to);
            if in_use.insert(port) {
                return Some(port);
            }
        }

        let free: Vec<u16> = self.range.iter().filter(|p| !in_use.contains(p)).collect();
        let port = *free.choose(&mut rng)?;
        in_use.insert(port);
        Some(port)
    }

    fn release_port(&self, port: u16) {
        self.ports_in_use.lock().remove(&port);
    }

    fn build_workers(&self, port: u16) -> PortWorkers {
        let workers = self
            .networks
            .iter()
            .map(|network| Worker::new(*network, self.template.with_port(port)))
            .collect();
        PortWorkers { port, workers }
    }

    /// 为一个槽位分配端口并启动，失败时换端口重试
    async fn start_slot(&self) -> Option<Arc<PortWorkers>> {
        for attempt in 1..=MAX_WORKER_START_RETRIES {
            let Some(port) = self.allocate_port() else {
                warn!("[{}] No free port left in {}", self.tag, self.range);
                return None;
            };

            let group = self.build_workers(port);
            match group.start().await {
                Ok(()) => return Some(Arc::new(group)),
                Err(e) => {
                    warn!(
                        "[{}] Failed to start worker on port {} (attempt {}/{}): {}",
                        self.tag, port, attempt, MAX_WORKER_START_RETRIES, e
                    );
                    self.release_port(port);
                    tokio::time::sleep(START_RETRY_BACKOFF * attempt as u32).await;
                }
            }
        }
        None
    }

    async fn refresh(&self) -> Result<()> {
        let _serial = self.refresh_lock.lock().await;

        // 新一代启动期间上一代照常服务，它的端口仍然计为占用
        let mut started = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            if let Some(group) = self.start_slot().await {
                started.push(group);
            }
        }

        if started.is_empty() {
            return Err(DispatchError::resource_exhausted(format!(
                "[{}] no worker could be started in {}",
                self.tag, self.range
            )));
        }
        if started.len() < self.concurrency {
            warn!(
                "[{}] Only {}/{} workers started in this generation",
                self.tag,
                started.len(),
                self.concurrency
            );
        }

        let ports: Vec<u16> = started.iter().map(|g| g.port).collect();
        let previous = std::mem::replace(&mut *self.live.lock(), started);
        self.recycle.lock().extend(previous.iter().cloned());
        *self.last_refresh.lock() = Some(Instant::now());

        for group in &previous {
            group.close().await;
            self.release_port(group.port);
        }
        self.recycle.lock().clear();

        info!("[{}] Refreshed workers, now on port(s) {:?}", self.tag, ports);
        Ok(())
    }

    async fn close_all(&self) {
        let _serial = self.refresh_lock.lock().await;
        let mut groups: Vec<Arc<PortWorkers>> = std::mem::take(&mut *self.live.lock());
        groups.append(&mut self.recycle.lock());
        for group in groups {
            group.close().await;
            self.release_port(group.port);
        }
    }
}

/// 动态端口分配：在范围内随机选择 `concurrency` 个端口并定期轮换
pub struct DynamicInboundHandler {
    inner: Arc<DynamicInner>,
    refresher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DynamicInboundHandler {
    pub fn new(range: PortRange, concurrency: usize, refresh_interval: Duration, template: WorkerConfig) -> Self {
        let networks = template.proxy.networks();
        Self {
            inner: Arc::new(DynamicInner {
                tag: template.tag.clone(),
                range,
                concurrency,
                refresh_interval,
                template,
                networks,
                live: Mutex::new(Vec::new()),
                recycle: Mutex::new(Vec::new()),
                ports_in_use: Mutex::new(HashSet::new()),
                last_refresh: Mutex::new(None),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
            refresher: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn proxy(&self) -> Arc<dyn InboundProxy> {
        self.inner.template.proxy.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// 当前这一代占用的端口（升序）
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.live.lock().iter().map(|g| g.port).collect();
        ports.sort_unstable();
        ports
    }

    /// 当前这一代的 Worker 数量
    pub fn worker_count(&self) -> usize {
        self.inner.live.lock().iter().map(|g| g.workers.len()).sum()
    }

    /// 待回收的 Worker 组数量（仅在刷新过程中非零）
    pub fn pending_recycle(&self) -> usize {
        self.inner.recycle.lock().len()
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        *self.inner.last_refresh.lock()
    }

    /// 轮换一代 Worker；全部失败时保留上一代并返回 `ResourceExhausted`
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    /// 分配第一代 Worker 并启动定时刷新任务
    pub async fn start(&self) -> Result<()> {
        self.inner.refresh().await?;

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(inner.refresh_interval) => {}
                }
                if let Err(e) = inner.refresh().await {
                    warn!("[{}] Worker refresh failed, keeping previous generation: {}", inner.tag, e);
                }
            }
            debug!("[{}] Refresh task stopped", inner.tag);
        });

        if let Some((old_cancel, _)) = self.refresher.lock().replace((cancel, task)) {
            old_cancel.cancel();
        }
        Ok(())
    }

    /// 停止定时刷新并关闭所有 Worker
    pub async fn close(&self) {
        let refresher = self.refresher.lock().take();
        if let Some((cancel, task)) = refresher {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("[{}] Refresh task ended abnormally: {}", self.inner.tag, e);
            }
        }
        self.inner.close_all().await;
        info!("[{}] Dynamic inbound closed", self.inner.tag);
    }

    pub fn get_random_inbound_proxy(&self) -> Option<(Arc<dyn InboundProxy>, u16)> {
        let ports = self.ports();
        let port = *ports.choose(&mut rand::rng())?;
        Some((self.proxy(), port))
    }
}

impl Drop for DynamicInboundHandler {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.refresher.get_mut().take() {
            cancel.cancel();
        }
    }
}
