use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::{InboundProxy, TrackedConnection, WorkerConfig, WorkerState};
use crate::context::RequestContext;
use crate::destination::{Destination, Network};
use crate::error::{DispatchError, Result};
use crate::stats::ConnectionGuard;

/// 空闲伪连接的清理周期
pub const UDP_CLEANUP_INTERVAL: Duration = Duration::from_secs(16);

/// 伪连接超过该时长没有活动即被清理
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// 每个伪连接缓冲的数据报数量，满了直接丢弃
pub const UDP_QUEUE_SIZE: usize = 64;

const MAX_UDP_PACKET_SIZE: usize = 65536;

/// close 等待伪连接任务退出（释放套接字引用）的上限
const FLOW_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// (来源地址, 声明的目标)
type FlowKey = (SocketAddr, Option<Destination>);

/// 自 Worker 启动以来的毫秒数，供空闲判断使用
#[derive(Clone)]
struct ActivityClock {
    epoch: Instant,
}

impl ActivityClock {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

struct UdpFlow {
    id: u64,
    queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    last_activity: Arc<AtomicU64>,
}

type FlowTable = Arc<Mutex<HashMap<FlowKey, UdpFlow>>>;

/// 一个 UDP 流在入站协议看来的连接形态
///
/// 每次读取返回一个数据报（缓冲区不足时剩余部分留给下一次读取），
/// 每次写入发送一个数据报到流的来源地址。伪连接被清理后读取返回 EOF。
pub struct UdpConnection {
    queue: mpsc::Receiver<Bytes>,
    pending: Bytes,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    clock: ActivityClock,
    last_activity: Arc<AtomicU64>,
}

impl UdpConnection {
    fn touch(&self) {
        self.last_activity.store(self.clock.now_millis(), Ordering::Relaxed);
    }
}

impl AsyncRead for UdpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match this.queue.poll_recv(cx) {
                Poll::Ready(Some(datagram)) => this.pending = datagram,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        this.touch();
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = this.socket.poll_send_to(cx, buf, this.peer);
        if let Poll::Ready(Ok(_)) = result {
            this.touch();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    flow_tasks: TaskTracker,
}

/// UDP Worker：一个套接字按 (来源, 目标) 分流为多个伪连接
pub struct UdpWorker {
    config: Arc<WorkerConfig>,
    state: Mutex<WorkerState>,
    running: Mutex<Option<Running>>,
    flows: FlowTable,
    idle_timeout: Duration,
    cleanup_interval: Duration,
}

impl UdpWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Mutex::new(WorkerState::Idle),
            running: Mutex::new(None),
            flows: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout: UDP_IDLE_TIMEOUT,
            cleanup_interval: UDP_CLEANUP_INTERVAL,
        }
    }

    /// 调整空闲清理参数（必须在 start 之前调用）
    pub fn with_idle_timeout(mut self, idle_timeout: Duration, cleanup_interval: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self.cleanup_interval = cleanup_interval;
        self
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn proxy(&self) -> Arc<dyn InboundProxy> {
        self.config.proxy.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// 当前存活的伪连接数量
    pub fn active_flows(&self) -> usize {
        self.flows.lock().len()
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WorkerState::Idle {
                return Err(DispatchError::config_error(format!(
                    "UDP worker on port {} cannot start from state {:?}",
                    self.config.port, *state
                )));
            }
            *state = WorkerState::Starting;
        }

        let addr = self.config.bind_addr();
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                *self.state.lock() = WorkerState::Closed;
                return Err(DispatchError::bind_failed(addr.to_string(), e));
            }
        };
        let local_addr = socket.local_addr().unwrap_or(addr);
        info!("[{}] UDP worker listening on {}", self.config.tag, local_addr);

        let cancel = CancellationToken::new();
        let clock = ActivityClock { epoch: Instant::now() };
        let flow_tasks = TaskTracker::new();
        let demux = FlowDemux {
            config: self.config.clone(),
            socket,
            local_addr,
            flows: self.flows.clone(),
            clock: clock.clone(),
            cancel: cancel.clone(),
            flow_tasks: flow_tasks.clone(),
            next_id: 0,
        };
        let recv_task = tokio::spawn(demux.run());
        let sweep_task = tokio::spawn(sweep_loop(
            self.config.tag.clone(),
            self.flows.clone(),
            clock,
            self.idle_timeout,
            self.cleanup_interval,
            cancel.clone(),
        ));

        *self.running.lock() = Some(Running {
            cancel,
            local_addr,
            tasks: vec![recv_task, sweep_task],
            flow_tasks,
        });
        *self.state.lock() = WorkerState::Running;
        Ok(())
    }

    /// 停止接收、取消所有伪连接，并等待套接字释放
    pub async fn close(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            *self.state.lock() = WorkerState::Closed;
            return;
        };

        *self.state.lock() = WorkerState::Closing;
        running.cancel.cancel();
        let evicted: Vec<UdpFlow> = self.flows.lock().drain().map(|(_, flow)| flow).collect();
        for flow in &evicted {
            flow.cancel.cancel();
        }
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("[{}] UDP worker task ended abnormally: {}", self.config.tag, e);
            }
        }
        running.flow_tasks.close();
        if tokio::time::timeout(FLOW_DRAIN_TIMEOUT, running.flow_tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "[{}] {} UDP flow(s) still running after close",
                self.config.tag,
                running.flow_tasks.len()
            );
        }
        *self.state.lock() = WorkerState::Closed;
        info!("[{}] UDP worker on {} closed", self.config.tag, running.local_addr);
    }
}

impl Drop for UdpWorker {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// 接收循环：只做查表和入队，不在这里等待任何流
struct FlowDemux {
    config: Arc<WorkerConfig>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    flows: FlowTable,
    clock: ActivityClock,
    cancel: CancellationToken,
    flow_tasks: TaskTracker,
    next_id: u64,
}

impl FlowDemux {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            let (n, source) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(received) => received,
                    Err(e) => {
                        // 例如 ICMP 端口不可达，不影响其他流
                        debug!("[{}] UDP receive error: {}", self.config.tag, e);
                        continue;
                    }
                },
            };
            // 读到 0 字节对伪连接意味着 EOF，空数据报不入队
            if n == 0 {
                trace!("[{}] Empty datagram from {} ignored", self.config.tag, source);
                continue;
            }
            self.deliver(source, Bytes::copy_from_slice(&buf[..n]));
        }
        debug!("[{}] UDP receive loop on port {} stopped", self.config.tag, self.config.port);
    }

    fn declared_destination(&self) -> Option<Destination> {
        self.config
            .receive_original_destination
            .then(|| Destination::from_socket_addr(Network::Udp, self.local_addr))
    }

    fn deliver(&mut self, source: SocketAddr, datagram: Bytes) {
        let key: FlowKey = (source, self.declared_destination());
        let now = self.clock.now_millis();

        let mut flows = self.flows.lock();
        let datagram = match flows.get(&key) {
            Some(flow) => match flow.queue.try_send(datagram) {
                Ok(()) => {
                    flow.last_activity.store(now, Ordering::Relaxed);
                    return;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("[{}] Queue full for {}, datagram dropped", self.config.tag, source);
                    return;
                }
                // 处理任务已结束，重新建立流
                Err(mpsc::error::TrySendError::Closed(d)) => d,
            },
            None => datagram,
        };
        flows.remove(&key);
        drop(flows);
        self.open_flow(key, datagram, now);
    }

    fn open_flow(&mut self, key: FlowKey, first: Bytes, now: u64) {
        if let Some(ref limiter) = self.config.rate_limiter {
            if limiter.check().is_err() {
                debug!("[{}] Rate limit exceeded, dropping datagram from {}", self.config.tag, key.0);
                self.config.stats.connection_rejected();
                return;
            }
        }

        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = mpsc::channel(UDP_QUEUE_SIZE);
        let flow_cancel = self.cancel.child_token();
        let last_activity = Arc::new(AtomicU64::new(now));
        // 队列刚创建，第一个数据报一定能放入
        let _ = tx.try_send(first);

        let conn = UdpConnection {
            queue: rx,
            pending: Bytes::new(),
            socket: self.socket.clone(),
            peer: key.0,
            clock: self.clock.clone(),
            last_activity: last_activity.clone(),
        };

        let mut ctx = RequestContext::new(self.config.tag.clone(), flow_cancel.clone())
            .with_source(Destination::from_socket_addr(Network::Udp, key.0))
            .with_sniffing(self.config.sniffing.clone())
            .with_allow_passive_connection(self.config.allow_passive_connection);
        if let Some(ref target) = key.1 {
            ctx = ctx.with_original_target(target.clone());
        }
        let ctx = Arc::new(ctx);

        self.flows.lock().insert(
            key.clone(),
            UdpFlow {
                id,
                queue: tx,
                cancel: flow_cancel.clone(),
                last_activity,
            },
        );

        let config = self.config.clone();
        let flows = self.flows.clone();
        self.flow_tasks.spawn(async move {
            let _guard = ConnectionGuard::new(config.stats.clone());
            debug!("[{}] New UDP flow {} from {}", config.tag, ctx.id(), key.0);

            let conn = TrackedConnection::new(conn, config.stats.clone());
            let result = config
                .proxy
                .process(ctx.clone(), Network::Udp, Box::new(conn), config.dispatcher.clone())
                .await;
            match result {
                Ok(()) => debug!("[{}] UDP flow {} completed", config.tag, ctx.id()),
                Err(e) if e.is_cancelled() => debug!("[{}] UDP flow {} cancelled", config.tag, ctx.id()),
                Err(e) => warn!("[{}] UDP flow {} from {} failed: {}", config.tag, ctx.id(), key.0, e),
            }

            flow_cancel.cancel();
            let mut flows = flows.lock();
            if flows.get(&key).is_some_and(|flow| flow.id == id) {
                flows.remove(&key);
            }
        });
    }
}

async fn sweep_loop(
    tag: String,
    flows: FlowTable,
    clock: ActivityClock,
    idle_timeout: Duration,
    cleanup_interval: Duration,
    cancel: CancellationToken,
) {
    let idle_millis = idle_timeout.as_millis() as u64;
    let mut ticker = tokio::time::interval(cleanup_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = clock.now_millis();
        let mut evicted = Vec::new();
        flows.lock().retain(|key, flow| {
            let idle = now.saturating_sub(flow.last_activity.load(Ordering::Relaxed));
            if idle > idle_millis {
                evicted.push((key.0, flow.cancel.clone()));
                false
            } else {
                true
            }
        });

        for (source, token) in evicted {
            debug!("[{}] UDP flow from {} idle, evicted", tag, source);
            token.cancel();
        }
    }
}
