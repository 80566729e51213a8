use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transparent::{enable_transparent, original_destination};
use super::{InboundProxy, TrackedConnection, WorkerConfig, WorkerState};
use crate::context::RequestContext;
use crate::destination::{Destination, Network};
use crate::error::{DispatchError, Result};
use crate::stats::ConnectionGuard;

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

struct Running {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// TCP 监听 Worker：每个接受的连接在独立任务中交给入站协议处理
pub struct TcpWorker {
    config: Arc<WorkerConfig>,
    state: Mutex<WorkerState>,
    running: Mutex<Option<Running>>,
}

/// 绑定监听套接字（SO_REUSEADDR 允许立即重用 TIME_WAIT 中的端口）
fn bind_listener(addr: SocketAddr, transparent: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if transparent {
        enable_transparent(&socket, addr);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

impl TcpWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Mutex::new(WorkerState::Idle),
            running: Mutex::new(None),
        }
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

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WorkerState::Idle {
                return Err(DispatchError::config_error(format!(
                    "TCP worker on port {} cannot start from state {:?}",
                    self.config.port, *state
                )));
            }
            *state = WorkerState::Starting;
        }

        let addr = self.config.bind_addr();
        let listener = match bind_listener(addr, self.config.receive_original_destination) {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.lock() = WorkerState::Closed;
                return Err(DispatchError::bind_failed(addr.to_string(), e));
            }
        };
        let local_addr = listener.local_addr().unwrap_or(addr);
        info!("[{}] TCP worker listening on {}", self.config.tag, local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(self.config.clone(), listener, cancel.clone()));

        *self.running.lock() = Some(Running {
            cancel,
            local_addr,
            task,
        });
        *self.state.lock() = WorkerState::Running;
        Ok(())
    }

    /// 停止接受连接，取消进行中的流，并等待监听套接字释放
    pub async fn close(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            *self.state.lock() = WorkerState::Closed;
            return;
        };

        *self.state.lock() = WorkerState::Closing;
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!("[{}] TCP accept task ended abnormally: {}", self.config.tag, e);
        }
        *self.state.lock() = WorkerState::Closed;
        info!("[{}] TCP worker on {} closed", self.config.tag, running.local_addr);
    }
}

impl Drop for TcpWorker {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn accept_loop(config: Arc<WorkerConfig>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = listener.accept() => match r {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("[{}] Failed to accept connection: {}", config.tag, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        handle_connection(&config, stream, peer, &cancel);
    }
    debug!("[{}] Accept loop on port {} stopped", config.tag, config.port);
}

fn handle_connection(config: &Arc<WorkerConfig>, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
    if let Some(ref limiter) = config.rate_limiter {
        if limiter.check().is_err() {
            warn!("[{}] Rate limit exceeded, dropping connection from {}", config.tag, peer);
            config.stats.connection_rejected();
            return;
        }
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!("[{}] Failed to set TCP_NODELAY for {}: {}", config.tag, peer, e);
    }

    let flow_cancel = cancel.child_token();
    let mut ctx = RequestContext::new(config.tag.clone(), flow_cancel.clone())
        .with_source(Destination::from_socket_addr(Network::Tcp, peer))
        .with_sniffing(config.sniffing.clone())
        .with_allow_passive_connection(config.allow_passive_connection);
    if config.receive_original_destination {
        match original_destination(&stream) {
            Ok(original) => ctx = ctx.with_original_target(Destination::from_socket_addr(Network::Tcp, original)),
            Err(e) => debug!("[{}] Cannot recover original destination for {}: {}", config.tag, peer, e),
        }
    }
    let ctx = Arc::new(ctx);

    let config = config.clone();
    tokio::spawn(async move {
        let _guard = ConnectionGuard::new(config.stats.clone());
        debug!("[{}] Accepted {} (flow {})", config.tag, peer, ctx.id());

        let conn = TrackedConnection::new(stream, config.stats.clone());
        let result = config
            .proxy
            .process(ctx.clone(), Network::Tcp, Box::new(conn), config.dispatcher.clone())
            .await;
        match result {
            Ok(()) => debug!("[{}] Flow {} from {} completed", config.tag, ctx.id(), peer),
            Err(e) if e.is_cancelled() => debug!("[{}] Flow {} cancelled", config.tag, ctx.id()),
            Err(e) => {
                warn!("[{}] Flow {} from {} failed: {}", config.tag, ctx.id(), peer, e);
                flow_cancel.cancel();
            }
        }
    });
}
