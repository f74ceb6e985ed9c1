//! Client-facing listener: accepts TCP connections, recognizes the MTProto
//! transport on each, and runs the per-connection frame loop against the
//! runtime.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use socket2::SockRef;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::client_transport::ClientTransport;
use crate::proxy::rate_limiter::FixedWindowRateLimiter;
use crate::proxy::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct ClientIngressConfig {
    pub addr: String,
    pub target_dc: i32,
    pub max_frame_size: usize,
    pub idle_timeout: Duration,
    pub max_accept_rate: i64,
    pub read_buf_bytes: usize,
    pub write_buf_bytes: usize,
    pub secrets: Vec<[u8; 16]>,
}

impl Default for ClientIngressConfig {
    fn default() -> Self {
        ClientIngressConfig {
            addr: String::new(),
            target_dc: 0,
            max_frame_size: 4 << 20,
            idle_timeout: Duration::from_secs(45),
            max_accept_rate: 0,
            read_buf_bytes: 0,
            write_buf_bytes: 0,
            secrets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngressStats {
    pub accepted_connections: u64,
    pub accept_rate_limited: u64,
    pub closed_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_handled: u64,
    pub frames_returned: u64,
    pub frames_failed: u64,
    pub bytes_received: u64,
    pub bytes_returned: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub invalid_frames: u64,
}

pub struct ClientIngressServer {
    runtime: Arc<Runtime>,
    cfg: ClientIngressConfig,
    local_addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    tasks: TaskTracker,

    next_conn_id: AtomicI64,
    accept_limiter: FixedWindowRateLimiter,

    accepted_connections: AtomicU64,
    accept_rate_limited: AtomicU64,
    closed_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_handled: AtomicU64,
    frames_returned: AtomicU64,
    frames_failed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_returned: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    invalid_frames: AtomicU64,
}

impl ClientIngressServer {
    pub async fn start(runtime: Arc<Runtime>, mut cfg: ClientIngressConfig) -> Result<Arc<Self>> {
        if cfg.max_frame_size == 0 {
            cfg.max_frame_size = 4 << 20;
        }
        if cfg.idle_timeout.is_zero() {
            cfg.idle_timeout = Duration::from_secs(45);
        }
        if cfg.addr.is_empty() {
            return Err(ProxyError::ConfigParse("ingress addr is required".into()));
        }

        let listener = TcpListener::bind(&cfg.addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(ClientIngressServer {
            runtime,
            accept_limiter: FixedWindowRateLimiter::new(cfg.max_accept_rate),
            cfg,
            local_addr,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            next_conn_id: AtomicI64::new(0),
            accepted_connections: AtomicU64::new(0),
            accept_rate_limited: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_handled: AtomicU64::new(0),
            frames_returned: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_returned: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            invalid_frames: AtomicU64::new(0),
        });

        let accept_server = server.clone();
        server.tasks.spawn(async move {
            accept_server.accept_loop(listener).await;
        });

        info!(addr = %local_addr, "ingress server listening");
        Ok(server)
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.shutdown.cancel();
        self.tasks.close();
        if timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("ingress shutdown grace expired with connections still open");
        }
        Ok(())
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            accept_rate_limited: self.accept_rate_limited.load(Ordering::Relaxed),
            closed_connections: self.closed_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_handled: self.frames_handled.load(Ordering::Relaxed),
            frames_returned: self.frames_returned.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_returned: self.bytes_returned.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "ingress accept error");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            self.accepted_connections.fetch_add(1, Ordering::Relaxed);
            if !self.accept_limiter.allow(SystemTime::now()) {
                self.accept_rate_limited.fetch_add(1, Ordering::Relaxed);
                drop(stream);
                continue;
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.active_connections.fetch_add(1, Ordering::Relaxed);

            let server = self.clone();
            self.tasks.spawn(async move {
                debug!(conn_id, peer = %peer, "client connected");
                server.handle_conn(conn_id, stream).await;
                server.runtime.close_connection(conn_id);
                server.closed_connections.fetch_add(1, Ordering::Relaxed);
                server.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_conn(&self, conn_id: i64, stream: TcpStream) {
        self.configure_socket(&stream);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut transport = ClientTransport::new(self.cfg.max_frame_size);

        let init = timeout(
            self.cfg.idle_timeout,
            transport.init(&mut reader, &self.cfg.secrets),
        )
        .await;
        match init {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                self.invalid_frames.fetch_add(1, Ordering::Relaxed);
                self.frames_failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let target_dc = if transport.target_dc() != 0 {
            transport.target_dc()
        } else {
            self.cfg.target_dc
        };

        loop {
            let frame = match timeout(self.cfg.idle_timeout, transport.read_packet(&mut reader)).await {
                // Idle deadline: treat like the peer going away.
                Err(_) => return,
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    if is_conn_closed_read(&e) {
                        return;
                    }
                    self.read_errors.fetch_add(1, Ordering::Relaxed);
                    self.frames_failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            if frame.is_empty() {
                self.invalid_frames.fetch_add(1, Ordering::Relaxed);
                self.frames_failed.fetch_add(1, Ordering::Relaxed);
                return;
            }

            self.frames_received.fetch_add(1, Ordering::Relaxed);
            self.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

            let handled = match self.runtime.handle_packet(conn_id, target_dc, &frame).await {
                Ok(handled) => handled,
                Err(e) => {
                    debug!(conn_id, error = %e, "packet dropped");
                    self.frames_failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if let Some(response) = handled.response.filter(|r| !r.is_empty()) {
                let write = async {
                    transport.write_packet(&mut write_half, &response).await?;
                    write_half.flush().await?;
                    Ok::<(), ProxyError>(())
                };
                match timeout(self.cfg.idle_timeout, write).await {
                    Ok(Ok(())) => {
                        self.frames_returned.fetch_add(1, Ordering::Relaxed);
                        self.bytes_returned.fetch_add(response.len() as u64, Ordering::Relaxed);
                    }
                    Ok(Err(_)) | Err(_) => {
                        self.write_errors.fetch_add(1, Ordering::Relaxed);
                        self.frames_failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            self.frames_handled.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn configure_socket(&self, stream: &TcpStream) {
        let sock = SockRef::from(stream);
        if self.cfg.read_buf_bytes > 0 {
            if let Err(e) = sock.set_recv_buffer_size(self.cfg.read_buf_bytes) {
                debug!(error = %e, "failed to set receive buffer size");
            }
        }
        if self.cfg.write_buf_bytes > 0 {
            if let Err(e) = sock.set_send_buffer_size(self.cfg.write_buf_bytes) {
                debug!(error = %e, "failed to set send buffer size");
            }
        }
        let _ = stream.set_nodelay(true);
    }
}

fn is_conn_closed_read(err: &ProxyError) -> bool {
    match err {
        ProxyError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
        ),
        _ => false,
    }
}
