//! Pooled upstream exchange.
//!
//! One pooled connection per (host, port). An exchange writes a
//! `u32_le(len) || payload` frame and reads one length-prefixed response
//! under a short deadline. A read timeout or a peer close counts as "no
//! response" and is not an error; writes get a single reconnect retry.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::config::Target;
use crate::error::{ProxyError, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_FRAME_SIZE: usize = 8 << 20;

#[async_trait]
pub trait OutboundDialer: Send + Sync {
    async fn connect(&self, addr: &str) -> io::Result<TcpStream>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl OutboundDialer for TcpDialer {
    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

#[derive(Clone)]
pub struct OutboundConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_conn_timeout: Duration,
    pub max_frame_size: usize,
    pub dialer: Option<Arc<dyn OutboundDialer>>,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        OutboundConfig {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_conn_timeout: DEFAULT_IDLE_CONN_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            dialer: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundStats {
    pub dials: u64,
    pub dial_errors: u64,
    pub sends: u64,
    pub send_errors: u64,
    pub bytes_sent: u64,
    pub responses: u64,
    pub response_errors: u64,
    pub response_bytes: u64,
    pub active_sends: u64,
    pub closed_after_send: u64,
    pub active_conns: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub reconnects: u64,
    pub idle_evictions: u64,
}

#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// `Ok(None)` means the upstream produced no response in time; that is a
    /// normal outcome, not a failure.
    async fn exchange(&self, target: &Target, payload: &[u8]) -> Result<Option<Bytes>>;
    fn stats(&self) -> OutboundStats;
    async fn close(&self);
}

struct ConnSlot {
    stream: Option<TcpStream>,
    had_conn: bool,
    last_used: Option<Instant>,
}

struct PooledConn {
    addr: String,
    slot: tokio::sync::Mutex<ConnSlot>,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Arc<PooledConn>>,
    closed: bool,
}

pub struct OutboundProxy {
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    idle_conn_timeout: Duration,
    max_frame_size: usize,
    dialer: Arc<dyn OutboundDialer>,

    pool: Mutex<PoolState>,

    dials: AtomicU64,
    dial_errors: AtomicU64,
    sends: AtomicU64,
    send_errors: AtomicU64,
    bytes_sent: AtomicU64,
    responses: AtomicU64,
    response_errors: AtomicU64,
    response_bytes: AtomicU64,
    active_sends: AtomicU64,
    closed_after_send: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    reconnects: AtomicU64,
    idle_evictions: AtomicU64,
}

impl OutboundProxy {
    pub fn new(cfg: OutboundConfig) -> Self {
        let defaults = OutboundConfig::default();
        let pick = |d: Duration, fallback: Duration| if d.is_zero() { fallback } else { d };
        OutboundProxy {
            connect_timeout: pick(cfg.connect_timeout, defaults.connect_timeout),
            write_timeout: pick(cfg.write_timeout, defaults.write_timeout),
            read_timeout: pick(cfg.read_timeout, defaults.read_timeout),
            idle_conn_timeout: pick(cfg.idle_conn_timeout, defaults.idle_conn_timeout),
            max_frame_size: if cfg.max_frame_size == 0 {
                defaults.max_frame_size
            } else {
                cfg.max_frame_size
            },
            dialer: cfg.dialer.unwrap_or_else(|| Arc::new(TcpDialer)),
            pool: Mutex::new(PoolState::default()),
            dials: AtomicU64::new(0),
            dial_errors: AtomicU64::new(0),
            sends: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            response_errors: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
            active_sends: AtomicU64::new(0),
            closed_after_send: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            idle_evictions: AtomicU64::new(0),
        }
    }

    fn get_or_create(&self, target: &Target) -> Result<Arc<PooledConn>> {
        let addr = target.addr();
        let mut pool = self.pool.lock().expect("pool lock");
        if pool.closed {
            return Err(ProxyError::OutboundClosed);
        }
        if let Some(pc) = pool.entries.get(&addr) {
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(pc.clone());
        }
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
        let pc = Arc::new(PooledConn {
            addr: addr.clone(),
            slot: tokio::sync::Mutex::new(ConnSlot {
                stream: None,
                had_conn: false,
                last_used: None,
            }),
        });
        pool.entries.insert(addr, pc.clone());
        Ok(pc)
    }

    async fn ensure_conn(&self, pc: &PooledConn, slot: &mut ConnSlot) -> Result<()> {
        if slot.stream.is_some() {
            return Ok(());
        }
        if slot.had_conn {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.dials.fetch_add(1, Ordering::Relaxed);
        let dial = timeout(self.connect_timeout, self.dialer.connect(&pc.addr)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.dial_errors.fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::Dial {
                    addr: pc.addr.clone(),
                    source: e,
                });
            }
            Err(_) => {
                self.dial_errors.fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::Dial {
                    addr: pc.addr.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        let _ = stream.set_nodelay(true);
        slot.stream = Some(stream);
        slot.had_conn = true;
        slot.last_used = Some(Instant::now());
        Ok(())
    }

    fn close_slot(&self, slot: &mut ConnSlot) {
        if slot.stream.take().is_some() {
            self.closed_after_send.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn write_frame(&self, slot: &mut ConnSlot, frame: &[u8]) -> io::Result<()> {
        let stream = slot
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no outbound socket"))?;
        match timeout(self.write_timeout, stream.write_all(frame)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }

    async fn exchange_locked(
        &self,
        pc: &PooledConn,
        slot: &mut ConnSlot,
        payload: &[u8],
    ) -> Result<Option<Bytes>> {
        self.ensure_conn(pc, slot).await?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        if let Err(first) = self.write_frame(slot, &frame).await {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            self.close_slot(slot);
            debug!(addr = %pc.addr, error = %first, "outbound write failed, retrying once");

            self.ensure_conn(pc, slot).await.map_err(|e| match e {
                ProxyError::Dial { addr, source } => ProxyError::Dial {
                    addr: format!("{addr} (retry connect after write failure)"),
                    source,
                },
                other => other,
            })?;
            if let Err(second) = self.write_frame(slot, &frame).await {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                self.close_slot(slot);
                return Err(ProxyError::Send(second));
            }
        }

        self.sends.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);

        match timeout(self.read_timeout, read_len_frame(slot, self.max_frame_size)).await {
            // Deadline passed with the socket still open: no response.
            Err(_) => Ok(None),
            Ok(Ok(resp)) => {
                self.responses.fetch_add(1, Ordering::Relaxed);
                self.response_bytes.fetch_add(resp.len() as u64, Ordering::Relaxed);
                Ok(Some(Bytes::from(resp)))
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // Peer closed without answering: no response, drop the socket.
                self.close_slot(slot);
                Ok(None)
            }
            Ok(Err(e)) => {
                self.response_errors.fetch_add(1, Ordering::Relaxed);
                self.close_slot(slot);
                Err(ProxyError::ResponseRead(e.to_string()))
            }
        }
    }

    fn evict_idle(&self) {
        if self.idle_conn_timeout.is_zero() {
            return;
        }
        let entries: Vec<(String, Arc<PooledConn>)> = {
            let pool = self.pool.lock().expect("pool lock");
            if pool.closed {
                return;
            }
            pool.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let now = Instant::now();
        for (key, pc) in entries {
            // A busy entry is in an exchange right now, so it is not idle.
            let Ok(mut slot) = pc.slot.try_lock() else { continue };
            let idle = slot
                .last_used
                .map(|t| now.duration_since(t) > self.idle_conn_timeout)
                .unwrap_or(false);
            if !idle {
                continue;
            }
            if slot.stream.take().is_some() {
                self.closed_after_send.fetch_add(1, Ordering::Relaxed);
                self.idle_evictions.fetch_add(1, Ordering::Relaxed);
                trace!(addr = %pc.addr, "evicted idle outbound connection");
            }
            drop(slot);

            let mut pool = self.pool.lock().expect("pool lock");
            if let Some(existing) = pool.entries.get(&key) {
                if Arc::ptr_eq(existing, &pc) {
                    pool.entries.remove(&key);
                }
            }
        }
    }

    fn count_active_conns(&self) -> u64 {
        let entries: Vec<Arc<PooledConn>> = {
            let pool = self.pool.lock().expect("pool lock");
            pool.entries.values().cloned().collect()
        };
        entries
            .iter()
            .filter(|pc| match pc.slot.try_lock() {
                Ok(slot) => slot.stream.is_some(),
                // Locked means an exchange is in flight on a live socket.
                Err(_) => true,
            })
            .count() as u64
    }
}

#[async_trait]
impl OutboundSender for OutboundProxy {
    async fn exchange(&self, target: &Target, payload: &[u8]) -> Result<Option<Bytes>> {
        if payload.len() > self.max_frame_size {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        self.evict_idle();
        let pc = self.get_or_create(target)?;

        self.active_sends.fetch_add(1, Ordering::Relaxed);
        let result = {
            let mut slot = pc.slot.lock().await;
            let result = self.exchange_locked(&pc, &mut slot, payload).await;
            slot.last_used = Some(Instant::now());
            result
        };
        self.active_sends.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn stats(&self) -> OutboundStats {
        OutboundStats {
            dials: self.dials.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
            sends: self.sends.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            response_errors: self.response_errors.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
            active_sends: self.active_sends.load(Ordering::Relaxed),
            closed_after_send: self.closed_after_send.load(Ordering::Relaxed),
            active_conns: self.count_active_conns(),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        let entries: Vec<Arc<PooledConn>> = {
            let mut pool = self.pool.lock().expect("pool lock");
            if pool.closed {
                return;
            }
            pool.closed = true;
            pool.entries.drain().map(|(_, v)| v).collect()
        };
        for pc in entries {
            let mut slot = pc.slot.lock().await;
            self.close_slot(&mut slot);
        }
    }
}

async fn read_len_frame(slot: &mut ConnSlot, max_frame_size: usize) -> io::Result<Vec<u8>> {
    let stream = slot
        .stream
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no outbound socket"))?;

    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).await?;
    let n = u32::from_le_bytes(hdr) as usize;
    if n > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad response frame length: {n}"),
        ));
    }
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
