//! Session tracking and packet admission.
//!
//! Invariants: live sessions never exceed the session limit (when the limit
//! is positive); counters only grow; every accepted packet bumps the packet
//! and byte totals, even when it is later dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime};

use crate::error::{ProxyError, Result};
use crate::protocol::{parse_mtproto_packet, PacketInfo, PacketKind, Session, SessionState};
use crate::proxy::rate_limiter::FixedWindowRateLimiter;

#[derive(Debug, Clone, Default)]
pub struct DataPlaneStats {
    pub active_sessions: u64,
    pub session_limit: usize,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub packets_total: u64,
    pub packets_encrypted: u64,
    pub packets_handshake: u64,
    pub packets_dropped: u64,
    pub packets_parse_errors: u64,
    pub packets_route_errors: u64,
    pub packets_rejected_by_limit: u64,
    pub packets_rejected_by_dh: u64,
    pub packets_outbound_errors: u64,
    pub bytes_total: u64,
}

struct SessionEntry {
    session: Session,
    last_seen_at: SystemTime,
    packets: u64,
}

pub struct DataPlane {
    session_limit: RwLock<usize>,
    dh_rate_limiter: FixedWindowRateLimiter,
    sessions: Mutex<HashMap<i64, SessionEntry>>,

    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    packets_total: AtomicU64,
    packets_encrypted: AtomicU64,
    packets_handshake: AtomicU64,
    packets_dropped: AtomicU64,
    packets_parse_errors: AtomicU64,
    packets_route_errors: AtomicU64,
    packets_rejected_by_limit: AtomicU64,
    packets_rejected_by_dh: AtomicU64,
    packets_outbound_errors: AtomicU64,
    bytes_total: AtomicU64,
}

impl DataPlane {
    pub fn new(session_limit: usize, max_dh_accept_rate: i64) -> Self {
        DataPlane {
            session_limit: RwLock::new(session_limit),
            dh_rate_limiter: FixedWindowRateLimiter::new(max_dh_accept_rate),
            sessions: Mutex::new(HashMap::new()),
            sessions_created: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            packets_total: AtomicU64::new(0),
            packets_encrypted: AtomicU64::new(0),
            packets_handshake: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_parse_errors: AtomicU64::new(0),
            packets_route_errors: AtomicU64::new(0),
            packets_rejected_by_limit: AtomicU64::new(0),
            packets_rejected_by_dh: AtomicU64::new(0),
            packets_outbound_errors: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
        }
    }

    /// Steps 1-4 of packet handling: classify, apply the DH rate limit,
    /// admit the session, and feed the state machine. The forward and
    /// outbound steps live in the runtime, which reports their outcomes
    /// back through `record_route_error` / `record_outbound_error`.
    pub fn admit(&self, conn_id: i64, frame: &[u8], now: SystemTime) -> Result<PacketInfo> {
        self.packets_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(frame.len() as u64, Ordering::Relaxed);

        let info = match parse_mtproto_packet(frame) {
            Ok(info) => info,
            Err(e) => {
                self.packets_parse_errors.fetch_add(1, Ordering::Relaxed);
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if info.kind == PacketKind::DhHandshake && !self.dh_rate_limiter.allow(now) {
            self.packets_rejected_by_dh.fetch_add(1, Ordering::Relaxed);
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ProxyError::DhRateExceeded);
        }

        {
            let mut sessions = self.sessions.lock().expect("session lock");
            let limit = *self.session_limit.read().expect("limit lock");
            let live = sessions.len();
            let entry = match sessions.entry(conn_id) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    if limit > 0 && live >= limit {
                        self.packets_rejected_by_limit.fetch_add(1, Ordering::Relaxed);
                        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(ProxyError::ConnectionLimitReached);
                    }
                    self.sessions_created.fetch_add(1, Ordering::Relaxed);
                    e.insert(SessionEntry {
                        session: Session::new(),
                        last_seen_at: now,
                        packets: 0,
                    })
                }
            };
            entry.last_seen_at = now;
            entry.packets += 1;
            entry.session.accept_info(&info);
        }

        match info.kind {
            PacketKind::Encrypted => self.packets_encrypted.fetch_add(1, Ordering::Relaxed),
            PacketKind::DhHandshake => self.packets_handshake.fetch_add(1, Ordering::Relaxed),
        };

        Ok(info)
    }

    pub fn record_route_error(&self) {
        self.packets_route_errors.fetch_add(1, Ordering::Relaxed);
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_error(&self) {
        self.packets_outbound_errors.fetch_add(1, Ordering::Relaxed);
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_connection(&self, conn_id: i64) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock");
        if sessions.remove(&conn_id).is_none() {
            return false;
        }
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove sessions idle longer than `idle`; returns how many went away.
    pub fn prune_idle(&self, idle: Duration, now: SystemTime) -> usize {
        let cutoff = now.checked_sub(idle).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut sessions = self.sessions.lock().expect("session lock");
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_seen_at >= cutoff);
        let pruned = before - sessions.len();
        if pruned > 0 {
            self.sessions_closed.fetch_add(pruned as u64, Ordering::Relaxed);
        }
        pruned
    }

    pub fn session_state(&self, conn_id: i64) -> Option<SessionState> {
        let sessions = self.sessions.lock().expect("session lock");
        sessions.get(&conn_id).map(|e| e.session.state())
    }

    pub fn session_limit(&self) -> usize {
        *self.session_limit.read().expect("limit lock")
    }

    pub fn set_session_limit(&self, limit: usize) {
        *self.session_limit.write().expect("limit lock") = limit;
    }

    pub fn stats(&self) -> DataPlaneStats {
        let active = self.sessions.lock().expect("session lock").len() as u64;
        DataPlaneStats {
            active_sessions: active,
            session_limit: self.session_limit(),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            packets_total: self.packets_total.load(Ordering::Relaxed),
            packets_encrypted: self.packets_encrypted.load(Ordering::Relaxed),
            packets_handshake: self.packets_handshake.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_parse_errors: self.packets_parse_errors.load(Ordering::Relaxed),
            packets_route_errors: self.packets_route_errors.load(Ordering::Relaxed),
            packets_rejected_by_limit: self.packets_rejected_by_limit.load(Ordering::Relaxed),
            packets_rejected_by_dh: self.packets_rejected_by_dh.load(Ordering::Relaxed),
            packets_outbound_errors: self.packets_outbound_errors.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }
}
