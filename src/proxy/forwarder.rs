//! Forward accounting: wraps target choice with counters and last-error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::Target;
use crate::error::Result;
use crate::proxy::router::ChooseResult;

#[derive(Debug, Clone, Copy)]
pub struct ForwardRequest {
    pub target_dc: i32,
    pub auth_key_id: i64,
    pub payload_size: usize,
}

#[derive(Debug, Clone)]
pub struct ForwardDecision {
    pub target: Target,
    pub requested_cluster: i32,
    pub resolved_cluster_id: i32,
    pub used_default: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub used_default: u64,
    pub forwarded_bytes: u64,
    pub avg_payload_bytes: f64,
    pub last_error: String,
}

#[derive(Default)]
pub struct Forwarder {
    total_requests: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    used_default: AtomicU64,
    forwarded_bytes: AtomicU64,
    last_err: RwLock<String>,
}

impl Forwarder {
    pub fn new() -> Self {
        Forwarder::default()
    }

    /// Route one request through `choose` (the runtime's health-aware
    /// chooser) and account for the outcome.
    pub fn decide(
        &self,
        req: &ForwardRequest,
        choose: impl FnOnce(i32) -> Result<ChooseResult>,
    ) -> Result<ForwardDecision> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = match choose(req.target_dc) {
            Ok(r) => r,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.last_err.write().expect("forwarder lock") = e.to_string();
                return Err(e);
            }
        };

        self.successful.fetch_add(1, Ordering::Relaxed);
        if req.payload_size > 0 {
            self.forwarded_bytes
                .fetch_add(req.payload_size as u64, Ordering::Relaxed);
        }
        if result.used_default {
            self.used_default.fetch_add(1, Ordering::Relaxed);
        }

        Ok(ForwardDecision {
            target: result.target,
            requested_cluster: result.requested_cluster,
            resolved_cluster_id: result.resolved_cluster_id,
            used_default: result.used_default,
        })
    }

    pub fn stats(&self) -> ForwardStats {
        let successful = self.successful.load(Ordering::Relaxed);
        let forwarded_bytes = self.forwarded_bytes.load(Ordering::Relaxed);
        let avg_payload_bytes = if successful > 0 {
            forwarded_bytes as f64 / successful as f64
        } else {
            0.0
        };
        ForwardStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful,
            failed: self.failed.load(Ordering::Relaxed),
            used_default: self.used_default.load(Ordering::Relaxed),
            forwarded_bytes,
            avg_payload_bytes,
            last_error: self.last_err.read().expect("forwarder lock").clone(),
        }
    }
}
