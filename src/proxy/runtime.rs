//! Runtime composition: router + forwarder + data plane + health map +
//! signal loop. Everything the ingress needs reaches it through this type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, Target, TargetIdentity};
use crate::error::{ProxyError, Result};
use crate::protocol::PacketInfo;
use crate::proxy::client_ingress::IngressStats;
use crate::proxy::dataplane::DataPlane;
use crate::proxy::forwarder::{ForwardDecision, ForwardRequest, ForwardStats, Forwarder};
use crate::proxy::lifecycle::{Lifecycle, Signal, SignalAction};
use crate::proxy::outbound::{OutboundSender, OutboundStats};
use crate::proxy::router::{ChooseResult, Router, TargetRandSource, ThreadRngSource};

const CHOOSE_ATTEMPTS: usize = 5;
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(5);

type HealthChecker = Box<dyn Fn(&Target) -> bool + Send + Sync>;
type IngressStatsFn = Box<dyn Fn() -> IngressStats + Send + Sync>;
type LogReopener = Box<dyn Fn() -> std::io::Result<()> + Send + Sync>;

/// Outcome of one fully handled packet.
#[derive(Debug)]
pub struct HandledPacket {
    pub info: PacketInfo,
    pub decision: ForwardDecision,
    /// `None` when the upstream produced no response; that is not an error.
    pub response: Option<Bytes>,
}

pub struct Runtime {
    lifecycle: Lifecycle,
    router: Router,
    forwarder: Forwarder,
    dataplane: DataPlane,

    target_health: RwLock<HashMap<TargetIdentity, bool>>,
    health_checker: RwLock<Option<HealthChecker>>,
    rand_source: RwLock<Arc<dyn TargetRandSource>>,

    outbound: RwLock<Option<Arc<dyn OutboundSender>>>,
    ingress_stats: RwLock<Option<IngressStatsFn>>,
    log_reopener: RwLock<Option<LogReopener>>,
}

impl Runtime {
    pub fn new(lifecycle: Lifecycle, max_connections: usize, max_dh_accept_rate: i64) -> Self {
        Runtime {
            lifecycle,
            router: Router::new(),
            forwarder: Forwarder::new(),
            dataplane: DataPlane::new(max_connections, max_dh_accept_rate),
            target_health: RwLock::new(HashMap::new()),
            health_checker: RwLock::new(None),
            rand_source: RwLock::new(Arc::new(ThreadRngSource)),
            outbound: RwLock::new(None),
            ingress_stats: RwLock::new(None),
            log_reopener: RwLock::new(None),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn dataplane(&self) -> &DataPlane {
        &self.dataplane
    }

    pub fn set_outbound_sender(&self, sender: Arc<dyn OutboundSender>) {
        *self.outbound.write().expect("runtime lock") = Some(sender);
    }

    pub fn outbound_sender(&self) -> Option<Arc<dyn OutboundSender>> {
        self.outbound.read().expect("runtime lock").clone()
    }

    pub fn set_ingress_stats_provider(&self, f: impl Fn() -> IngressStats + Send + Sync + 'static) {
        *self.ingress_stats.write().expect("runtime lock") = Some(Box::new(f));
    }

    pub fn set_log_reopener(&self, f: impl Fn() -> std::io::Result<()> + Send + Sync + 'static) {
        *self.log_reopener.write().expect("runtime lock") = Some(Box::new(f));
    }

    pub fn set_health_checker(&self, f: impl Fn(&Target) -> bool + Send + Sync + 'static) {
        *self.health_checker.write().expect("runtime lock") = Some(Box::new(f));
    }

    pub fn set_rand_source(&self, src: Arc<dyn TargetRandSource>) {
        *self.rand_source.write().expect("runtime lock") = src;
    }

    // ===== routing =====

    pub fn choose_proxy_target(&self, target_dc: i32) -> Result<Target> {
        self.choose_proxy_target_detailed(target_dc).map(|r| r.target)
    }

    pub fn choose_proxy_target_detailed(&self, target_dc: i32) -> Result<ChooseResult> {
        let rnd = self.rand_source.read().expect("runtime lock").clone();
        self.router.choose_proxy_target_detailed(
            target_dc,
            CHOOSE_ATTEMPTS,
            &|t| self.is_target_healthy(t),
            rnd.as_ref(),
        )
    }

    pub fn forward(&self, req: &ForwardRequest) -> Result<ForwardDecision> {
        self.forwarder
            .decide(req, |dc| self.choose_proxy_target_detailed(dc))
    }

    pub fn forward_stats(&self) -> ForwardStats {
        self.forwarder.stats()
    }

    // ===== packet path =====

    /// Full per-packet procedure: admission via the data plane, a routing
    /// decision, then one outbound exchange under a hard deadline.
    pub async fn handle_packet(
        &self,
        conn_id: i64,
        target_dc: i32,
        frame: &[u8],
    ) -> Result<HandledPacket> {
        let info = self.dataplane.admit(conn_id, frame, SystemTime::now())?;

        let decision = match self.forward(&ForwardRequest {
            target_dc,
            auth_key_id: info.auth_key_id as i64,
            payload_size: frame.len(),
        }) {
            Ok(d) => d,
            Err(e) => {
                self.dataplane.record_route_error();
                return Err(e);
            }
        };

        let Some(sender) = self.outbound_sender() else {
            // No outbound transport configured: the routing decision stands,
            // there is just nobody to answer.
            return Ok(HandledPacket {
                info,
                decision,
                response: None,
            });
        };

        let exchanged = timeout(EXCHANGE_DEADLINE, sender.exchange(&decision.target, frame)).await;
        let response = match exchanged {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                self.mark_target_unhealthy(&decision.target);
                self.dataplane.record_outbound_error();
                return Err(e);
            }
            Err(_) => {
                self.mark_target_unhealthy(&decision.target);
                self.dataplane.record_outbound_error();
                return Err(ProxyError::ResponseRead("outbound exchange deadline exceeded".into()));
            }
        };

        self.mark_target_healthy(&decision.target);
        Ok(HandledPacket {
            info,
            decision,
            response,
        })
    }

    pub fn close_connection(&self, conn_id: i64) -> bool {
        self.dataplane.close_connection(conn_id)
    }

    // ===== target health =====

    pub fn mark_target_healthy(&self, t: &Target) {
        self.set_target_health(t, true);
    }

    pub fn mark_target_unhealthy(&self, t: &Target) {
        self.set_target_health(t, false);
    }

    pub fn target_health(&self, t: &Target) -> Option<bool> {
        self.target_health
            .read()
            .expect("health lock")
            .get(&t.identity())
            .copied()
    }

    pub fn target_health_stats(&self) -> (usize, usize) {
        let health = self.target_health.read().expect("health lock");
        let healthy = health.values().filter(|&&h| h).count();
        (healthy, health.len() - healthy)
    }

    pub fn is_target_healthy(&self, t: &Target) -> bool {
        let healthy = self.target_health(t).unwrap_or(true);
        if !healthy {
            return false;
        }
        match self.health_checker.read().expect("runtime lock").as_ref() {
            Some(checker) => checker(t),
            None => true,
        }
    }

    fn set_target_health(&self, t: &Target, healthy: bool) {
        self.target_health
            .write()
            .expect("health lock")
            .insert(t.identity(), healthy);
    }

    /// Install a config: update the router and reconcile the health map.
    /// Surviving targets keep their health, new ones start healthy, and
    /// entries for vanished targets are dropped.
    pub fn apply_config(&self, cfg: &Config) {
        self.router.update(cfg);

        let mut health = self.target_health.write().expect("health lock");
        let mut next = HashMap::with_capacity(cfg.targets.len());
        for t in &cfg.targets {
            let id = t.identity();
            let prev = health.get(&id).copied().unwrap_or(true);
            next.insert(id, prev);
        }
        *health = next;
    }

    // ===== signal loop =====

    /// Load the initial config (fatal on failure) and block handling
    /// signals until SIGTERM/SIGINT or cancellation.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let (snapshot, warnings) = self.lifecycle.load_initial()?;
        self.apply_config(&snapshot.config);
        for w in &warnings {
            warn!("{w}");
        }
        info!(
            targets = snapshot.config.targets.len(),
            clusters = snapshot.config.clusters.len(),
            bytes = snapshot.bytes,
            md5 = %snapshot.md5_hex,
            "runtime initialized"
        );

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        loop {
            let sig = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sighup.recv() => Signal::Hup,
                _ = sigterm.recv() => Signal::Term,
                _ = sigint.recv() => Signal::Int,
                _ = sigusr1.recv() => Signal::Usr1,
            };
            if self.dispatch_signal(sig) {
                return Ok(());
            }
        }
    }

    /// Returns true when the signal means shutdown.
    pub fn dispatch_signal(&self, sig: Signal) -> bool {
        match self.lifecycle.action_for(sig) {
            SignalAction::Reload => {
                match self.lifecycle.reload() {
                    Ok((snapshot, warnings)) => {
                        self.apply_config(&snapshot.config);
                        for w in &warnings {
                            warn!("{w}");
                        }
                        info!(
                            path = %snapshot.source_path.display(),
                            bytes = snapshot.bytes,
                            "configuration file re-read successfully, new configuration active"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "configuration reload failed");
                    }
                }
                false
            }
            SignalAction::LogRotate => {
                match self.reopen_log() {
                    Ok(true) => info!("SIGUSR1 received: log file reopened."),
                    Ok(false) => info!("SIGUSR1 received: no log file configured, skipping reopen."),
                    Err(e) => error!(error = %e, "SIGUSR1 log reopen failed"),
                }
                false
            }
            SignalAction::Shutdown => {
                info!("Terminated by {}.", sig.name());
                true
            }
        }
    }

    pub(crate) fn ingress_snapshot(&self) -> IngressStats {
        match self.ingress_stats.read().expect("runtime lock").as_ref() {
            Some(f) => f(),
            None => IngressStats::default(),
        }
    }

    pub(crate) fn outbound_stats(&self) -> OutboundStats {
        match self.outbound_sender() {
            Some(sender) => sender.stats(),
            None => OutboundStats::default(),
        }
    }

    fn reopen_log(&self) -> std::io::Result<bool> {
        match self.log_reopener.read().expect("runtime lock").as_ref() {
            None => Ok(false),
            Some(f) => {
                f()?;
                Ok(true)
            }
        }
    }
}
