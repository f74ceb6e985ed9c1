//! Aggregated stats snapshot and its key-TAB-value text rendering.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ManagerStats;
use crate::proxy::client_ingress::IngressStats;
use crate::proxy::dataplane::DataPlaneStats;
use crate::proxy::forwarder::ForwardStats;
use crate::proxy::outbound::OutboundStats;
use crate::proxy::router::RouterStats;
use crate::proxy::runtime::Runtime;

#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub generated_at: i64,

    pub has_current_config: bool,
    pub config_filename: String,
    pub config_loaded_at: i64,
    pub config_size: usize,
    pub config_md5: String,
    pub config_clusters: usize,
    pub warnings_count: usize,

    pub forward: ForwardStats,
    pub dataplane: DataPlaneStats,
    pub outbound: OutboundStats,
    pub ingress: IngressStats,
    pub router: RouterStats,
    pub manager: ManagerStats,
    pub healthy_targets: usize,
    pub unhealthy_targets: usize,
}

impl Runtime {
    pub fn stats_snapshot(&self) -> RuntimeStats {
        let mut out = RuntimeStats {
            generated_at: unix_now(),
            forward: self.forward_stats(),
            dataplane: self.dataplane().stats(),
            outbound: self.outbound_stats(),
            ingress: self.ingress_snapshot(),
            router: self.router().stats(),
            manager: self.lifecycle().manager_stats(),
            ..RuntimeStats::default()
        };
        (out.healthy_targets, out.unhealthy_targets) = self.target_health_stats();

        if let Some((snapshot, warnings)) = self.lifecycle().current() {
            out.has_current_config = true;
            out.config_filename = snapshot.source_path.display().to_string();
            out.config_loaded_at = unix_seconds(snapshot.loaded_at);
            out.config_size = snapshot.bytes;
            out.config_md5 = snapshot.md5_hex;
            out.config_clusters = snapshot.config.clusters.len();
            out.warnings_count = warnings.len();
        }
        out
    }
}

impl RuntimeStats {
    pub fn render_text(&self) -> String {
        let mut b = String::with_capacity(2048);
        let mut kv = |key: &str, value: String| {
            let _ = writeln!(b, "{key}\t{value}");
        };

        kv("stats_generated_at", self.generated_at.to_string());
        kv("has_current_config", (self.has_current_config as u8).to_string());
        if self.has_current_config {
            kv("config_filename", self.config_filename.clone());
            kv("config_loaded_at", self.config_loaded_at.to_string());
            kv("config_size", self.config_size.to_string());
            kv("config_md5", self.config_md5.clone());
            kv("config_auth_clusters", self.config_clusters.to_string());
        }
        kv("router_default_cluster", self.router.default_cluster_id.to_string());
        kv("router_clusters", self.router.clusters.to_string());
        kv("router_targets", self.router.targets.to_string());
        kv("targets_healthy", self.healthy_targets.to_string());
        kv("targets_unhealthy", self.unhealthy_targets.to_string());
        kv("bootstrap_warnings", self.warnings_count.to_string());
        kv("config_check_calls", self.manager.check_calls.to_string());
        kv("config_reload_calls", self.manager.reload_calls.to_string());
        kv("config_reload_success", self.manager.reload_success.to_string());
        kv("config_reload_last_error", self.manager.last_error.clone());
        kv("forward_total", self.forward.total_requests.to_string());
        kv("forward_successful", self.forward.successful.to_string());
        kv("forward_failed", self.forward.failed.to_string());
        kv("forward_used_default", self.forward.used_default.to_string());
        kv("forward_bytes", self.forward.forwarded_bytes.to_string());
        kv(
            "forward_avg_payload_bytes",
            format!("{:.3}", self.forward.avg_payload_bytes),
        );
        kv("forward_last_error", self.forward.last_error.clone());
        kv("dataplane_active_sessions", self.dataplane.active_sessions.to_string());
        kv("dataplane_session_limit", self.dataplane.session_limit.to_string());
        kv("dataplane_sessions_created", self.dataplane.sessions_created.to_string());
        kv("dataplane_sessions_closed", self.dataplane.sessions_closed.to_string());
        kv("dataplane_packets_total", self.dataplane.packets_total.to_string());
        kv("dataplane_packets_encrypted", self.dataplane.packets_encrypted.to_string());
        kv("dataplane_packets_handshake", self.dataplane.packets_handshake.to_string());
        kv("dataplane_packets_dropped", self.dataplane.packets_dropped.to_string());
        kv(
            "dataplane_packets_parse_errors",
            self.dataplane.packets_parse_errors.to_string(),
        );
        kv(
            "dataplane_packets_route_errors",
            self.dataplane.packets_route_errors.to_string(),
        );
        kv(
            "dataplane_packets_rejected_limit",
            self.dataplane.packets_rejected_by_limit.to_string(),
        );
        kv(
            "dataplane_packets_rejected_dh_rate",
            self.dataplane.packets_rejected_by_dh.to_string(),
        );
        kv(
            "dataplane_packets_outbound_errors",
            self.dataplane.packets_outbound_errors.to_string(),
        );
        kv("dataplane_bytes_total", self.dataplane.bytes_total.to_string());
        kv("outbound_dials", self.outbound.dials.to_string());
        kv("outbound_dial_errors", self.outbound.dial_errors.to_string());
        kv("outbound_sends", self.outbound.sends.to_string());
        kv("outbound_send_errors", self.outbound.send_errors.to_string());
        kv("outbound_bytes_sent", self.outbound.bytes_sent.to_string());
        kv("outbound_responses", self.outbound.responses.to_string());
        kv("outbound_response_errors", self.outbound.response_errors.to_string());
        kv("outbound_response_bytes", self.outbound.response_bytes.to_string());
        kv("outbound_active_sends", self.outbound.active_sends.to_string());
        kv("outbound_active_conns", self.outbound.active_conns.to_string());
        kv("outbound_pool_hits", self.outbound.pool_hits.to_string());
        kv("outbound_pool_misses", self.outbound.pool_misses.to_string());
        kv("outbound_reconnects", self.outbound.reconnects.to_string());
        kv("outbound_idle_evictions", self.outbound.idle_evictions.to_string());
        kv("outbound_closed_after_send", self.outbound.closed_after_send.to_string());
        kv("ingress_active", self.ingress.active_connections.to_string());
        kv("ingress_accepted", self.ingress.accepted_connections.to_string());
        kv("ingress_accept_rate_limited", self.ingress.accept_rate_limited.to_string());
        kv("ingress_closed", self.ingress.closed_connections.to_string());
        kv("ingress_frames_received", self.ingress.frames_received.to_string());
        kv("ingress_frames_handled", self.ingress.frames_handled.to_string());
        kv("ingress_frames_returned", self.ingress.frames_returned.to_string());
        kv("ingress_frames_failed", self.ingress.frames_failed.to_string());
        kv("ingress_bytes_received", self.ingress.bytes_received.to_string());
        kv("ingress_bytes_returned", self.ingress.bytes_returned.to_string());
        kv("ingress_read_errors", self.ingress.read_errors.to_string());
        kv("ingress_write_errors", self.ingress.write_errors.to_string());
        kv("ingress_invalid_frames", self.ingress.invalid_frames.to_string());
        b
    }
}

fn unix_now() -> i64 {
    unix_seconds(SystemTime::now())
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Options;
    use crate::config::Manager;
    use crate::proxy::lifecycle::Lifecycle;

    fn runtime_with(content: &str) -> (tempfile::TempDir, Runtime) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("backend.conf");
        std::fs::write(&path, content).expect("write config");
        let rt = Runtime::new(Lifecycle::new(Manager::new(&path), Options::default()), 0, 0);
        (dir, rt)
    }

    fn value_of<'a>(body: &'a str, key: &str) -> Option<&'a str> {
        body.lines()
            .find_map(|l| l.strip_prefix(&format!("{key}\t")))
    }

    #[test]
    fn render_without_config() {
        let (_dir, rt) = runtime_with("proxy 10.0.0.1:1;\n");
        let body = rt.stats_snapshot().render_text();
        assert_eq!(value_of(&body, "has_current_config"), Some("0"));
        assert!(value_of(&body, "config_md5").is_none());
        assert_eq!(value_of(&body, "router_targets"), Some("0"));
    }

    #[test]
    fn render_with_config_contains_required_keys() {
        let (_dir, rt) = runtime_with("default 2;\nproxy_for 2 10.0.0.1:443;\n");
        let (snapshot, _) = rt.lifecycle().load_initial().expect("load");
        rt.apply_config(&snapshot.config);

        let body = rt.stats_snapshot().render_text();
        for key in [
            "stats_generated_at",
            "has_current_config",
            "config_filename",
            "config_loaded_at",
            "config_size",
            "config_md5",
            "config_auth_clusters",
            "router_default_cluster",
            "router_clusters",
            "router_targets",
            "targets_healthy",
            "targets_unhealthy",
            "bootstrap_warnings",
            "config_check_calls",
            "config_reload_calls",
            "config_reload_success",
            "config_reload_last_error",
            "forward_total",
            "forward_successful",
            "forward_failed",
            "forward_used_default",
            "forward_bytes",
            "forward_avg_payload_bytes",
            "forward_last_error",
            "dataplane_active_sessions",
            "dataplane_session_limit",
            "dataplane_sessions_created",
            "dataplane_sessions_closed",
            "dataplane_packets_total",
            "dataplane_packets_encrypted",
            "dataplane_packets_handshake",
            "dataplane_packets_dropped",
            "dataplane_packets_parse_errors",
            "dataplane_packets_route_errors",
            "dataplane_packets_rejected_limit",
            "dataplane_packets_rejected_dh_rate",
            "dataplane_packets_outbound_errors",
            "dataplane_bytes_total",
            "outbound_dials",
            "outbound_dial_errors",
            "outbound_sends",
            "outbound_send_errors",
            "outbound_bytes_sent",
            "outbound_responses",
            "outbound_response_errors",
            "outbound_response_bytes",
            "outbound_active_sends",
            "outbound_active_conns",
            "outbound_pool_hits",
            "outbound_pool_misses",
            "outbound_reconnects",
            "outbound_idle_evictions",
            "outbound_closed_after_send",
            "ingress_active",
            "ingress_accepted",
            "ingress_accept_rate_limited",
            "ingress_closed",
            "ingress_frames_received",
            "ingress_frames_handled",
            "ingress_frames_returned",
            "ingress_frames_failed",
            "ingress_bytes_received",
            "ingress_bytes_returned",
            "ingress_read_errors",
            "ingress_write_errors",
            "ingress_invalid_frames",
        ] {
            assert!(value_of(&body, key).is_some(), "missing key {key}");
        }

        assert_eq!(value_of(&body, "has_current_config"), Some("1"));
        assert_eq!(value_of(&body, "router_default_cluster"), Some("2"));
        assert_eq!(value_of(&body, "router_targets"), Some("1"));
        assert_eq!(value_of(&body, "targets_healthy"), Some("1"));
        assert_eq!(value_of(&body, "forward_avg_payload_bytes"), Some("0.000"));
    }

    #[test]
    fn every_line_is_key_tab_value() {
        let (_dir, rt) = runtime_with("proxy 10.0.0.1:1;\n");
        let body = rt.stats_snapshot().render_text();
        for line in body.lines() {
            let parts: Vec<&str> = line.splitn(2, '\t').collect();
            assert_eq!(parts.len(), 2, "line not key-tab-value: {line:?}");
            assert!(!parts[0].is_empty());
        }
    }
}
