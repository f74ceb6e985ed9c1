//! Backend configuration: the `proxy` / `proxy_for` directive grammar and the
//! snapshot manager that owns the current parsed state.
//!
//! Grammar: statements are `;`-terminated after `#` comments are stripped.
//!
//! ```text
//! timeout 504;
//! min_connections 2;
//! max_connections 8;
//! default 2;
//! proxy 203.0.113.5:8888;
//! proxy_for 2 [2001:db8::1]:443;
//! ```

pub mod manager;

pub use manager::{Manager, ManagerStats, Snapshot};

use std::path::Path;

use crate::error::{ProxyError, Result};

pub const DEFAULT_MIN_CONNECTIONS: i32 = 4;
pub const DEFAULT_MAX_CONNECTIONS: i32 = 8;

pub const MAX_CFG_CLUSTERS: usize = 1024;
pub const MAX_CFG_TARGETS: usize = 4096;

const MIN_TIMEOUT_MS: i32 = 10;
const MAX_TIMEOUT_MS: i32 = 30000;

/// One upstream endpoint. Identity is (cluster, host, port); the connection
/// bounds are whatever defaults were in effect at the directive site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub cluster_id: i32,
    pub host: String,
    pub port: u16,

    pub min_connections: i32,
    pub max_connections: i32,
}

impl Target {
    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity {
            cluster_id: self.cluster_id,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetIdentity {
    pub cluster_id: i32,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    pub id: i32,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub min_connections: i32,
    pub max_connections: i32,
    pub timeout_ms: i32,

    pub default_cluster_id: i32,
    pub have_proxy: bool,

    pub targets: Vec<Target>,
    pub clusters: Vec<Cluster>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout_ms: 300,
            default_cluster_id: 0,
            have_proxy: false,
            targets: Vec::new(),
            clusters: Vec::new(),
        }
    }
}

impl Config {
    pub fn cluster_by_id(&self, id: i32) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn default_cluster(&self) -> Option<&Cluster> {
        self.cluster_by_id(self.default_cluster_id)
    }
}

pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|e| ProxyError::ConfigRead {
        path: path.display().to_string(),
        source: e,
    })?;
    parse(&data)
}

pub fn parse(input: &str) -> Result<Config> {
    let mut cfg = Config::default();

    let cleaned = strip_comments(input);
    validate_semicolon_termination(&cleaned)?;

    let mut cluster_index_by_id = std::collections::HashMap::new();
    let mut last_cluster_id = 0i32;
    let mut have_any_cluster = false;

    for chunk in cleaned.split(';') {
        let stmt = chunk.trim();
        if stmt.is_empty() {
            continue;
        }
        let fields: Vec<&str> = stmt.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        match fields[0] {
            "timeout" => {
                if fields.len() != 2 {
                    return Err(parse_err(format!("invalid timeout directive: {stmt:?}")));
                }
                let ms: i32 = fields[1]
                    .parse()
                    .map_err(|_| parse_err(format!("invalid timeout value: {:?}", fields[1])))?;
                if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) {
                    return Err(parse_err(format!("invalid timeout: {ms}")));
                }
                cfg.timeout_ms = ms;
            }
            "min_connections" => {
                if fields.len() != 2 {
                    return Err(parse_err(format!("invalid min_connections directive: {stmt:?}")));
                }
                let v: i32 = fields[1].parse().map_err(|_| {
                    parse_err(format!("invalid min_connections value: {:?}", fields[1]))
                })?;
                if v < 1 || v > cfg.max_connections {
                    return Err(parse_err("invalid min connections".to_string()));
                }
                cfg.min_connections = v;
            }
            "max_connections" => {
                if fields.len() != 2 {
                    return Err(parse_err(format!("invalid max_connections directive: {stmt:?}")));
                }
                let v: i32 = fields[1].parse().map_err(|_| {
                    parse_err(format!("invalid max_connections value: {:?}", fields[1]))
                })?;
                if v < cfg.min_connections || v > 1000 {
                    return Err(parse_err("invalid max connections".to_string()));
                }
                cfg.max_connections = v;
            }
            "default" => {
                if fields.len() != 2 {
                    return Err(parse_err(format!("invalid default directive: {stmt:?}")));
                }
                cfg.default_cluster_id = parse_target_id(fields[1])?;
            }
            "proxy" => {
                if fields.len() != 2 {
                    return Err(parse_err(format!("invalid proxy directive: {stmt:?}")));
                }
                add_proxy_directive(
                    &mut cfg,
                    &mut cluster_index_by_id,
                    &mut last_cluster_id,
                    &mut have_any_cluster,
                    0,
                    fields[1],
                )?;
            }
            "proxy_for" => {
                if fields.len() != 3 {
                    return Err(parse_err(format!("invalid proxy_for directive: {stmt:?}")));
                }
                let cluster_id = parse_target_id(fields[1])?;
                add_proxy_directive(
                    &mut cfg,
                    &mut cluster_index_by_id,
                    &mut last_cluster_id,
                    &mut have_any_cluster,
                    cluster_id,
                    fields[2],
                )?;
            }
            _ => {
                return Err(parse_err("'proxy <ip>:<port>;' expected".to_string()));
            }
        }
    }

    if !cfg.have_proxy || cfg.clusters.is_empty() {
        return Err(parse_err(
            "expected to find a mtproto-proxy configuration with `proxy' directives".to_string(),
        ));
    }

    Ok(cfg)
}

fn add_proxy_directive(
    cfg: &mut Config,
    cluster_index_by_id: &mut std::collections::HashMap<i32, usize>,
    last_cluster_id: &mut i32,
    have_any_cluster: &mut bool,
    cluster_id: i32,
    raw_target: &str,
) -> Result<()> {
    if cfg.targets.len() >= MAX_CFG_TARGETS {
        return Err(parse_err(format!("too many targets ({})", cfg.targets.len())));
    }
    let target = parse_target(cluster_id, raw_target, cfg.min_connections, cfg.max_connections)?;
    cfg.targets.push(target.clone());
    cfg.have_proxy = true;

    match cluster_index_by_id.get(&cluster_id) {
        None => {
            if cfg.clusters.len() >= MAX_CFG_CLUSTERS {
                return Err(parse_err("too many auth clusters".to_string()));
            }
            cfg.clusters.push(Cluster {
                id: cluster_id,
                targets: vec![target],
            });
            cluster_index_by_id.insert(cluster_id, cfg.clusters.len() - 1);
        }
        Some(&idx) => {
            if *have_any_cluster && *last_cluster_id != cluster_id {
                return Err(parse_err(format!("proxies for dc {cluster_id} intermixed")));
            }
            cfg.clusters[idx].targets.push(target);
        }
    }
    *last_cluster_id = cluster_id;
    *have_any_cluster = true;
    Ok(())
}

fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.split('\n') {
        let line = match line.find('#') {
            Some(p) => &line[..p],
            None => line,
        };
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn validate_semicolon_termination(cleaned: &str) -> Result<()> {
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.ends_with(';') {
        return Ok(());
    }
    Err(parse_err("';' expected".to_string()))
}

fn parse_target_id(raw: &str) -> Result<i32> {
    let id: i64 = raw
        .parse()
        .map_err(|_| parse_err("invalid target id".to_string()))?;
    if !(-0x8000..0x8000).contains(&id) {
        return Err(parse_err(
            "invalid target id (integer -32768..32767 expected)".to_string(),
        ));
    }
    Ok(id as i32)
}

fn parse_target(cluster_id: i32, raw: &str, min_connections: i32, max_connections: i32) -> Result<Target> {
    let (host, port) =
        split_host_port_loose(raw).ok_or_else(|| parse_err(format!("invalid target format: {raw:?}")))?;
    let port: u32 = port
        .parse()
        .map_err(|_| parse_err(format!("invalid target port: {port:?}")))?;
    if port == 0 || port >= 65536 {
        return Err(parse_err(format!("port number {port} out of range")));
    }
    Ok(Target {
        cluster_id,
        host: host.to_string(),
        port: port as u16,
        min_connections,
        max_connections,
    })
}

/// Splits `host:port`. Accepts bracketed IPv6 (`[::1]:443`) and the loose
/// form where the rightmost `:` separates the port (`::1:443`).
fn split_host_port_loose(raw: &str) -> Option<(&str, &str)> {
    if raw.is_empty() {
        return None;
    }
    if let Some(rest) = raw.strip_prefix('[') {
        let end = rest.rfind("]:")?;
        let host = &rest[..end];
        let port = &rest[end + 2..];
        if host.is_empty() || port.is_empty() {
            return None;
        }
        return Some((host, port));
    }

    let sep = raw.rfind(':')?;
    if sep == 0 || sep == raw.len() - 1 {
        return None;
    }
    Some((&raw[..sep], &raw[sep + 1..]))
}

fn parse_err(msg: String) -> ProxyError {
    ProxyError::ConfigParse(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let cfg = parse("proxy 10.0.0.1:443;").expect("parse");
        assert!(cfg.have_proxy);
        assert_eq!(cfg.targets.len(), 1);
        assert_eq!(cfg.clusters.len(), 1);
        assert_eq!(cfg.clusters[0].id, 0);
        assert_eq!(cfg.targets[0].host, "10.0.0.1");
        assert_eq!(cfg.targets[0].port, 443);
        assert_eq!(cfg.targets[0].min_connections, DEFAULT_MIN_CONNECTIONS);
        assert_eq!(cfg.targets[0].max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn directives_and_comments() {
        let cfg = parse(
            "# backend map\n\
             timeout 504;\n\
             min_connections 2;\n\
             max_connections 6;\n\
             default 2;\n\
             proxy_for 2 10.0.0.1:8888; # primary\n\
             proxy_for 2 10.0.0.2:8888;\n",
        )
        .expect("parse");
        assert_eq!(cfg.timeout_ms, 504);
        assert_eq!(cfg.default_cluster_id, 2);
        assert_eq!(cfg.clusters.len(), 1);
        assert_eq!(cfg.clusters[0].targets.len(), 2);
        assert_eq!(cfg.targets[0].min_connections, 2);
        assert_eq!(cfg.targets[0].max_connections, 6);
    }

    #[test]
    fn per_site_connection_defaults() {
        let cfg = parse(
            "proxy 10.0.0.1:1;\n\
             min_connections 7;\n\
             max_connections 9;\n\
             proxy 10.0.0.2:2;\n",
        )
        .expect("parse");
        assert_eq!(cfg.targets[0].min_connections, DEFAULT_MIN_CONNECTIONS);
        assert_eq!(cfg.targets[0].max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(cfg.targets[1].min_connections, 7);
        assert_eq!(cfg.targets[1].max_connections, 9);
    }

    #[test]
    fn ipv6_bracketed_and_loose() {
        let cfg = parse("proxy [2001:db8::1]:443;\nproxy ::1:8443;").expect("parse");
        assert_eq!(cfg.targets[0].host, "2001:db8::1");
        assert_eq!(cfg.targets[0].port, 443);
        assert_eq!(cfg.targets[1].host, "::1");
        assert_eq!(cfg.targets[1].port, 8443);
    }

    #[test]
    fn missing_semicolon_rejected() {
        assert!(parse("proxy 10.0.0.1:443").is_err());
    }

    #[test]
    fn no_proxy_rejected() {
        assert!(parse("timeout 504;").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn intermixed_clusters_rejected() {
        let err = parse(
            "proxy_for 1 10.0.0.1:1;\n\
             proxy_for 2 10.0.0.2:2;\n\
             proxy_for 1 10.0.0.3:3;\n",
        )
        .expect_err("intermixed must fail");
        assert!(err.to_string().contains("intermixed"), "{err}");
    }

    #[test]
    fn adjacent_same_cluster_allowed() {
        let cfg = parse(
            "proxy_for 1 10.0.0.1:1;\n\
             proxy_for 1 10.0.0.2:2;\n\
             proxy_for 2 10.0.0.3:3;\n",
        )
        .expect("parse");
        assert_eq!(cfg.clusters.len(), 2);
    }

    #[test]
    fn cluster_id_range() {
        assert!(parse("proxy_for -32768 10.0.0.1:1;").is_ok());
        assert!(parse("proxy_for 32767 10.0.0.1:1;").is_ok());
        assert!(parse("proxy_for 32768 10.0.0.1:1;").is_err());
        assert!(parse("proxy_for -32769 10.0.0.1:1;").is_err());
    }

    #[test]
    fn timeout_bounds() {
        assert!(parse("timeout 9;\nproxy 10.0.0.1:1;").is_err());
        assert!(parse("timeout 30001;\nproxy 10.0.0.1:1;").is_err());
        assert!(parse("timeout 10;\nproxy 10.0.0.1:1;").is_ok());
        assert!(parse("timeout 30000;\nproxy 10.0.0.1:1;").is_ok());
    }

    #[test]
    fn min_above_max_rejected() {
        assert!(parse("min_connections 9;\nproxy 10.0.0.1:1;").is_err());
    }

    #[test]
    fn port_bounds() {
        assert!(parse("proxy 10.0.0.1:0;").is_err());
        assert!(parse("proxy 10.0.0.1:65536;").is_err());
        assert!(parse("proxy 10.0.0.1:65535;").is_ok());
    }

    #[test]
    fn unknown_directive_rejected() {
        let err = parse("listen 443;").expect_err("unknown directive");
        assert!(err.to_string().contains("'proxy <ip>:<port>;' expected"));
    }

    #[test]
    fn cluster_lookup() {
        let cfg = parse("default 2;\nproxy_for 2 10.0.0.1:1;").expect("parse");
        assert!(cfg.cluster_by_id(2).is_some());
        assert!(cfg.cluster_by_id(3).is_none());
        assert_eq!(cfg.default_cluster().expect("default").id, 2);
    }
}
