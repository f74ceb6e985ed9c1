//! Command-line options.
//!
//! The flag surface mirrors the C mtproto-proxy binary: clustered short
//! options, long options with `=` or a following argument, `--` to end
//! option parsing, and exactly one positional config file.

use std::net::IpAddr;

use crate::error::{ProxyError, Result};

pub const MAX_SECRETS: usize = 128;
pub const MAX_WORKERS: u32 = 256;
pub const MAX_HTTP_LISTEN_PORTS: usize = 128;
pub const MAX_NAT_INFO_RULES: usize = 16;
pub const DEFAULT_PING_INTERVAL: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatInfoRule {
    pub local: IpAddr,
    pub global: IpAddr,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub show_help: bool,

    pub verbosity: u32,
    pub enable_ipv6: bool,
    pub local_port_raw: String,
    pub local_port: i32,
    pub start_port: i32,
    pub end_port: i32,
    pub backlog: i32,
    pub max_conn: i32,
    pub log_file: String,
    pub username: String,
    pub daemonize: bool,
    pub nice_set: bool,
    pub nice_value: i32,

    pub msg_buffers_size_raw: String,
    pub msg_buffers_size_bytes: i64,

    pub aes_pwd_file: String,
    pub allow_skip_dh: bool,
    pub disable_tcp: bool,
    pub use_crc32c: bool,
    pub force_dh: bool,
    pub max_accept_rate: i64,
    pub max_dh_accept_rate: i64,
    pub bind_address: String,
    pub nat_info_rules: Vec<NatInfoRule>,

    pub http_stats: bool,
    pub max_special_connections: i32,
    pub window_clamp: i32,
    pub http_ports: Vec<u16>,
    pub workers: u32,
    pub ping_interval: f64,
    pub domains: Vec<String>,

    pub config_file: String,
    pub secrets: Vec<[u8; 16]>,
    pub proxy_tag: Option<[u8; 16]>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            show_help: false,
            verbosity: 0,
            enable_ipv6: false,
            local_port_raw: String::new(),
            local_port: 0,
            start_port: 0,
            end_port: 0,
            backlog: 0,
            max_conn: 0,
            log_file: String::new(),
            username: String::new(),
            daemonize: false,
            nice_set: false,
            nice_value: 0,
            msg_buffers_size_raw: String::new(),
            msg_buffers_size_bytes: 0,
            aes_pwd_file: String::new(),
            allow_skip_dh: false,
            disable_tcp: false,
            use_crc32c: false,
            force_dh: false,
            max_accept_rate: 0,
            max_dh_accept_rate: 0,
            bind_address: String::new(),
            nat_info_rules: Vec::new(),
            http_stats: false,
            max_special_connections: 0,
            window_clamp: 0,
            http_ports: Vec::new(),
            workers: 0,
            ping_interval: DEFAULT_PING_INTERVAL,
            domains: Vec::new(),
            config_file: String::new(),
            secrets: Vec::new(),
            proxy_tag: None,
        }
    }
}

pub fn parse(args: &[String]) -> Result<Options> {
    let mut opts = Options::default();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];

        if arg == "--" {
            positional.extend(args[i + 1..].iter().cloned());
            break;
        }

        if let Some(raw) = arg.strip_prefix("--") {
            if !raw.is_empty() {
                parse_long_option(&mut opts, raw, args, &mut i)?;
                i += 1;
                continue;
            }
        }

        if arg.starts_with('-') && arg != "-" {
            parse_short_options(&mut opts, &arg[1..], args, &mut i)?;
            i += 1;
            continue;
        }

        positional.push(arg.clone());
        i += 1;
    }

    if opts.secrets.len() > MAX_SECRETS {
        return Err(opts_err("too many mtproto secrets"));
    }
    if opts.workers > MAX_WORKERS {
        return Err(opts_err(format!(
            "workers out of range: {} (expected 0..{MAX_WORKERS})",
            opts.workers
        )));
    }
    if opts.http_ports.len() > MAX_HTTP_LISTEN_PORTS {
        return Err(opts_err(format!(
            "too many http ports: {} (max {MAX_HTTP_LISTEN_PORTS})",
            opts.http_ports.len()
        )));
    }
    if opts.nat_info_rules.len() > MAX_NAT_INFO_RULES {
        return Err(opts_err("too many rules in --nat-info"));
    }
    parse_local_port_range(&mut opts)?;

    if opts.show_help {
        return Ok(opts);
    }

    if positional.len() != 1 {
        return Err(opts_err("exactly one <config-file> argument is required"));
    }
    opts.config_file = positional.remove(0);
    Ok(opts)
}

fn parse_long_option(opts: &mut Options, raw: &str, args: &[String], i: &mut usize) -> Result<()> {
    let (name, inline_value) = match raw.find('=') {
        Some(p) => (&raw[..p], Some(raw[p + 1..].to_string())),
        None => (raw, None),
    };

    let take_value = |i: &mut usize| -> Result<String> {
        if let Some(v) = inline_value.clone() {
            return Ok(v);
        }
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| opts_err(format!("option --{name} requires a value")))
    };

    match name {
        "help" => opts.show_help = true,
        "http-stats" => opts.http_stats = true,
        "allow-skip-dh" => opts.allow_skip_dh = true,
        "disable-tcp" => opts.disable_tcp = true,
        "crc32c" => opts.use_crc32c = true,
        "force-dh" => opts.force_dh = true,
        "daemonize" => {
            opts.daemonize = match inline_value.as_deref() {
                None | Some("1") => true,
                Some("0") => false,
                Some(other) => return Err(opts_err(format!("invalid --daemonize value: {other:?}"))),
            };
        }
        "port" => {
            opts.local_port_raw = take_value(i)?;
        }
        "address" => opts.bind_address = take_value(i)?,
        "aes-pwd" => opts.aes_pwd_file = take_value(i)?,
        "mtproto-secret-file" => {
            let path = take_value(i)?;
            add_secrets_from_file(opts, &path)?;
        }
        "max-accept-rate" => {
            opts.max_accept_rate = parse_int(&take_value(i)?, "max-accept-rate")?;
        }
        "max-dh-accept-rate" => {
            opts.max_dh_accept_rate = parse_int(&take_value(i)?, "max-dh-accept-rate")?;
        }
        "nice" => {
            opts.nice_value = parse_int(&take_value(i)?, "nice")? as i32;
            opts.nice_set = true;
        }
        "nat-info" => {
            let v = take_value(i)?;
            for rule in v.split(',').filter(|s| !s.is_empty()) {
                opts.nat_info_rules.push(parse_nat_rule(rule)?);
            }
        }
        "msg-buffers-size" => {
            let v = take_value(i)?;
            opts.msg_buffers_size_bytes = parse_size_suffix(&v)?;
            opts.msg_buffers_size_raw = v;
        }
        other => return Err(opts_err(format!("unknown option --{other}"))),
    }
    Ok(())
}

fn parse_short_options(opts: &mut Options, cluster: &str, args: &[String], i: &mut usize) -> Result<()> {
    let chars: Vec<char> = cluster.chars().collect();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        match c {
            'v' => opts.verbosity += 1,
            '6' => opts.enable_ipv6 = true,
            'h' => opts.show_help = true,
            _ => {
                // Value-taking short: the value is the rest of the cluster
                // or the next argument.
                let value = if pos + 1 < chars.len() {
                    chars[pos + 1..].iter().collect::<String>()
                } else {
                    *i += 1;
                    args.get(*i)
                        .cloned()
                        .ok_or_else(|| opts_err(format!("option -{c} requires a value")))?
                };
                apply_short_value(opts, c, &value)?;
                return Ok(());
            }
        }
        pos += 1;
    }
    Ok(())
}

fn apply_short_value(opts: &mut Options, c: char, value: &str) -> Result<()> {
    match c {
        'p' => opts.local_port_raw = value.to_string(),
        'H' => {
            for tok in value.split(',').filter(|s| !s.is_empty()) {
                let port: u16 = tok
                    .parse()
                    .map_err(|_| opts_err(format!("invalid http port: {tok:?}")))?;
                opts.http_ports.push(port);
            }
        }
        'M' => {
            opts.workers = value
                .parse()
                .map_err(|_| opts_err(format!("invalid workers value: {value:?}")))?;
        }
        'u' => opts.username = value.to_string(),
        'b' => opts.backlog = parse_int(value, "b")? as i32,
        'c' => opts.max_conn = parse_int(value, "c")? as i32,
        'l' => opts.log_file = value.to_string(),
        'W' => opts.window_clamp = parse_int(value, "W")? as i32,
        'T' => {
            opts.ping_interval = value
                .parse()
                .map_err(|_| opts_err(format!("invalid ping interval: {value:?}")))?;
        }
        'S' => opts.secrets.push(parse_hex16(value, "mtproto secret")?),
        'P' => opts.proxy_tag = Some(parse_hex16(value, "proxy tag")?),
        'D' => opts.domains.push(value.to_string()),
        'C' => opts.max_special_connections = parse_int(value, "C")? as i32,
        other => return Err(opts_err(format!("unknown option -{other}"))),
    }
    Ok(())
}

/// Secrets files hold 32-hex-char tokens separated by whitespace or commas;
/// `#` starts a comment.
fn add_secrets_from_file(opts: &mut Options, path: &str) -> Result<()> {
    let data = std::fs::read_to_string(path).map_err(|e| ProxyError::ConfigRead {
        path: path.to_string(),
        source: e,
    })?;
    for line in data.lines() {
        let line = match line.find('#') {
            Some(p) => &line[..p],
            None => line,
        };
        for tok in line.split(|c: char| c.is_whitespace() || c == ',') {
            if tok.is_empty() {
                continue;
            }
            opts.secrets.push(parse_hex16(tok, "mtproto secret")?);
            if opts.secrets.len() > MAX_SECRETS {
                return Err(opts_err("too many mtproto secrets"));
            }
        }
    }
    Ok(())
}

fn parse_local_port_range(opts: &mut Options) -> Result<()> {
    if opts.local_port_raw.is_empty() {
        return Ok(());
    }
    match opts.local_port_raw.split_once(':') {
        None => {
            opts.local_port = parse_port(&opts.local_port_raw)?;
        }
        Some((lo, hi)) => {
            opts.start_port = parse_port(lo)?;
            opts.end_port = parse_port(hi)?;
            if opts.start_port > opts.end_port {
                return Err(opts_err(format!(
                    "invalid port range: {}",
                    opts.local_port_raw
                )));
            }
        }
    }
    Ok(())
}

fn parse_port(raw: &str) -> Result<i32> {
    let port: i32 = raw
        .parse()
        .map_err(|_| opts_err(format!("invalid port: {raw:?}")))?;
    if !(1..=65535).contains(&port) {
        return Err(opts_err(format!("port out of range: {port}")));
    }
    Ok(port)
}

fn parse_nat_rule(raw: &str) -> Result<NatInfoRule> {
    let (local, global) = raw
        .split_once(':')
        .ok_or_else(|| opts_err(format!("invalid nat-info rule: {raw:?}")))?;
    let local: IpAddr = local
        .parse()
        .map_err(|_| opts_err(format!("invalid nat-info local address: {local:?}")))?;
    let global: IpAddr = global
        .parse()
        .map_err(|_| opts_err(format!("invalid nat-info global address: {global:?}")))?;
    Ok(NatInfoRule { local, global })
}

/// `N[kmgt]` with binary multipliers.
fn parse_size_suffix(raw: &str) -> Result<i64> {
    if raw.is_empty() {
        return Err(opts_err("empty size value"));
    }
    let (digits, mult) = match raw.chars().last() {
        Some('k') | Some('K') => (&raw[..raw.len() - 1], 1i64 << 10),
        Some('m') | Some('M') => (&raw[..raw.len() - 1], 1i64 << 20),
        Some('g') | Some('G') => (&raw[..raw.len() - 1], 1i64 << 30),
        Some('t') | Some('T') => (&raw[..raw.len() - 1], 1i64 << 40),
        _ => (raw, 1i64),
    };
    let n: i64 = digits
        .parse()
        .map_err(|_| opts_err(format!("invalid size value: {raw:?}")))?;
    n.checked_mul(mult)
        .ok_or_else(|| opts_err(format!("size value overflow: {raw:?}")))
}

fn parse_hex16(raw: &str, what: &str) -> Result<[u8; 16]> {
    if raw.len() != 32 {
        return Err(opts_err(format!(
            "invalid {what}: expected 32 hex characters, got {}",
            raw.len()
        )));
    }
    let bytes = hex::decode(raw).map_err(|_| opts_err(format!("invalid {what}: not hex")))?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_int(raw: &str, what: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| opts_err(format!("invalid {what} value: {raw:?}")))
}

fn opts_err(msg: impl Into<String>) -> ProxyError {
    ProxyError::ConfigParse(msg.into())
}

pub fn usage(prog: &str, version: &str) -> String {
    format!(
        "{prog} ({version})\n\
         usage: {prog} [options] <config-file>\n\
         \n\
         \t-v\traise verbosity (repeatable)\n\
         \t-6\tenable IPv6\n\
         \t-p <port>[:<port>]\tlocal port or port range\n\
         \t-H <ports>\tcomma-separated client (HTTP) ports\n\
         \t-M <workers>\tspawn workers (0..{MAX_WORKERS})\n\
         \t-u <user>\tchange user\n\
         \t-b <backlog>\tlisten backlog\n\
         \t-c <max-conn>\tmax client connections\n\
         \t-l <log>\tlog file\n\
         \t-W <clamp>\tTCP window clamp\n\
         \t-T <secs>\tping interval (default {DEFAULT_PING_INTERVAL})\n\
         \t-S <secret>\t16-byte secret in hex mode\n\
         \t-P <tag>\t16-byte proxy tag in hex mode\n\
         \t-D <domain>\tTLS domain\n\
         \t-C <conns>\tmax special connections\n\
         \t--aes-pwd <file>\tcrypto password file\n\
         \t--mtproto-secret-file <file>\tfile with 16-byte secrets in hex\n\
         \t--http-stats\texpose stats via http\n\
         \t--allow-skip-dh\tallow skipping DH during RPC handshake\n\
         \t--disable-tcp\tdo not listen for raw tcp connections\n\
         \t--crc32c\tuse crc32c instead of crc32 for RPC\n\
         \t--force-dh\tforce DH during RPC handshake\n\
         \t--max-accept-rate <n>\tmax connection accepts per second\n\
         \t--max-dh-accept-rate <n>\tmax DH connection accepts per second\n\
         \t--address <addr>\tbind address\n\
         \t--nat-info <local>:<global>[,...]\tNAT translation rules (max {MAX_NAT_INFO_RULES})\n\
         \t--nice <v>\tset niceness\n\
         \t--msg-buffers-size <N[kmgt]>\ttotal message buffer size\n\
         \t--daemonize[=0|1]\tdaemonize\n\
         \t--help\tthis help\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn minimal_invocation() {
        let opts = parse(&args(&["backend.conf"])).expect("parse");
        assert_eq!(opts.config_file, "backend.conf");
        assert_eq!(opts.workers, 0);
        assert!((opts.ping_interval - DEFAULT_PING_INTERVAL).abs() < f64::EPSILON);
    }

    #[test]
    fn config_file_required() {
        assert!(parse(&args(&[])).is_err());
        assert!(parse(&args(&["a.conf", "b.conf"])).is_err());
    }

    #[test]
    fn help_skips_config_requirement() {
        let opts = parse(&args(&["--help"])).expect("parse");
        assert!(opts.show_help);
    }

    #[test]
    fn short_flags_cluster() {
        let opts = parse(&args(&["-vv6", "backend.conf"])).expect("parse");
        assert_eq!(opts.verbosity, 2);
        assert!(opts.enable_ipv6);
    }

    #[test]
    fn short_value_inline_and_separate() {
        let opts = parse(&args(&["-p8888", "backend.conf"])).expect("parse");
        assert_eq!(opts.local_port, 8888);

        let opts = parse(&args(&["-p", "8888", "backend.conf"])).expect("parse");
        assert_eq!(opts.local_port, 8888);
    }

    #[test]
    fn port_range() {
        let opts = parse(&args(&["-p", "8000:8003", "backend.conf"])).expect("parse");
        assert_eq!(opts.start_port, 8000);
        assert_eq!(opts.end_port, 8003);
        assert_eq!(opts.local_port, 0);

        assert!(parse(&args(&["-p", "9000:8000", "backend.conf"])).is_err());
    }

    #[test]
    fn workers_range() {
        let opts = parse(&args(&["-M", "4", "backend.conf"])).expect("parse");
        assert_eq!(opts.workers, 4);
        assert!(parse(&args(&["-M", "257", "backend.conf"])).is_err());
    }

    #[test]
    fn secrets_parse() {
        let hex = "000102030405060708090a0b0c0d0e0f";
        let opts = parse(&args(&["-S", hex, "backend.conf"])).expect("parse");
        assert_eq!(opts.secrets.len(), 1);
        assert_eq!(opts.secrets[0][0], 0);
        assert_eq!(opts.secrets[0][15], 0x0f);

        assert!(parse(&args(&["-S", "abcd", "backend.conf"])).is_err());
        assert!(parse(&args(&["-S", "zz0102030405060708090a0b0c0d0e0f", "backend.conf"])).is_err());
    }

    #[test]
    fn secret_file_with_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secrets");
        std::fs::write(
            &path,
            "# comment line\n\
             000102030405060708090a0b0c0d0e0f, 101112131415161718191a1b1c1d1e1f\n\
             202122232425262728292a2b2c2d2e2f # trailing comment\n",
        )
        .expect("write secrets");

        let opts = parse(&args(&[
            "--mtproto-secret-file",
            path.to_str().expect("utf8 path"),
            "backend.conf",
        ]))
        .expect("parse");
        assert_eq!(opts.secrets.len(), 3);
    }

    #[test]
    fn long_option_forms() {
        let opts = parse(&args(&[
            "--address=127.0.0.1",
            "--max-accept-rate",
            "100",
            "--http-stats",
            "backend.conf",
        ]))
        .expect("parse");
        assert_eq!(opts.bind_address, "127.0.0.1");
        assert_eq!(opts.max_accept_rate, 100);
        assert!(opts.http_stats);
    }

    #[test]
    fn msg_buffers_size_suffixes() {
        for (raw, want) in [("1024", 1024i64), ("4k", 4 << 10), ("2M", 2 << 20), ("1g", 1 << 30)] {
            let opts =
                parse(&args(&["--msg-buffers-size", raw, "backend.conf"])).expect("parse");
            assert_eq!(opts.msg_buffers_size_bytes, want, "suffix {raw}");
        }
        assert!(parse(&args(&["--msg-buffers-size", "x", "backend.conf"])).is_err());
    }

    #[test]
    fn nat_info_rules() {
        let opts = parse(&args(&["--nat-info", "10.0.0.1:203.0.113.1", "backend.conf"])).expect("parse");
        assert_eq!(opts.nat_info_rules.len(), 1);
        assert!(parse(&args(&["--nat-info", "10.0.0.1", "backend.conf"])).is_err());
    }

    #[test]
    fn daemonize_forms() {
        assert!(parse(&args(&["--daemonize", "backend.conf"])).expect("parse").daemonize);
        assert!(parse(&args(&["--daemonize=1", "backend.conf"])).expect("parse").daemonize);
        assert!(!parse(&args(&["--daemonize=0", "backend.conf"])).expect("parse").daemonize);
        assert!(parse(&args(&["--daemonize=2", "backend.conf"])).is_err());
    }

    #[test]
    fn double_dash_ends_options() {
        let opts = parse(&args(&["--", "-weird-name.conf"])).expect("parse");
        assert_eq!(opts.config_file, "-weird-name.conf");
    }

    #[test]
    fn unknown_options_rejected() {
        assert!(parse(&args(&["--frobnicate", "backend.conf"])).is_err());
        assert!(parse(&args(&["-z", "x", "backend.conf"])).is_err());
    }

    #[test]
    fn http_ports_csv() {
        let opts = parse(&args(&["-H", "80,8080", "backend.conf"])).expect("parse");
        assert_eq!(opts.http_ports, vec![80, 8080]);
    }

    #[test]
    fn usage_mentions_all_sections() {
        let text = usage("mtproto-proxy", "test");
        for needle in ["-S <secret>", "--mtproto-secret-file", "--nat-info", "--msg-buffers-size"] {
            assert!(text.contains(needle), "usage missing {needle}");
        }
    }
}
