use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mtproxy::cli::{self, Options};
use mtproxy::config::Manager;
use mtproxy::error::Result;
use mtproxy::logging::LogWriter;
use mtproxy::proxy::{
    ClientIngressConfig, ClientIngressServer, Lifecycle, OutboundConfig, OutboundProxy,
    OutboundSender, Runtime, StatsServer,
};
use mtproxy::supervisor;

const FULL_VERSION: &str = concat!("mtproto-proxy ", env!("CARGO_PKG_VERSION"));

const ENV_INGRESS_ADDR: &str = "MTPROXY_GO_INGRESS_ADDR";
const ENV_ENABLE_INGRESS: &str = "MTPROXY_GO_ENABLE_INGRESS";
const ENV_ENABLE_OUTBOUND: &str = "MTPROXY_GO_ENABLE_OUTBOUND";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut opts = match cli::parse(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Can not parse options: {e}");
            eprint!("{}", cli::usage("mtproto-proxy", FULL_VERSION));
            return ExitCode::from(2);
        }
    };

    if opts.show_help {
        print!("{}", cli::usage("mtproto-proxy", FULL_VERSION));
        return ExitCode::from(2);
    }

    let supervised_worker = supervisor::is_supervised_worker();
    if supervised_worker && opts.workers > 0 {
        opts.workers = 0;
    }

    let logw = match setup_logging(&opts, supervised_worker) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("can not initialize log writer: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    match runtime.block_on(run(opts, supervised_worker, logw)) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::from(1)
        }
    }
}

async fn run(opts: Options, supervised_worker: bool, logw: LogWriter) -> Result<ExitCode> {
    if opts.workers > 0 && !supervised_worker {
        info!(workers = opts.workers, "supervisor enabled");
        let reopen = logw.is_file().then(|| {
            let w = logw.clone();
            Box::new(move || w.reopen()) as Box<dyn Fn() -> std::io::Result<()> + Send>
        });
        return match supervisor::run_supervised_workers(opts.workers, reopen).await {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(e) => {
                error!(error = %e, "supervisor error");
                Ok(ExitCode::from(1))
            }
        };
    }

    let manager = Manager::new(&opts.config_file);
    let lifecycle = Lifecycle::new(manager, opts.clone());
    let rt = Arc::new(Runtime::new(
        lifecycle,
        opts.max_conn.max(0) as usize,
        opts.max_dh_accept_rate,
    ));
    info!("runtime enabled: send SIGHUP to reload config, SIGTERM/SIGINT to stop.");

    if logw.is_file() {
        let w = logw.clone();
        rt.set_log_reopener(move || w.reopen());
    }

    let mut stats_server = None;
    if opts.http_stats {
        match should_serve(supervised_worker, "stats") {
            Err(reason) => info!("{reason}"),
            Ok(()) => {
                if opts.local_port > 0 {
                    let addr = format!("127.0.0.1:{}", opts.local_port);
                    match StatsServer::start(rt.clone(), &addr).await {
                        Ok(server) => stats_server = Some(server),
                        Err(e) => warn!(
                            addr = %addr,
                            error = %e,
                            "failed to start stats server (continuing without stats server)"
                        ),
                    }
                } else {
                    info!("http-stats requested but local port is not a single value, skipping stats server startup");
                }
            }
        }
    }

    let mut ingress_server = None;
    if std::env::var(ENV_ENABLE_INGRESS).as_deref() == Ok("1") {
        match should_serve(supervised_worker, "ingress") {
            Err(reason) => info!("{reason}"),
            Ok(()) => {
                let addr = resolve_ingress_addr(&opts)?;
                let cfg = ClientIngressConfig {
                    addr,
                    target_dc: 0,
                    max_accept_rate: opts.max_accept_rate,
                    read_buf_bytes: opts.msg_buffers_size_bytes.clamp(0, i64::from(i32::MAX)) as usize,
                    secrets: opts.secrets.clone(),
                    ..ClientIngressConfig::default()
                };
                let server = ClientIngressServer::start(rt.clone(), cfg).await?;
                let stats_source = server.clone();
                rt.set_ingress_stats_provider(move || stats_source.stats());
                ingress_server = Some(server);
            }
        }
    }

    let mut outbound: Option<Arc<dyn OutboundSender>> = None;
    if std::env::var(ENV_ENABLE_OUTBOUND).as_deref() == Ok("1") {
        match should_serve(supervised_worker, "outbound") {
            Err(reason) => info!("{reason}"),
            Ok(()) => {
                let sender: Arc<dyn OutboundSender> =
                    Arc::new(OutboundProxy::new(outbound_config_from_env()?));
                rt.set_outbound_sender(sender.clone());
                outbound = Some(sender);
                info!("outbound transport enabled.");
            }
        }
    }

    let shutdown = CancellationToken::new();
    if supervised_worker {
        supervisor::spawn_parent_watch(shutdown.clone());
    }

    let run_result = rt.run(shutdown).await;

    if let Some(server) = stats_server {
        server.shutdown(SHUTDOWN_GRACE).await;
    }
    if let Some(server) = ingress_server {
        if let Err(e) = server.shutdown(SHUTDOWN_GRACE).await {
            warn!(error = %e, "ingress shutdown error");
        }
    }
    if let Some(sender) = outbound {
        sender.close().await;
    }

    match run_result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "signal loop error");
            Ok(ExitCode::from(1))
        }
    }
}

fn setup_logging(opts: &Options, supervised_worker: bool) -> std::io::Result<LogWriter> {
    let mut logw = if opts.log_file.is_empty() {
        LogWriter::stderr()
    } else {
        LogWriter::file(&opts.log_file)?
    };
    if supervised_worker {
        if let Some(id) = supervisor::current_worker_id() {
            logw = logw.with_worker_prefix(id);
        }
    }

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match opts.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(opts.log_file.is_empty())
                .with_writer(logw.clone()),
        )
        .init();
    Ok(logw)
}

/// In supervisor mode only worker 0 binds shared endpoints.
fn should_serve(supervised_worker: bool, what: &str) -> std::result::Result<(), String> {
    if !supervised_worker {
        return Ok(());
    }
    match supervisor::current_worker_id() {
        None => Err(format!(
            "{what} requested in supervisor mode but worker id is missing, skipping {what} startup"
        )),
        Some(0) => Ok(()),
        Some(id) => Err(format!(
            "{what} requested in supervisor mode, only worker 0 serves {what} (current worker={id}), skipping {what} startup"
        )),
    }
}

fn resolve_ingress_addr(opts: &Options) -> Result<String> {
    if let Ok(addr) = std::env::var(ENV_INGRESS_ADDR) {
        if !addr.is_empty() {
            return Ok(addr);
        }
    }
    if opts.local_port <= 0 {
        return Err(mtproxy::ProxyError::ConfigParse(format!(
            "ingress requires single local port (-p/--port), got {:?}",
            opts.local_port_raw
        )));
    }
    let host = if opts.bind_address.is_empty() {
        "0.0.0.0"
    } else {
        &opts.bind_address
    };
    Ok(format!("{host}:{}", opts.local_port))
}

fn outbound_config_from_env() -> Result<OutboundConfig> {
    let defaults = OutboundConfig::default();
    Ok(OutboundConfig {
        connect_timeout: duration_from_env_ms(
            "MTPROXY_GO_OUTBOUND_CONNECT_TIMEOUT_MS",
            defaults.connect_timeout,
        )?,
        write_timeout: duration_from_env_ms(
            "MTPROXY_GO_OUTBOUND_WRITE_TIMEOUT_MS",
            defaults.write_timeout,
        )?,
        read_timeout: duration_from_env_ms(
            "MTPROXY_GO_OUTBOUND_READ_TIMEOUT_MS",
            defaults.read_timeout,
        )?,
        idle_conn_timeout: duration_from_env_ms(
            "MTPROXY_GO_OUTBOUND_IDLE_TIMEOUT_MS",
            defaults.idle_conn_timeout,
        )?,
        max_frame_size: usize_from_env(
            "MTPROXY_GO_OUTBOUND_MAX_FRAME_SIZE",
            defaults.max_frame_size,
        )?,
        dialer: None,
    })
}

fn duration_from_env_ms(name: &str, fallback: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Err(_) => Ok(fallback),
        Ok(raw) if raw.is_empty() => Ok(fallback),
        Ok(raw) => {
            let ms: u64 = raw.parse().map_err(|_| {
                mtproxy::ProxyError::ConfigParse(format!("{name} must be integer milliseconds"))
            })?;
            Ok(Duration::from_millis(ms))
        }
    }
}

fn usize_from_env(name: &str, fallback: usize) -> Result<usize> {
    match std::env::var(name) {
        Err(_) => Ok(fallback),
        Ok(raw) if raw.is_empty() => Ok(fallback),
        Ok(raw) => {
            let v: usize = raw
                .parse()
                .map_err(|_| mtproxy::ProxyError::ConfigParse(format!("{name} must be integer")))?;
            if v < 1 {
                return Err(mtproxy::ProxyError::ConfigParse(format!("{name} must be >= 1")));
            }
            Ok(v)
        }
    }
}
