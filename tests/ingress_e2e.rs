//! End-to-end ingress tests: real client sockets against a running ingress
//! server, with a scripted outbound behind the runtime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cipher::StreamCipher;
use mtproxy::cli::Options;
use mtproxy::config::{Manager, Target};
use mtproxy::crypto::ctr_stream;
use mtproxy::proxy::client_transport::{derive_obfuscated_server_keys, TAG_PADDED};
use mtproxy::proxy::{
    ClientIngressConfig, ClientIngressServer, Lifecycle, OutboundSender, OutboundStats, Runtime,
    StatsServer,
};
use mtproxy::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const REQ_PQ: u32 = 0x60469778;

fn handshake_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 40];
    frame[16..20].copy_from_slice(&20i32.to_le_bytes());
    frame[20..24].copy_from_slice(&REQ_PQ.to_le_bytes());
    frame
}

/// Echoes every payload and records which targets were used.
struct EchoSender {
    targets: std::sync::Mutex<Vec<Target>>,
}

impl EchoSender {
    fn new() -> Arc<Self> {
        Arc::new(EchoSender {
            targets: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl OutboundSender for EchoSender {
    async fn exchange(&self, target: &Target, payload: &[u8]) -> Result<Option<Bytes>> {
        self.targets.lock().expect("targets lock").push(target.clone());
        Ok(Some(Bytes::copy_from_slice(payload)))
    }

    fn stats(&self) -> OutboundStats {
        OutboundStats::default()
    }

    async fn close(&self) {}
}

struct TestEnv {
    _dir: tempfile::TempDir,
    runtime: Arc<Runtime>,
    sender: Arc<EchoSender>,
}

async fn env_with(config: &str, max_conn: usize) -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("backend.conf");
    std::fs::write(&path, config).expect("write config");

    let lifecycle = Lifecycle::new(Manager::new(&path), Options::default());
    let runtime = Arc::new(Runtime::new(lifecycle, max_conn, 0));
    let (snapshot, _) = runtime.lifecycle().load_initial().expect("load config");
    runtime.apply_config(&snapshot.config);

    let sender = EchoSender::new();
    runtime.set_outbound_sender(sender.clone());

    TestEnv {
        _dir: dir,
        runtime,
        sender,
    }
}

async fn start_ingress(env: &TestEnv, cfg: ClientIngressConfig) -> Arc<ClientIngressServer> {
    let server = ClientIngressServer::start(env.runtime.clone(), cfg)
        .await
        .expect("start ingress");
    let stats_source = server.clone();
    env.runtime.set_ingress_stats_provider(move || stats_source.stats());
    server
}

fn local_ingress_config() -> ClientIngressConfig {
    ClientIngressConfig {
        addr: "127.0.0.1:0".into(),
        idle_timeout: Duration::from_secs(5),
        ..ClientIngressConfig::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Padded-mode frame as a client would put it on the wire.
fn encode_padded(payload: &[u8], pad: usize) -> Vec<u8> {
    let mut wire = Vec::with_capacity(4 + payload.len() + pad);
    wire.extend_from_slice(&((payload.len() + pad) as u32).to_le_bytes());
    wire.extend_from_slice(payload);
    wire.extend(std::iter::repeat(0xaau8).take(pad));
    wire
}

#[tokio::test]
async fn obfuscated_padded_round_trip() {
    let env = env_with("default 3;\nproxy_for 3 10.9.9.9:443;\n", 0).await;
    let secret = [0x5au8; 16];
    let server = start_ingress(
        &env,
        ClientIngressConfig {
            secrets: vec![secret],
            ..local_ingress_config()
        },
    )
    .await;

    // Client-side obfuscated2 header: bytes 0..56 are raw key material, the
    // encrypted tail carries tag 0xdddddddd and target DC 3.
    let mut header = [0u8; 64];
    for (i, b) in header.iter_mut().enumerate().take(56) {
        *b = (i as u8).wrapping_mul(7) | 1;
    }
    let (read_key, read_iv, write_key, write_iv) = derive_obfuscated_server_keys(&header, Some(&secret));

    let mut client_write = ctr_stream(&read_key, &read_iv);
    let mut full = [0u8; 64];
    full[..56].copy_from_slice(&header[..56]);
    full[56..60].copy_from_slice(&TAG_PADDED.to_le_bytes());
    full[60..62].copy_from_slice(&3i16.to_le_bytes());
    let mut encrypted = full;
    client_write.apply_keystream(&mut encrypted);
    header[56..].copy_from_slice(&encrypted[56..]);

    let mut client_read = ctr_stream(&write_key, &write_iv);

    let mut conn = TcpStream::connect(server.addr()).await.expect("connect");
    conn.write_all(&header).await.expect("send header");

    // One padded frame with a req_pq handshake inside.
    let frame = handshake_frame();
    let mut wire = encode_padded(&frame, 2);
    client_write.apply_keystream(&mut wire);
    conn.write_all(&wire).await.expect("send frame");

    // Read the padded response and decrypt it with the client read stream.
    let mut hdr = [0u8; 4];
    conn.read_exact(&mut hdr).await.expect("read length");
    client_read.apply_keystream(&mut hdr);
    let total = u32::from_le_bytes(hdr) as usize;
    assert!(total >= frame.len() && total <= frame.len() + 3, "length {total}");

    let mut body = vec![0u8; total];
    conn.read_exact(&mut body).await.expect("read body");
    client_read.apply_keystream(&mut body);
    assert_eq!(&body[..total & !3], &frame[..]);

    // The forward decision used the DC from the obfuscated header.
    let routed = env.sender.targets.lock().expect("targets lock").clone();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].cluster_id, 3);
    assert_eq!(routed[0].host, "10.9.9.9");

    let stats = server.stats();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.frames_returned, 1);

    server.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test]
async fn medium_transport_round_trip() {
    let env = env_with("default 1;\nproxy_for 1 10.0.0.1:443;\n", 0).await;
    let server = start_ingress(&env, local_ingress_config()).await;

    let mut conn = TcpStream::connect(server.addr()).await.expect("connect");
    conn.write_all(&0xeeeeeeeeu32.to_le_bytes()).await.expect("tag");

    let frame = handshake_frame();
    conn.write_all(&(frame.len() as u32).to_le_bytes()).await.expect("len");
    conn.write_all(&frame).await.expect("frame");

    let mut hdr = [0u8; 4];
    conn.read_exact(&mut hdr).await.expect("resp len");
    assert_eq!(u32::from_le_bytes(hdr) as usize, frame.len());
    let mut body = vec![0u8; frame.len()];
    conn.read_exact(&mut body).await.expect("resp body");
    assert_eq!(body, frame);

    server.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test]
async fn session_limit_rejects_second_connection() {
    let env = env_with("default 1;\nproxy_for 1 10.0.0.1:443;\n", 1).await;
    let server = start_ingress(&env, local_ingress_config()).await;

    let frame = handshake_frame();

    let mut first = TcpStream::connect(server.addr()).await.expect("connect");
    first.write_all(&0xeeeeeeeeu32.to_le_bytes()).await.expect("tag");
    first.write_all(&(frame.len() as u32).to_le_bytes()).await.expect("len");
    first.write_all(&frame).await.expect("frame");
    let mut hdr = [0u8; 4];
    first.read_exact(&mut hdr).await.expect("first client gets a response");

    let mut second = TcpStream::connect(server.addr()).await.expect("connect");
    second.write_all(&0xeeeeeeeeu32.to_le_bytes()).await.expect("tag");
    second.write_all(&(frame.len() as u32).to_le_bytes()).await.expect("len");
    second.write_all(&frame).await.expect("frame");

    let runtime = env.runtime.clone();
    wait_until(move || runtime.dataplane().stats().packets_rejected_by_limit == 1).await;
    assert_eq!(env.runtime.dataplane().stats().active_sessions, 1);

    server.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test]
async fn invalid_transport_header_closes_connection() {
    let env = env_with("proxy 10.0.0.1:443;\n", 0).await;
    let server = start_ingress(&env, local_ingress_config()).await;

    let mut conn = TcpStream::connect(server.addr()).await.expect("connect");
    // 64 bytes that decrypt to no known tag under no secrets.
    conn.write_all(&[0x42u8; 64]).await.expect("garbage header");

    let mut buf = [0u8; 1];
    let n = conn.read(&mut buf).await.expect("read eof");
    assert_eq!(n, 0, "server must close on invalid header");

    let server_clone = server.clone();
    wait_until(move || server_clone.stats().invalid_frames == 1).await;

    server.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test]
async fn stats_endpoint_serves_snapshot() {
    let env = env_with("default 2;\nproxy_for 2 10.0.0.1:443;\n", 0).await;
    let stats = StatsServer::start(env.runtime.clone(), "127.0.0.1:0")
        .await
        .expect("start stats");

    let mut conn = TcpStream::connect(stats.addr()).await.expect("connect");
    conn.write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("request");

    let mut response = Vec::new();
    conn.read_to_end(&mut response).await.expect("response");
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200"), "status line: {text}");
    assert!(text.contains("text/plain; charset=utf-8"));
    assert!(text.contains("has_current_config\t1"));
    assert!(text.contains("router_default_cluster\t2"));
    assert!(text.contains("dataplane_active_sessions\t0"));

    stats.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn accept_rate_limiter_counts_rejections() {
    let env = env_with("proxy 10.0.0.1:443;\n", 0).await;
    let server = start_ingress(
        &env,
        ClientIngressConfig {
            max_accept_rate: 1,
            ..local_ingress_config()
        },
    )
    .await;

    let mut conns = Vec::new();
    for _ in 0..5 {
        conns.push(TcpStream::connect(server.addr()).await.expect("connect"));
    }

    let server_clone = server.clone();
    wait_until(move || {
        let s = server_clone.stats();
        s.accepted_connections + s.accept_rate_limited >= 5 && s.accept_rate_limited >= 1
    })
    .await;

    server.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}
