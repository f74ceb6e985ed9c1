//! Error types shared across the proxy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Inbound frame failed MTProto classification.
    #[error("bad frame: {0}")]
    BadFrame(String),

    #[error("connection limit reached")]
    ConnectionLimitReached,

    #[error("dh accept rate exceeded")]
    DhRateExceeded,

    #[error("no healthy targets available for cluster {0}")]
    NoHealthyTargets(i32),

    #[error("cluster {0} has no targets")]
    ClusterNotFound(i32),

    #[error("outbound payload too large: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Write failed after the single reconnect retry was consumed.
    #[error("send frame after reconnect: {0}")]
    Send(std::io::Error),

    #[error("read response: {0}")]
    ResponseRead(String),

    #[error("{0}")]
    ConfigParse(String),

    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} exited unexpectedly")]
    WorkerExited(u32),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("outbound is closed")]
    OutboundClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn bad_frame(msg: impl Into<String>) -> Self {
        ProxyError::BadFrame(msg.into())
    }
}
