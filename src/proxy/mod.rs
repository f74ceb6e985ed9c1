//! The data plane and its control surfaces: routing, admission, pooled
//! outbound exchange, client ingress, lifecycle, and stats.

pub mod bootstrap;
pub mod client_ingress;
pub mod client_transport;
pub mod dataplane;
pub mod forwarder;
pub mod http_stats;
pub mod lifecycle;
pub mod outbound;
pub mod rate_limiter;
pub mod router;
pub mod runtime;
pub mod stats;

pub use bootstrap::{validate_bootstrap, BootstrapResult};
pub use client_ingress::{ClientIngressConfig, ClientIngressServer, IngressStats};
pub use dataplane::{DataPlane, DataPlaneStats};
pub use forwarder::{ForwardDecision, ForwardRequest, ForwardStats, Forwarder};
pub use http_stats::StatsServer;
pub use lifecycle::{Lifecycle, Signal, SignalAction};
pub use outbound::{
    OutboundConfig, OutboundDialer, OutboundProxy, OutboundSender, OutboundStats, TcpDialer,
};
pub use rate_limiter::FixedWindowRateLimiter;
pub use router::{ChooseResult, Router, RouterStats, TargetRandSource, ThreadRngSource};
pub use runtime::{HandledPacket, Runtime};
pub use stats::RuntimeStats;
