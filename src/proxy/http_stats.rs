//! Loopback HTTP endpoint exposing the stats snapshot as plain text.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router as HttpRouter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::proxy::runtime::Runtime;

pub struct StatsServer {
    local_addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    served: tokio::task::JoinHandle<()>,
}

async fn stats_handler(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        rt.stats_snapshot().render_text(),
    )
}

pub fn stats_router(rt: Arc<Runtime>) -> HttpRouter {
    HttpRouter::new().route("/stats", get(stats_handler)).with_state(rt)
}

impl StatsServer {
    pub async fn start(rt: Arc<Runtime>, addr: &str) -> Result<StatsServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let app = stats_router(rt);
        let token = shutdown.clone();
        let served = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "stats server error");
            }
        });

        info!(addr = %local_addr, "stats server listening");
        Ok(StatsServer {
            local_addr,
            shutdown,
            served,
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(grace, self.served).await;
    }
}
