use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{config::AppConfig, handlers, state::AppState};

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .route("/liveness", get(handlers::liveness))
        .route("/readiness", get(handlers::readiness))
        .route("/policies", get(handlers::list_policies))
        .route("/policy/import", post(handlers::import))
        .route(
            "/policy/import/config",
            get(handlers::list_import_configs).post(handlers::save_import_config),
        )
        .route(
            "/policy/{repository}/{group}/{name}/{version}/evaluation",
            post(handlers::evaluate),
        )
        .route(
            "/policy/{repository}/{group}/{name}/{version}/lock",
            post(handlers::lock).delete(handlers::unlock),
        )
        .route(
            "/policy/{repository}/{group}/{name}/{version}/export",
            get(handlers::export),
        )
        .route(
            "/policy/{repository}/{group}/{name}/{version}/notifychange",
            post(handlers::subscribe),
        )
        .with_state(state)
        // Middleware stack (outermost last: request id -> trace -> cors -> body limit)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub struct OctopolicyServer {
    addr: SocketAddr,
    app: Router,
}

impl OctopolicyServer {
    pub fn new(state: AppState, cfg: &AppConfig) -> Self {
        Self {
            addr: cfg.addr(),
            app: build_app(state, cfg),
        }
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
