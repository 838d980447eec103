use crate::metrics::RelayMetrics;
use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::TcpListener;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug)]
pub struct AppError(anyhow::Error);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {:#}", self.0),
        )
            .into_response()
    }
}

// This enables using `?` on functions that return `Result<_, anyhow::Error>` to turn them into
// `Result<_, AppError>`. That way you don't need to do that manually.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub fn make_router(metrics: Arc<RelayMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(report_metrics))
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Bind the metrics/health listener and serve it on its own task,
/// independent of the SMTP listener. A bind failure here is fatal
/// for startup; failures after that only affect the http service.
pub fn start(listen: &str, metrics: Arc<RelayMetrics>) -> anyhow::Result<()> {
    let app = make_router(metrics);
    let socket = TcpListener::bind(listen).with_context(|| format!("listen on {listen}"))?;
    let addr = socket.local_addr()?;

    tracing::info!("http listener on {addr:?}");
    let server = axum_server::from_tcp(socket);
    tokio::spawn(async move {
        if let Err(err) = server.serve(app.into_make_service()).await {
            tracing::error!("http listener stopped: {err:#}");
        }
    });
    Ok(())
}

async fn report_metrics(State(metrics): State<Arc<RelayMetrics>>) -> Result<String, AppError> {
    Ok(metrics.render()?)
}

/// Always reports healthy: it deliberately checks neither the SMTP
/// listener nor upstream reachability, only that the process is
/// serving http.
async fn health_check() -> &'static str {
    "OK"
}
