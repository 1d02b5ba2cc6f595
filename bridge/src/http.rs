use crate::connection::ConnectionState;
use crate::metrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct AppState {
    connection: watch::Receiver<ConnectionState>,
}

pub fn create_router(connection: watch::Receiver<ConnectionState>) -> Router {
    let state = AppState { connection };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let current = *state.connection.borrow();
    match current {
        ConnectionState::Connected => (StatusCode::OK, current.to_string()).into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, current.to_string()).into_response(),
    }
}
