use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Router};
use tokio::sync::watch;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    leadership: watch::Receiver<bool>,
}

/// Probe router, served on the health address by every replica.
pub fn health_app(leadership: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/live", routing::get(live_handler))
        .route("/healthz", routing::get(healthz_handler))
        .with_state(AppState { leadership })
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Prometheus exposition router, served on the metrics address.
pub fn metrics_app() -> Router {
    Router::new()
        .route("/metrics", routing::get(metrics_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Fails once this replica is no longer eligible to reconcile, so the
/// orchestrator restarts it.
async fn live_handler(State(state): State<AppState>) -> impl IntoResponse {
    if *state.leadership.borrow() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "leadership lost")
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Metrics::global().render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_follows_the_leadership_channel() {
        let (tx, rx) = watch::channel(true);
        let ok = live_handler(State(AppState {
            leadership: rx.clone(),
        }))
        .await
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);

        tx.send(false).unwrap();
        let failing = live_handler(State(AppState { leadership: rx }))
            .await
            .into_response();
        assert_eq!(failing.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
