mod ws;

use std::sync::atomic::Ordering;

use axum::{extract::State, http::HeaderValue, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::{state::AppState, utils::TraceLayerExt};

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.allowed_origins);
    Router::new()
        .route("/ws", get(ws::ws_connect))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .tracing_layer(state.settings.log)
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Minimal plain-text gauges; enough for a scrape to see the node is alive
/// and roughly how busy it is.
async fn metrics(State(state): State<AppState>) -> String {
    format!(
        "watchroom_sessions_active {}\nwatchroom_rooms_subscribed {}\nwatchroom_rooms_advancing {}\n",
        state.sessions_online.load(Ordering::Relaxed),
        state.hub.local_room_count(),
        state.advancers.watched_rooms(),
    )
}
