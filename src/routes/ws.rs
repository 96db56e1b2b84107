use std::{collections::HashMap, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, HeaderMap},
    response::Response,
};

use crate::{
    auth,
    room::session,
    state::{AppError, AppResult, AppState},
    store::ratelimit,
    utils::now_ms,
};

/// The single client entry point: rate limit by source address, authenticate
/// the bearer token, then hand the socket to a session task.
pub async fn ws_connect(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> AppResult<Response> {
    let ip = addr.ip();

    let decision = ratelimit::consume(
        &state.cache,
        &format!("rl:conn:{ip}"),
        state.settings.conn_policy(),
        now_ms(),
    )
    .await;
    if !decision.allowed {
        return Err(AppError::rate_limited(decision.retry_after_ms));
    }

    let token = bearer_token(&params, &headers).unwrap_or_default();
    let user = auth::verify_bearer(&state.settings, &state.http, &token).await?;

    Ok(ws.on_upgrade(move |socket| session::run(socket, state, user, ip)))
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// arrive as a query parameter instead of an Authorization header.
fn bearer_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.get("token") {
        return Some(token.clone());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn query_token_wins_over_the_header() {
        let mut params = HashMap::new();
        params.insert("token".to_owned(), "from-query".to_owned());
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(bearer_token(&params, &headers).as_deref(), Some("from-query"));
    }

    #[test]
    fn header_token_requires_the_bearer_scheme() {
        let params = HashMap::new();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&params, &headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&params, &headers).as_deref(), Some("abc"));
    }
}
