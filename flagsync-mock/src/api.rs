use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::Stream;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use shared::{AuthResponse, TokenClaims};

use crate::state::{ControlPlane, RecordedRequest, StreamFrame};

type Params = Vec<(String, String)>;

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn is_authorized(state: &ControlPlane, headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .is_some_and(|key| key == state.sdk_key())
}

fn record(state: &ControlPlane, path: String, params: &Params, headers: &HeaderMap) {
    let no_cache = headers
        .get(header::CACHE_CONTROL)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|v| v.contains("no-cache"));
    state.record(RecordedRequest {
        path,
        query: params.clone(),
        no_cache,
    });
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "message": "Invalid SDK key" })),
    )
        .into_response()
}

async fn auth(
    State(state): State<ControlPlane>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Response {
    record(&state, "/v2/auth".into(), &params, &headers);
    if !is_authorized(&state, &headers) {
        return unauthorized();
    }
    if !state.push_enabled() {
        return Json(AuthResponse {
            push_enabled: false,
            token: String::new(),
            conn_delay: None,
        })
        .into_response();
    }

    let capability: serde_json::Map<String, serde_json::Value> = state
        .channels()
        .into_iter()
        .map(|c| (c, serde_json::json!(["subscribe"])))
        .collect();
    let iat = shared::util::now_secs();
    let claims = TokenClaims {
        capability: serde_json::Value::Object(capability).to_string(),
        iat,
        exp: iat + state.token_lifetime_secs(),
    };
    match claims.sign(state.jwt_secret().as_bytes()) {
        Ok(token) => Json(AuthResponse {
            push_enabled: true,
            token,
            conn_delay: state.conn_delay(),
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn parse_since(params: &Params) -> Option<i64> {
    param(params, "since").and_then(|s| s.parse().ok())
}

async fn split_changes(
    State(state): State<ControlPlane>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Response {
    record(&state, "/splitChanges".into(), &params, &headers);
    if !is_authorized(&state, &headers) {
        return unauthorized();
    }
    match parse_since(&params) {
        Some(since) => Json(state.flag_changes(since)).into_response(),
        None => (StatusCode::BAD_REQUEST, "missing since").into_response(),
    }
}

async fn segment_changes(
    State(state): State<ControlPlane>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Response {
    record(&state, format!("/segmentChanges/{name}"), &params, &headers);
    if !is_authorized(&state, &headers) {
        return unauthorized();
    }
    match parse_since(&params) {
        Some(since) => Json(state.segment_changes(&name, since)).into_response(),
        None => (StatusCode::BAD_REQUEST, "missing since").into_response(),
    }
}

async fn my_segments(
    State(state): State<ControlPlane>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Response {
    record(&state, format!("/mySegments/{key}"), &params, &headers);
    if !is_authorized(&state, &headers) {
        return unauthorized();
    }
    Json(state.memberships(&key)).into_response()
}

fn frames(
    rx: tokio::sync::mpsc::UnboundedReceiver<StreamFrame>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        let event = match frame {
            StreamFrame::Message(data) => Event::default().event("message").data(data),
            StreamFrame::Error(data) => Event::default().event("error").data(data),
        };
        Some((Ok(event), rx))
    })
}

/// Signature and expiry check of a token issued by [`auth`]
fn verify_token(state: &ControlPlane, token: &str) -> Result<TokenClaims, jsonwebtoken::errors::Error> {
    decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret().as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
}

async fn sse(
    State(state): State<ControlPlane>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Response {
    record(&state, "/sse".into(), &params, &headers);
    let token = param(&params, "accessToken").unwrap_or_default();
    if let Err(e) = verify_token(&state, token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "code": 40101, "statusCode": 401, "message": e.to_string() })),
        )
            .into_response();
    }
    if let Some((status, code, message)) = state.stream_rejection() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED);
        return (
            status,
            Json(serde_json::json!({
                "code": code,
                "statusCode": status.as_u16(),
                "message": message,
            })),
        )
            .into_response();
    }

    tracing::debug!(
        channels = param(&params, "channels").unwrap_or_default(),
        "Stream client connected"
    );
    let rx = state.subscribe();
    Sse::new(frames(rx))
        .keep_alive(KeepAlive::new().interval(state.heartbeat()))
        .into_response()
}

pub fn router(state: ControlPlane) -> Router {
    Router::new()
        .route("/v2/auth", get(auth))
        .route("/splitChanges", get(split_changes))
        .route("/segmentChanges/{name}", get(segment_changes))
        .route("/mySegments/{key}", get(my_segments))
        .route("/sse", get(sse))
        .with_state(state)
}
