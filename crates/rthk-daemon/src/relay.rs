/// HTTP fetch relay for browser clients.
///
/// The broadcaster's pages and timetable endpoint send no CORS headers, so a
/// browser UI cannot fetch them directly.  This serves:
///
///   GET /api/proxy/*url           fetch the percent-encoded target URL
///   GET /api/timetable?channel=&date=
///
/// Upstream status, content-type and body pass through unchanged.  Relay
/// failures come back as JSON `{ "error": ... }`: 400 for a bad target, 502
/// when the upstream cannot be reached, 504 when it does not answer in time.
use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use rthk_proto::config::RelayConfig;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

const DEFAULT_CHANNEL: &str = "radio2";

#[derive(Clone)]
pub struct RelayState {
    client: Client,
    timetable_url: String,
}

impl RelayState {
    pub fn new(config: &RelayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(config.user_agent.clone())
            .default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    reqwest::header::ACCEPT_LANGUAGE,
                    reqwest::header::HeaderValue::from_str(&config.accept_language)?,
                );
                h
            })
            .build()?;
        Ok(Self {
            client,
            timetable_url: config.timetable_url.clone(),
        })
    }
}

#[derive(Debug)]
enum RelayError {
    BadTarget(String),
    Timeout(String),
    Upstream(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            RelayError::BadTarget(m) => (StatusCode::BAD_REQUEST, m),
            RelayError::Timeout(m) => (StatusCode::GATEWAY_TIMEOUT, m),
            RelayError::Upstream(m) => (StatusCode::BAD_GATEWAY, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Route handlers ────────────────────────────────────────────────────────────

async fn proxy(
    Path(target): Path<String>,
    RawQuery(query): RawQuery,
    State(state): State<RelayState>,
) -> Result<Response, RelayError> {
    let mut target = target;
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        target.push(if target.contains('?') { '&' } else { '?' });
        target.push_str(&q);
    }
    let url = parse_target(&target)?;
    forward(&state.client, url).await
}

async fn timetable(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<RelayState>,
) -> Result<Response, RelayError> {
    let param = |long: &str, short: &str| {
        params
            .get(long)
            .or_else(|| params.get(short))
            .filter(|v| !v.is_empty())
            .cloned()
    };
    let channel = param("channel", "c").unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
    let date = param("date", "d").unwrap_or_else(|| hk_date(Utc::now()));

    let target = state
        .timetable_url
        .replace("{date}", &urlencoding::encode(&date))
        .replace("{channel}", &urlencoding::encode(&channel));
    let url = parse_target(&target)?;
    forward(&state.client, url).await
}

fn parse_target(target: &str) -> Result<Url, RelayError> {
    let url = Url::parse(target)
        .map_err(|e| RelayError::BadTarget(format!("invalid target url {:?}: {}", target, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::BadTarget(format!(
            "unsupported scheme {:?}",
            other
        ))),
    }
}

async fn forward(client: &Client, url: Url) -> Result<Response, RelayError> {
    debug!("relay: GET {}", url);
    let upstream = client.get(url.clone()).send().await.map_err(|e| {
        warn!("relay: upstream {} failed: {}", url, e);
        if e.is_timeout() {
            RelayError::Timeout(format!("upstream timed out: {}", url))
        } else {
            RelayError::Upstream(format!("upstream unreachable: {}", e))
        }
    })?;

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(ct) = upstream.headers().get(reqwest::header::CONTENT_TYPE) {
        if let Ok(hv) = header::HeaderValue::from_bytes(ct.as_bytes()) {
            builder = builder.header(header::CONTENT_TYPE, hv);
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| RelayError::Upstream(e.to_string()))
}

/// Broadcast date in Hong Kong (UTC+8, no DST) as `YYYYMMDD`.
pub fn hk_date(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::hours(8))
        .format("%Y%m%d")
        .to_string()
}

// ── Server startup ────────────────────────────────────────────────────────────

pub fn router(config: &RelayConfig) -> anyhow::Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(86400));

    Ok(Router::new()
        .route("/api/proxy/*url", get(proxy))
        .route("/api/timetable", get(timetable))
        .layer(cors)
        .with_state(RelayState::new(config)?))
}

pub fn start_server(config: &RelayConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(config)?;
    let addr = format!("{}:{}", config.bind_address, config.port);

    Ok(tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind relay on {}: {}", addr, e);
                return;
            }
        };
        info!("Fetch relay listening on http://{}", addr);
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Relay server error: {}", e);
        }
    }))
}
