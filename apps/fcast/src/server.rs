// SPDX-FileCopyrightText: © 2025 Framecast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use opentelemetry::{global, KeyValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn};

use framecast_store::{ChunkStore, PgFrameRepo};

use crate::config::Config;
use crate::state::AppState;
use crate::{streams, ws};

static HTTP_METRICS: OnceLock<(
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Histogram<f64>,
)> = OnceLock::new();

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: the server is only useful when the database answers.
async fn ready_handler(State(app_state): State<Arc<AppState>>) -> Response {
    match app_state.repo.ping().await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(err) => {
            warn!(error = %err, "Readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database is not ready").into_response()
        },
    }
}

async fn cache_stats_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app_state.store.stats())
}

/// Matches a request origin against a configured pattern.
///
/// Supports wildcard patterns in origins:
/// - `*` - Allow all origins
/// - `http://localhost:*` - Match any port on localhost
/// - Exact origins like `https://example.com`
fn origin_matches_pattern(origin: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    // Handle wildcard port matching (e.g., "http://localhost:*")
    if let Some(prefix_without_port) = pattern.strip_suffix(":*") {
        let Some(rest) = origin.strip_prefix(prefix_without_port) else {
            return false;
        };

        let Some(port_str) = rest.strip_prefix(':') else {
            return false;
        };

        return !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit());
    }

    origin == pattern
}

fn create_cors_layer(config: &crate::config::CorsConfig) -> CorsLayer {
    use axum::http::{HeaderValue, Method};

    if config.allowed_origins.iter().any(|o| o == "*") {
        info!("CORS configured to allow all origins (permissive mode)");
        return CorsLayer::permissive();
    }

    if config.allowed_origins.is_empty() {
        info!("CORS configured with no allowed origins (most restrictive)");
        return CorsLayer::new();
    }

    let patterns: Vec<String> = config.allowed_origins.clone();

    info!(
        allowed_origins = ?patterns,
        "CORS configured with origin allowlist"
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _request_parts| {
        let Ok(origin_str) = origin.to_str() else {
            return false;
        };

        patterns.iter().any(|pattern| origin_matches_pattern(origin_str, pattern))
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
}

async fn metrics_middleware(req: axum::http::Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    // Extract matched path for metrics, falling back to the full URI path if no match
    let path = req.extensions().get::<MatchedPath>().map_or_else(
        || req.uri().path().to_owned(),
        |matched_path| matched_path.as_str().to_owned(),
    );

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let (counter, histogram) = HTTP_METRICS
        .get_or_init(|| {
            let meter = global::meter("fcast_server");
            (
                meter.u64_counter("http.server.requests").build(),
                meter.f64_histogram("http.server.duration").build(),
            )
        })
        .clone();

    let labels = [
        KeyValue::new("http.method", method.to_string()),
        KeyValue::new("http.route", path),
        KeyValue::new("http.status_code", status),
    ];

    counter.add(1, &labels);
    histogram.record(latency, &labels);

    response
}

/// Creates the Axum application with all routes and middleware.
pub fn create_app(app_state: Arc<AppState>) -> Router {
    let cors_layer = create_cors_layer(&app_state.config.server.cors);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .route("/api/v1/cache/stats", get(cache_stats_handler))
        .route(
            "/api/v1/streams",
            get(streams::list_streams_handler),
        )
        .route(
            "/api/v1/streams/{id}",
            get(streams::get_stream_handler).put(streams::update_stream_handler),
        )
        .route("/v1/streams/{id}/ws", get(ws::stream_ws_handler))
        .with_state(app_state)
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let route = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map_or_else(|| request.uri().path(), |matched| matched.as_str());
                    tracing::info_span!("http_request", http_method = %request.method(), http_route = %route)
                })
                // Keep per-request logs out of INFO hot paths; surface failures at WARN.
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(cors_layer)
}

/// Connects to Postgres, builds the shared cache and serves the API.
///
/// # Errors
///
/// Returns an error if the address cannot be parsed, the database pool
/// cannot be established, TLS material cannot be loaded, or the listener
/// fails.
///
/// # Panics
///
/// Panics if the Ctrl+C or SIGTERM handler cannot be installed (critical OS
/// failure).
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let repo = PgFrameRepo::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.acquire_timeout(),
    )
    .await?;
    info!(max_connections = config.database.max_connections, "Connected to database");

    let repo = Arc::new(repo);
    let store = ChunkStore::new(repo.clone(), config.cache.store_config());
    let app_state =
        Arc::new(AppState::new(store, repo, Arc::new(config.clone())));
    let app = create_app(app_state);

    let addr: SocketAddr = config.server.address.parse()?;

    // Set up graceful shutdown signal handler
    // These expect() calls are justified and documented in the function's # Panics section
    #[allow(clippy::expect_used)]
    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                info!("Received CTRL-C signal, initiating graceful shutdown");
            },
            () = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown");
            },
        }
    };

    if config.server.tls {
        if config.server.cert_path.is_empty() || config.server.key_path.is_empty() {
            return Err("TLS is enabled but cert_path or key_path is not configured".into());
        }

        info!(
            address = %addr,
            cert_path = %config.server.cert_path,
            key_path = %config.server.key_path,
            "Starting HTTPS API server"
        );

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.server.cert_path,
            &config.server.key_path,
        )
        .await
        .map_err(|e| {
            error!(
                error = %e,
                cert_path = %config.server.cert_path,
                key_path = %config.server.key_path,
                "Failed to load TLS certificates"
            );
            e
        })?;

        let handle = axum_server::Handle::new();

        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal.await;
                handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
            }
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| {
                error!(error = %e, "API server error");
                e.into()
            })
    } else {
        info!(address = %addr, "Starting HTTP API server");

        let handle = axum_server::Handle::new();

        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal.await;
                handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
            }
        });

        axum_server::bind(addr).handle(handle).serve(app.into_make_service()).await.map_err(|e| {
            error!(error = %e, "API server error");
            e.into()
        })
    }
}

#[cfg(test)]
mod cors_tests {
    use super::origin_matches_pattern;

    #[test]
    fn cors_wildcard_port_matches_localhost_port_only() {
        assert!(origin_matches_pattern("http://localhost:8080", "http://localhost:*"));
        assert!(origin_matches_pattern("https://localhost:12345", "https://localhost:*"));

        assert!(!origin_matches_pattern("http://localhost", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost:abc", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://localhost123:8080", "http://localhost:*"));
        assert!(!origin_matches_pattern("http://127.0.0.1:8080", "http://localhost:*"));
    }

    #[test]
    fn cors_exact_match_only() {
        assert!(origin_matches_pattern("https://example.com", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com:443", "https://example.com"));
        assert!(!origin_matches_pattern("https://example.com", "https://example.com:*"));
    }
}
