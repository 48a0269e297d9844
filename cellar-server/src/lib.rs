//! The JSON-over-HTTP secrets server: an axum router that dispatches the
//! `/api/<op>` endpoint set to [`cellar_core::facade::Database`], plus the
//! CSRF/content-type gate and identity resolution that happen ahead of
//! every handler.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use cellar_core::facade::Database;
use cellar_core::model::Caller;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod audit_file;
pub mod backup;
pub mod config;
pub mod handlers;
pub mod identity;
pub mod trace;

use identity::{caller_from_identity, IdentityOracle};

/// The CSRF/browser-lockout header every `/api/<op>` request must carry,
/// the way a transport-forbidden `Sec-*` header can never be set by a
/// browser's `fetch`/XHR/form submission.
pub const NO_BROWSERS_HEADER: &str = "sec-cellar-no-browsers";
pub const NO_BROWSERS_VALUE: &str = "1";

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub identity: Arc<dyn IdentityOracle>,
}

/// Extracts a [`Caller`] by resolving the connection's remote address
/// through the configured identity oracle and pulling its ACL rules from
/// its capability grant. A dedicated wrapper type is needed here rather
/// than implementing `FromRequestParts` on `Caller` itself -- neither the
/// trait nor the type live in this crate.
pub struct AuthenticatedCaller(pub Caller);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedCaller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default();

        let identity = state.identity.resolve(&addr).map_err(|err| {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        })?;

        let caller = caller_from_identity(identity)
            .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response())?;

        Ok(AuthenticatedCaller(caller))
    }
}

/// Every `/api/<op>` route is POST-only by contract; axum's default
/// response to a wrong method on a matched path is 405, but spec §4.4/§7
/// classify a wrong method as just another malformed request -- 400.
async fn reject_non_post() -> Response {
    (StatusCode::BAD_REQUEST, "expected POST").into_response()
}

async fn require_no_browsers_header(
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    match headers.get(NO_BROWSERS_HEADER) {
        Some(value) if value.as_bytes() == NO_BROWSERS_VALUE.as_bytes() => {}
        _ => return (StatusCode::FORBIDDEN, "missing CSRF header").into_response(),
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return (StatusCode::BAD_REQUEST, "expected application/json").into_response();
    }

    next.run(request).await
}

/// Builds the router. Callers decide how to serve it (`axum::serve`, or
/// `tower::ServiceExt::oneshot` in tests), which is why this crate exposes
/// the router as a library surface rather than only a `main`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/list", post(handlers::list).fallback(reject_non_post))
        .route("/info", post(handlers::info).fallback(reject_non_post))
        .route("/get", post(handlers::get).fallback(reject_non_post))
        .route("/put", post(handlers::put).fallback(reject_non_post))
        .route(
            "/activate",
            post(handlers::activate).fallback(reject_non_post),
        )
        .route("/delete", post(handlers::delete).fallback(reject_non_post))
        .route(
            "/delete-version",
            post(handlers::delete_version).fallback(reject_non_post),
        )
        .layer(middleware::from_fn(require_no_browsers_header));

    Router::new()
        .nest("/api", api)
        .route("/healthz", get(handlers::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
