//! HTTP surface of the Kiln generation service.

pub mod handlers;
pub mod infra;
pub mod routes;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method},
    routing::get,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

pub use infra::app_state::AppState;

use crate::infra::config::CorsConfig;

fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let allow_origin = if cors.is_wildcard_included() {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|s| HeaderValue::from_str(s).ok())
            .collect();
        if origins.is_empty() {
            AllowOrigin::any()
        } else {
            AllowOrigin::list(origins)
        }
    };

    // Methods and headers are validated during config load.
    let methods: Vec<Method> = cors
        .allowed_methods
        .iter()
        .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
        .collect();
    let headers: Vec<HeaderName> = cors
        .allowed_headers
        .iter()
        .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
        .collect();

    let mut layer = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::list(headers));

    if cors.allow_credentials {
        layer = layer.allow_credentials(true);
    }

    layer
}

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config().server.body_limit_bytes;
    let cors = cors_layer(&state.config().cors);

    Router::new()
        .route("/health", get(handlers::health::health_handler))
        .merge(routes::create_api_router())
        // Each layer wraps the ones above it, so CORS runs first.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
