use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, Method, header},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    AppState,
    middleware::{auth_middleware, client_ip, log_errors, rate_gate},
    routes,
    storage::MAX_UPLOAD_BODY_BYTES,
};

fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login))
        .route("/rate-limiter", post(routes::rate_limiter::check_rate_limit))
        .route("/push-subscriptions/vapid-key", get(routes::push::vapid_public_key))
        // admin surfaces authenticate with X-Admin-Token instead of a session
        .route("/data-cleanup", post(routes::admin::data_cleanup))
        .route("/geofence-notifications", post(routes::admin::run_geofence_scan))
}

fn protected_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/logout", post(routes::auth::logout))
        .route("/auth/password", post(routes::auth::change_password))
        .route(
            "/audit",
            get(routes::audit::list_audit).post(routes::audit::record_audit),
        )
        .route(
            "/notifications",
            get(routes::notifications::get_notifications)
                .post(routes::notifications::update_notifications),
        )
        .route(
            "/push-subscriptions",
            post(routes::push::subscribe).delete(routes::push::unsubscribe),
        )
        .route(
            "/geofences",
            get(routes::geofences::list_geofences)
                .post(routes::geofences::create_geofence)
                .delete(routes::geofences::delete_geofence),
        )
        .route(
            "/locations",
            get(routes::geofences::list_locations).post(routes::geofences::report_location),
        )
        .route("/geofence-events", get(routes::geofences::list_geofence_events))
        .route("/calendar-export", get(routes::calendar::export_calendar))
        .route(
            "/family-wallet",
            get(routes::wallet::query_wallet).post(routes::wallet::update_wallet),
        )
        .route(
            "/check-limits",
            get(routes::billing::check_limit).post(routes::billing::increment_limit),
        )
        .route(
            "/subscription",
            get(routes::billing::get_subscription).post(routes::billing::update_subscription),
        )
        .route(
            "/health-profile",
            get(routes::health_profile::get_health_profile)
                .put(routes::health_profile::save_health_profile),
        )
        .merge(upload_routes())
        .layer(from_fn_with_state(state.clone(), auth_middleware))
}

/// Base64 bodies of up to `MAX_OBJECT_BYTES` decoded, so the size check in
/// the uploader answers instead of the default body limit.
fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/upload-file", post(routes::uploads::upload_file))
        .route("/upload-medical", post(routes::uploads::upload_medical))
        .route("/upload-trip-photo", post(routes::uploads::upload_trip_photo))
        .route("/upload-family-logo", post(routes::uploads::upload_family_logo))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES))
}

/// Preflight answers for browser clients on any origin.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-auth-token"),
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-admin-token"),
        ])
        .expose_headers([
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
        ])
        .max_age(Duration::from_secs(86400))
}

/// The API under `config.api_base_uri` with the request pipeline applied:
/// CORS, client IP, rate gate, then per-route authentication. 5xx bodies are
/// logged on the way out.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(public_routes())
        .merge(protected_routes(&state));

    Router::new()
        .nest(&state.config.api_base_uri, api)
        .layer(from_fn_with_state(state.clone(), rate_gate))
        .layer(from_fn(client_ip))
        .layer(from_fn(log_errors))
        .layer(cors())
        .with_state(state)
}
