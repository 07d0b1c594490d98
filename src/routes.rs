// routes.rs
use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{guard::VOTER_TOKEN, handlers, state::AppState};

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/polls", get(handlers::list_polls).post(handlers::create_poll))
        .route("/polls/{id}", get(handlers::get_poll).delete(handlers::delete_poll))
        .route("/polls/{id}/close", post(handlers::close_poll))
        .route("/polls/{id}/tallies", get(handlers::get_tallies))
        .route("/polls/{id}/reconcile", post(handlers::reconcile_tallies))
        .route("/polls/{id}/vote-status", get(handlers::vote_status))
        .route("/polls/{id}/events", get(handlers::poll_events))
        .route("/votes", post(handlers::cast_vote))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(VOTER_TOKEN)])
        .max_age(Duration::from_secs(60 * 60));

    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .map_err(|_| warn!("Ignoring invalid CORS origin {origin}"))
                .ok()
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(allowed))
}
