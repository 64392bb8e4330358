pub mod config;
pub mod geo;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;
pub mod socket;
pub mod store;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use socketioxide::extract::SocketRef;
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use proxima_shared::types::auth::JwtSecret;

use crate::config::AppConfig;
use crate::services::{IdentityService, LocationIndex, MatchEngine, MessagingChannel};
use crate::store::Stores;

/// Profile updates may carry a data URI photo of up to 2 MB.
const PROFILE_BODY_LIMIT: usize = 3 * 1024 * 1024;

pub struct AppState {
    pub config: AppConfig,
    pub identity: IdentityService,
    pub locations: Arc<LocationIndex>,
    pub matches: MatchEngine,
    pub chat: MessagingChannel,
    pub io: SocketIo,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: AppConfig, stores: Stores, io: SocketIo, metrics_handle: Option<PrometheusHandle>) -> Self {
        Self {
            identity: IdentityService::new(stores.users.clone(), config.password_min_len),
            locations: Arc::new(LocationIndex::new(
                stores.locations.clone(),
                stores.users.clone(),
                config.location.clone(),
            )),
            matches: MatchEngine::new(stores.likes.clone(), stores.users.clone()),
            chat: MessagingChannel::new(
                stores.messages.clone(),
                stores.users.clone(),
                config.messaging.max_message_len,
            ),
            io,
            metrics_handle,
            config,
        }
    }
}

impl JwtSecret for AppState {
    fn jwt_secret(&self) -> &str {
        &self.config.jwt_secret
    }
}

/// Builds the HTTP router with the Socket.IO layer attached.
pub fn build_app(
    config: AppConfig,
    stores: Stores,
    metrics_handle: Option<PrometheusHandle>,
) -> (Router, Arc<AppState>) {
    // io lives in AppState so REST routes can emit too
    let (sio_layer, io) = SocketIo::builder().build_layer();
    let state = Arc::new(AppState::new(config, stores, io.clone(), metrics_handle));

    io.ns("/", {
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                socket::handlers::on_connect(socket, state).await;
            }
        }
    });

    let api = Router::new()
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login))
        .route("/location/update", post(routes::location::update_location))
        .route("/location/nearby", get(routes::location::nearby))
        .route("/matches/like", post(routes::matches::like))
        .route("/matches/:user_id", get(routes::matches::list_matches))
        .route(
            "/profile/update",
            put(routes::profile::update_profile).layer(DefaultBodyLimit::max(PROFILE_BODY_LIMIT)),
        )
        .route("/profile/:user_id", get(routes::profile::get_profile))
        .route("/chat/send", post(routes::chat::send_message))
        .route("/chat/:user_id/:other_user_id", get(routes::chat::history));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .nest("/api", api)
        .layer(sio_layer)
        // outside the Socket.IO layer so polling and upgrade requests are counted
        .layer(axum::middleware::from_fn(proxima_shared::middleware::metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    (app, state)
}
