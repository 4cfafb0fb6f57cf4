use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod realtime;
pub mod relay;
pub mod services;
pub mod storage;

use config::Config;
use realtime::Notifier;
use services::{AuthService, MessagingService, ModerationService, UserAdminService};
use storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, config: Config) -> Self {
        Self {
            store,
            notifier,
            config: Arc::new(config),
        }
    }

    pub fn auth(&self) -> AuthService {
        AuthService::new(self.store.clone(), self.config.clone())
    }

    pub fn messaging(&self) -> MessagingService {
        MessagingService::new(
            self.store.clone(),
            self.notifier.clone(),
            self.config.messaging.clone(),
        )
    }

    pub fn moderation(&self) -> ModerationService {
        ModerationService::new(
            self.store.clone(),
            self.notifier.clone(),
            self.config.messaging.clone(),
        )
    }

    pub fn user_admin(&self) -> UserAdminService {
        UserAdminService::new(self.store.clone(), self.config.security.bcrypt_cost)
    }
}

/// The full HTTP application: health check plus the `/api/v1` surface.
pub fn app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api::router::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
