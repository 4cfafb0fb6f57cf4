use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use super::{handlers, middleware::auth_middleware};
use crate::AppState;

pub fn create_router(state: AppState) -> Router<AppState> {
    // Public auth routes
    let auth_routes = Router::new()
        .route("/register", post(handlers::auth::register))
        .route("/login", post(handlers::auth::login));

    // Conversation routes (protected)
    let conversation_routes = Router::new()
        .route("/", get(handlers::conversations::get_conversations))
        .route("/:id/messages", get(handlers::conversations::get_messages))
        .route("/:id/read", post(handlers::conversations::mark_read))
        .route("/:id/typing", post(handlers::conversations::send_typing))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Message routes (protected)
    let message_routes = Router::new()
        .route("/send", post(handlers::messages::send_message))
        .route("/unread", get(handlers::messages::get_unread_summary))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Admin routes (protected; the role is checked against the store per request)
    let admin_routes = Router::new()
        .route("/messages", get(handlers::admin::list_messages))
        .route("/messages/:id", delete(handlers::admin::delete_message))
        .route(
            "/users",
            get(handlers::admin::list_users).post(handlers::admin::create_user),
        )
        .route(
            "/users/:id",
            get(handlers::admin::get_user)
                .put(handlers::admin::update_user)
                .delete(handlers::admin::delete_user),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Combine all routes
    Router::new()
        .nest("/auth", auth_routes)
        .nest("/conversations", conversation_routes)
        .nest("/messages", message_routes)
        .nest("/admin", admin_routes)
        .with_state(state)
}
