//! API Integration Tests
//!
//! Exercises the `/api/v1` surface end to end against the in-memory store
//! and a recording notifier.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use murmur_backend::{
    app,
    config::Config,
    models::Role,
    realtime::{MemoryNotifier, Room},
    storage::MemoryStore,
    AppState,
};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<MemoryStore>,
    notifier: Arc<MemoryNotifier>,
}

fn create_test_app() -> TestApp {
    let mut config = Config::load();
    config.security.bcrypt_cost = 4;

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let state = AppState::new(store.clone(), notifier.clone(), config);

    TestApp {
        router: app(state.clone()),
        state,
        store,
        notifier,
    }
}

impl TestApp {
    async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    /// Registers a user and returns `(user id, access token)`.
    async fn register(&self, email: &str, name: &str) -> (String, String) {
        let (status, body) = self
            .request(
                Method::POST,
                "/api/v1/auth/register",
                None,
                Some(json!({ "email": email, "password": "password123", "name": name })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        (
            body["user"]["id"].as_str().unwrap().to_string(),
            body["accessToken"].as_str().unwrap().to_string(),
        )
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app();
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_register_and_login() {
    let app = create_test_app();
    let (user_id, _) = app.register("ada@example.com", "Ada").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": "ada@example.com", "password": "password123" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["id"], user_id.as_str());
    assert!(body["user"].get("passwordHash").is_none());

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": "ada@example.com", "password": "wrong-password" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_duplicate_and_invalid_registration() {
    let app = create_test_app();
    app.register("ada@example.com", "Ada").await;

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(json!({ "email": "ADA@example.com", "password": "password123" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(json!({ "email": "not-an-email", "password": "password123" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let app = create_test_app();

    let (status, body) = app
        .request(Method::GET, "/api/v1/messages/unread", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = app
        .request(Method::GET, "/api/v1/conversations", Some("garbage"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_send_then_read_flow() {
    let app = create_test_app();
    let (alice_id, alice) = app.register("alice@example.com", "Alice").await;
    let (bob_id, bob) = app.register("bob@example.com", "Bob").await;

    let (status, sent) = app
        .request(
            Method::POST,
            "/api/v1/messages/send",
            Some(&alice),
            Some(json!({ "recipientIds": [bob_id], "body": "hi bob" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", sent);
    assert_eq!(sent["message"]["content"], "hi bob");
    assert_eq!(sent["message"]["sender"]["id"], alice_id.as_str());
    assert_eq!(sent["delivery"]["failed"], 0);
    let conversation_id = sent["conversationId"].as_i64().unwrap();

    let bob_room = Room::user(bob_id.parse().unwrap());
    assert!(!app.notifier.emitted_to(&bob_room).await.is_empty());

    let (status, unread) = app
        .request(Method::GET, "/api/v1/messages/unread", Some(&bob), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(unread["totalUnread"], 1);

    let (_, list) = app
        .request(Method::GET, "/api/v1/conversations", Some(&bob), None)
        .await;
    assert_eq!(list[0]["id"], conversation_id);
    assert_eq!(list[0]["type"], "direct");
    assert_eq!(list[0]["unreadCount"], 1);
    assert_eq!(list[0]["latestMessage"]["content"], "hi bob");

    let (_, messages) = app
        .request(
            Method::GET,
            &format!("/api/v1/conversations/{}/messages?take=10", conversation_id),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(messages.as_array().unwrap().len(), 1);

    // Non-positive page sizes fall back to the default.
    let (status, messages) = app
        .request(
            Method::GET,
            &format!("/api/v1/conversations/{}/messages?take=0", conversation_id),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 1);

    let (status, receipt) = app
        .request(
            Method::POST,
            &format!("/api/v1/conversations/{}/read", conversation_id),
            Some(&bob),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["userId"], bob_id.as_str());

    let (_, unread) = app
        .request(Method::GET, "/api/v1/messages/unread", Some(&bob), None)
        .await;
    assert_eq!(unread["totalUnread"], 0);
}

#[tokio::test]
async fn test_send_requires_a_destination() {
    let app = create_test_app();
    let (_, alice) = app.register("alice@example.com", "Alice").await;

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/messages/send",
            Some(&alice),
            Some(json!({ "body": "to nobody" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/messages/send",
            Some(&alice),
            Some(json!({ "conversationId": 42, "body": "hello" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_routes_check_role() {
    let app = create_test_app();
    let (_, user) = app.register("user@example.com", "User").await;

    let (status, _) = app
        .request(Method::GET, "/api/v1/admin/messages", Some(&user), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = app
        .store
        .insert_user("root@example.com", Some("Root"), Role::Administrator)
        .await;
    let token = app.state.auth().issue_token(&admin).unwrap().access_token;

    let (status, page) = app
        .request(
            Method::GET,
            "/api/v1/admin/messages?take=5",
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["take"], 5);
    assert_eq!(page["total"], 0);

    let (status, users) = app
        .request(Method::GET, "/api/v1/admin/users", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users.as_array().unwrap().len(), 2);

    let (status, _) = app
        .request(
            Method::DELETE,
            &format!("/api/v1/admin/users/{}", admin.id),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
