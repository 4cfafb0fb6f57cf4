use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppResult,
    models::{MessageFilter, MessagePage, Role, User},
    realtime::Committed,
    services::{auth::Claims, users::UserUpdate},
    storage::DeletedMessage,
    AppState,
};

use super::super::middleware::identity;

// Message moderation

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(filter): Query<MessageFilter>,
) -> AppResult<Json<MessagePage>> {
    let page = state
        .moderation()
        .search_messages(&identity(&claims), filter)
        .await?;

    Ok(Json(page))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<i64>,
) -> AppResult<Json<Committed<DeletedMessage>>> {
    let deleted = state
        .moderation()
        .delete_message(&identity(&claims), message_id)
        .await?;

    Ok(Json(deleted))
}

// User administration

pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<Vec<User>>> {
    let users = state.user_admin().list_users(&identity(&claims)).await?;
    Ok(Json(users))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<User>> {
    let user = state
        .user_admin()
        .get_user(&identity(&claims), user_id)
        .await?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[validate(length(max = 100))]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Role,
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    req.validate()?;

    let user = state
        .user_admin()
        .create_user(
            &identity(&claims),
            &req.email,
            &req.password,
            req.name.as_deref(),
            req.role,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(length(max = 100))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub role: Option<Role>,
    #[validate(length(min = 8, max = 128))]
    pub password: Option<String>,
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> AppResult<Json<User>> {
    req.validate()?;

    let user = state
        .user_admin()
        .update_user(
            &identity(&claims),
            user_id,
            UserUpdate {
                name: req.name,
                email: req.email,
                role: req.role,
                password: req.password,
            },
        )
        .await?;

    Ok(Json(user))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<DeleteResponse>> {
    state
        .user_admin()
        .delete_user(&identity(&claims), user_id)
        .await?;

    Ok(Json(DeleteResponse { ok: true }))
}
