use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde_json::{json, Value};

use super::{success, success_with, user_summary, JsonBody, QueryParams};
use crate::app::AppState;
use crate::audit::log_activity;
use crate::database::UserChanges;
use crate::errors::ApiError;
use crate::models::{
    CreateApiKeyRequest, CreateUserRequest, ListQuery, Pagination, Permissions, UpdateUserRequest,
};
use crate::security::{display_prefix, generate_api_key, require_scope, ApiKeyContext};
use crate::validation;

pub const ADMIN_SCOPE: &str = "admin";

const USERS_PAGE_SIZE: u32 = 10;
const LOGS_PAGE_SIZE: u32 = 50;

pub async fn list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    QueryParams(query): QueryParams<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;

    let (page, limit) = (query.page(), query.limit(USERS_PAGE_SIZE));
    let (users, total) = state.db.list_users(page, limit, query.search.as_deref())?;
    let users: Vec<Value> = users.iter().map(user_summary).collect();

    Ok(success_with(
        "Users retrieved",
        json!({
            "users": users,
            "pagination": Pagination::new(page, limit, total),
        }),
    ))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;

    let user = state.db.get_user(&user_id)?.ok_or(ApiError::UserNotFound)?;
    Ok(success_with("User retrieved", json!({ "user": user_summary(&user) })))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<CreateUserRequest>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;
    validation::create_user(&payload)?;

    // Admin-created accounts skip email confirmation.
    let user = state
        .identity
        .create_user(payload.email.trim(), &payload.password, payload.role_id, true)
        .await?;

    log_activity(
        &state.db,
        None,
        "admin_create_user",
        json!({ "user_id": user.id, "email": user.email, "role_id": payload.role_id }),
        &headers,
    );

    Ok(success_with("User created", json!({ "user": user_summary(&user) })))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<UpdateUserRequest>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;
    let status = validation::update_user(&payload)?;

    let changes = UserChanges {
        email: payload.email.as_deref().map(|e| e.trim().to_string()),
        role_id: payload.role_id,
        status,
    };
    state.db.update_user(&user_id, &changes)?;

    log_activity(
        &state.db,
        None,
        "admin_update_user",
        json!({ "user_id": user_id, "changes": payload }),
        &headers,
    );

    let user = state.db.get_user(&user_id)?.ok_or(ApiError::UserNotFound)?;
    Ok(success_with("User updated", json!({ "user": user_summary(&user) })))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;

    state.db.delete_user(&user_id)?;

    log_activity(
        &state.db,
        None,
        "admin_delete_user",
        json!({ "user_id": user_id }),
        &headers,
    );

    Ok(success("User deleted"))
}

pub async fn list_logs(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    QueryParams(query): QueryParams<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;

    let (page, limit) = (query.page(), query.limit(LOGS_PAGE_SIZE));
    let (logs, total) = state.db.list_audit_logs(page, limit)?;

    Ok(Json(json!({
        "status": "success",
        "message": "Audit logs retrieved",
        "data": logs,
        "pagination": Pagination::new(page, limit, total),
    })))
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;

    let keys = state.db.list_api_keys()?;
    Ok(success_with("API keys retrieved", json!({ "api_keys": keys })))
}

/// The plaintext key appears in this response only; listings show the prefix.
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<CreateApiKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;
    validation::create_api_key(&payload)?;

    let (key_value, key_hash) = generate_api_key();
    let permissions = Permissions::new(payload.permissions.iter().map(|p| p.trim()));
    let key = state.db.create_api_key(
        payload.key_name.trim(),
        &key_hash,
        &display_prefix(&key_value),
        &permissions,
        payload.expires_at,
        None,
    )?;

    tracing::info!(key_id = key.id, prefix = %key.key_prefix, "api key created");
    log_activity(
        &state.db,
        None,
        "create_api_key",
        json!({ "api_key_id": key.id, "key_name": key.key_name, "permissions": key.permissions }),
        &headers,
    );

    Ok(success_with(
        "API key created. Store it now; it cannot be shown again.",
        json!({ "api_key": key, "key_value": key_value }),
    ))
}

pub async fn deactivate_api_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<ApiKeyContext>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_scope(&ctx, ADMIN_SCOPE)?;

    let key_id: i64 = raw_id.parse().map_err(|_| ApiError::KeyNotFound)?;
    state.db.deactivate_api_key(key_id)?;

    tracing::info!(key_id, "api key deactivated");
    log_activity(
        &state.db,
        None,
        "deactivate_api_key",
        json!({ "api_key_id": key_id }),
        &headers,
    );

    Ok(success("API key deactivated"))
}
