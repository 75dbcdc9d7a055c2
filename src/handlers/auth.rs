use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde_json::{json, Value};

use super::{bearer_token, success, success_with, user_summary, JsonBody};
use crate::app::AppState;
use crate::audit::log_activity;
use crate::errors::ApiError;
use crate::models::{
    ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, OtpKind, RegisterRequest,
    ResetPasswordRequest, ResetPasswordTokenRequest, UserStatus, VerifyEmailRequest,
};
use crate::validation;

const DEFAULT_ROLE_ID: i64 = 1;

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    validation::register(&payload)?;

    let email = payload.email.trim();
    let user = state
        .identity
        .create_user(email, &payload.password, DEFAULT_ROLE_ID, false)
        .await?;

    if let Err(err) = state.identity.send_verification_email(&user).await {
        tracing::warn!(user_id = %user.id, error = %err, "failed to send verification email");
    }

    log_activity(
        &state.db,
        Some(&user.id),
        "register",
        json!({ "email": user.email }),
        &headers,
    );

    Ok(success_with(
        "Registration successful. Please check your email to verify your account.",
        json!({ "user": { "id": user.id, "email": user.email } }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    validation::login(&payload)?;

    let user = state
        .identity
        .verify_credentials(payload.email.trim(), &payload.password)
        .await?;

    if !user.email_verified() {
        return Err(ApiError::EmailNotConfirmed);
    }

    match user.status {
        UserStatus::Blocked => return Err(ApiError::AccountInactive),
        UserStatus::Pending => state.db.set_user_status(&user.id, UserStatus::Active)?,
        UserStatus::Active => {}
    }
    state.db.record_sign_in(&user.id, Utc::now())?;

    let session = state.identity.issue_session(&user).await?;

    log_activity(
        &state.db,
        Some(&user.id),
        "login",
        json!({ "email": user.email }),
        &headers,
    );

    let data = if state.config.show_sensitive_data {
        json!({
            "user": { "id": user.id, "email": user.email, "role": user.role.name },
            "session": session,
        })
    } else {
        json!({
            "user": { "id": user.id, "role": user.role.name },
            "session": { "token": session.access_token, "expires_at": session.expires_at },
        })
    };

    Ok(success_with("Login successful", data))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers)?;

    // Resolve the user first; once revoked the token no longer maps to anyone.
    let user = state.identity.verify_token(token).await.ok();
    state.identity.revoke_session(token).await?;

    if let Some(user) = user {
        log_activity(&state.db, Some(&user.id), "logout", json!({}), &headers);
    }

    Ok(success("Logout successful"))
}

pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers)?;
    let user = state.identity.verify_token(token).await?;

    let profile = if state.config.show_sensitive_data {
        user_summary(&user)
    } else {
        json!({
            "id": user.id,
            "role": user.role.name,
            "status": user.status,
            "email_verified": user.email_verified(),
        })
    };

    Ok(success_with("User profile retrieved", json!({ "user": profile })))
}

/// Always answers with the same message so registered addresses stay hidden.
pub async fn forgot_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<ForgotPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    validation::forgot_password(&payload)?;

    let email = payload.email.trim();
    match state.identity.send_password_reset_email(email).await {
        Ok(Some(user)) => log_activity(
            &state.db,
            Some(&user.id),
            "forgot_password_request",
            json!({ "email": email }),
            &headers,
        ),
        Ok(None) => tracing::debug!("password reset requested for unknown address"),
        Err(err) => tracing::warn!(error = %err, "failed to send password reset email"),
    }

    Ok(success(
        "If the email is registered, a password reset link has been sent.",
    ))
}

pub async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<ResetPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    validation::reset_password(&payload)?;

    let user = state
        .identity
        .restore_session(&payload.access_token, &payload.refresh_token)
        .await
        .map_err(expired_link)?;
    state
        .identity
        .update_credential(&user.id, &payload.new_password)
        .await?;

    log_activity(
        &state.db,
        Some(&user.id),
        "reset_password",
        json!({ "email": user.email }),
        &headers,
    );

    Ok(success("Password has been reset. Please log in with your new password."))
}

pub async fn reset_password_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<ResetPasswordTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    validation::reset_password_token(&payload)?;

    let user = state
        .identity
        .verify_otp(&payload.token, OtpKind::Recovery)
        .await
        .map_err(expired_link)?;
    state
        .identity
        .update_credential(&user.id, &payload.new_password)
        .await?;

    log_activity(
        &state.db,
        Some(&user.id),
        "reset_password",
        json!({ "email": user.email, "method": "token" }),
        &headers,
    );

    Ok(success("Password has been reset. Please log in with your new password."))
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<ChangePasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers)?;
    validation::change_password(&payload)?;

    let user = state.identity.verify_token(token).await?;
    state
        .identity
        .verify_credentials(&user.email, &payload.current_password)
        .await
        .map_err(|err| match err {
            ApiError::InvalidCredentials => ApiError::WrongPassword,
            other => other,
        })?;
    state
        .identity
        .update_credential(&user.id, &payload.new_password)
        .await?;

    log_activity(
        &state.db,
        Some(&user.id),
        "change_password",
        json!({ "email": user.email }),
        &headers,
    );

    Ok(success("Password changed successfully"))
}

pub async fn verify_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<VerifyEmailRequest>,
) -> Result<Json<Value>, ApiError> {
    validation::verify_email(&payload)?;

    let user = state
        .identity
        .verify_otp(&payload.token, OtpKind::Signup)
        .await
        .map_err(expired_link)?;

    log_activity(
        &state.db,
        Some(&user.id),
        "email_verified",
        json!({ "email": user.email }),
        &headers,
    );

    Ok(success("Email verified successfully. You can now log in."))
}

/// Storage failures keep their own error; anything else is a dead link.
fn expired_link(err: ApiError) -> ApiError {
    match err {
        ApiError::Database(_) | ApiError::Io(_) | ApiError::Internal => err,
        _ => ApiError::TokenExpired,
    }
}
