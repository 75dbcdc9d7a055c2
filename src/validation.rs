use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{ApiError, FieldError};
use crate::models::{
    ChangePasswordRequest, CreateApiKeyRequest, CreateUserRequest, ForgotPasswordRequest,
    LoginRequest, RegisterRequest, ResetPasswordRequest, ResetPasswordTokenRequest,
    UpdateUserRequest, UserStatus, VerifyEmailRequest,
};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email regex"));

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Default)]
struct Checks(Vec<FieldError>);

impl Checks {
    fn email(&mut self, path: &str, value: &str) {
        if !EMAIL_RE.is_match(value.trim()) {
            self.0.push(FieldError::new(path, "Invalid email format"));
        }
    }

    fn not_empty(&mut self, path: &str, value: &str, message: &str) {
        if value.trim().is_empty() {
            self.0.push(FieldError::new(path, message));
        }
    }

    fn strong_password(&mut self, path: &str, value: &str) {
        if value.chars().count() < MIN_PASSWORD_LEN {
            self.0.push(FieldError::new(
                path,
                format!("Password must be at least {} characters", MIN_PASSWORD_LEN),
            ));
        }
        if !value.chars().any(|c| c.is_ascii_uppercase()) {
            self.0.push(FieldError::new(
                path,
                "Password must contain at least 1 uppercase letter",
            ));
        }
        if !value.chars().any(|c| c.is_ascii_digit()) {
            self.0.push(FieldError::new(path, "Password must contain at least 1 number"));
        }
    }

    fn matches(&mut self, path: &str, value: &str, confirmation: &str) {
        if value != confirmation {
            self.0.push(FieldError::new(path, "Passwords do not match"));
        }
    }

    fn finish(self) -> Result<(), ApiError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self.0))
        }
    }
}

pub fn register(req: &RegisterRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.email("email", &req.email);
    checks.strong_password("password", &req.password);
    checks.matches("repassword", &req.password, &req.repassword);
    checks.finish()
}

pub fn login(req: &LoginRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.email("email", &req.email);
    checks.not_empty("password", &req.password, "Password must not be empty");
    checks.finish()
}

pub fn forgot_password(req: &ForgotPasswordRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.email("email", &req.email);
    checks.finish()
}

pub fn reset_password(req: &ResetPasswordRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.not_empty("access_token", &req.access_token, "Access token is not valid");
    checks.not_empty("refresh_token", &req.refresh_token, "Refresh token is not valid");
    checks.strong_password("new_password", &req.new_password);
    checks.matches("confirm_password", &req.new_password, &req.confirm_password);
    checks.finish()
}

pub fn reset_password_token(req: &ResetPasswordTokenRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.not_empty("token", &req.token, "Token is not valid");
    checks.strong_password("new_password", &req.new_password);
    checks.matches("confirm_password", &req.new_password, &req.confirm_password);
    checks.finish()
}

pub fn change_password(req: &ChangePasswordRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.not_empty(
        "current_password",
        &req.current_password,
        "Current password must not be empty",
    );
    checks.strong_password("new_password", &req.new_password);
    checks.matches("confirm_password", &req.new_password, &req.confirm_password);
    checks.finish()
}

pub fn verify_email(req: &VerifyEmailRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.not_empty("token", &req.token, "Token is not valid");
    checks.finish()
}

pub fn create_user(req: &CreateUserRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.email("email", &req.email);
    checks.strong_password("password", &req.password);
    if req.role_id <= 0 {
        checks.0.push(FieldError::new("role_id", "Role id must be positive"));
    }
    checks.finish()
}

/// Validates the update and parses its status.
pub fn update_user(req: &UpdateUserRequest) -> Result<Option<UserStatus>, ApiError> {
    let mut checks = Checks::default();
    if let Some(email) = &req.email {
        checks.email("email", email);
    }
    if matches!(req.role_id, Some(id) if id <= 0) {
        checks.0.push(FieldError::new("role_id", "Role id must be positive"));
    }
    let status = match req.status.as_deref() {
        None => None,
        Some(raw) => {
            let parsed = UserStatus::parse(raw);
            if parsed.is_none() {
                checks.0.push(FieldError::new(
                    "status",
                    "Status must be one of pending, active, blocked",
                ));
            }
            parsed
        }
    };
    checks.finish()?;
    Ok(status)
}

pub fn create_api_key(req: &CreateApiKeyRequest) -> Result<(), ApiError> {
    let mut checks = Checks::default();
    checks.not_empty("key_name", &req.key_name, "API key name must not be empty");
    if req.permissions.iter().any(|p| p.trim().is_empty()) {
        checks.0.push(FieldError::new("permissions", "Permissions must not be blank"));
    }
    checks.finish()
}
