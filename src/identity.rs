//! Identity provider seam.
//!
//! Route handlers only talk to [`IdentityProvider`]. [`LocalIdentity`] backs it
//! with the application database: argon2 password hashes, HS256 access tokens
//! tied to a server-side session row, and one-time email tokens whose links are
//! written to the log instead of being mailed.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::errors::ApiError;
use crate::models::{OtpKind, Session, User, UserStatus};
use crate::security::{hash_secret, random_token};

const REFRESH_TTL_DAYS: i64 = 30;
const SIGNUP_TOKEN_TTL_HOURS: i64 = 24;
const RECOVERY_TOKEN_TTL_HOURS: i64 = 1;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_user(
        &self,
        email: &str,
        password: &str,
        role_id: i64,
        confirmed: bool,
    ) -> Result<User, ApiError>;

    async fn verify_credentials(&self, email: &str, password: &str) -> Result<User, ApiError>;

    async fn issue_session(&self, user: &User) -> Result<Session, ApiError>;

    async fn verify_token(&self, access_token: &str) -> Result<User, ApiError>;

    /// Re-establishes a session from an emailed access/refresh pair.
    async fn restore_session(&self, access_token: &str, refresh_token: &str)
        -> Result<User, ApiError>;

    async fn revoke_session(&self, access_token: &str) -> Result<(), ApiError>;

    async fn update_credential(&self, user_id: &str, new_password: &str) -> Result<(), ApiError>;

    async fn send_verification_email(&self, user: &User) -> Result<(), ApiError>;

    /// Returns the user the email went to, or `None` when the address is unknown.
    async fn send_password_reset_email(&self, email: &str) -> Result<Option<User>, ApiError>;

    async fn verify_otp(&self, token: &str, kind: OtpKind) -> Result<User, ApiError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub sid: String, // session id
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct TokenService {
    secret_key: String,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret_key: String, ttl_seconds: i64) -> Self {
        Self {
            secret_key,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Signed access token and its expiry as unix seconds.
    pub fn generate_access_token(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(String, i64), ApiError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;

        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_ref()),
        )?;

        Ok((token, claims.exp))
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, ApiError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret_key.as_ref()),
            &Validation::default(),
        )?;

        // Validation allows some leeway; expiry here is exact.
        if token_data.claims.exp < Utc::now().timestamp() {
            return Err(ApiError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Checks the signature only; used when a refresh token vouches for the session.
    pub fn decode_ignoring_expiry(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::default();
        validation.validate_exp = false;
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret_key.as_ref()),
            &validation,
        )?;
        Ok(token_data.claims)
    }
}

pub struct LocalIdentity {
    db: Database,
    tokens: TokenService,
    site_url: String,
}

impl LocalIdentity {
    pub fn new(db: Database, tokens: TokenService, site_url: String) -> Self {
        Self {
            db,
            tokens,
            site_url: site_url.trim_end_matches('/').to_string(),
        }
    }

    /// Stores a fresh one-time token for `user_id` and returns its plaintext.
    pub fn issue_email_token(&self, user_id: &str, kind: OtpKind) -> Result<String, ApiError> {
        let ttl = match kind {
            OtpKind::Signup => Duration::hours(SIGNUP_TOKEN_TTL_HOURS),
            OtpKind::Recovery => Duration::hours(RECOVERY_TOKEN_TTL_HOURS),
        };
        let token = random_token();
        self.db
            .create_email_token(&hash_secret(&token), user_id, kind, Utc::now() + ttl)?;
        Ok(token)
    }

    fn hash_password(password: &str) -> Result<String, ApiError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    fn verify_password(password: &str, stored_hash: &str) -> bool {
        match PasswordHash::new(stored_hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(err) => {
                tracing::error!(error = %err, "stored password hash is malformed");
                false
            }
        }
    }

    fn load_user(&self, user_id: &str) -> Result<User, ApiError> {
        self.db.get_user(user_id)?.ok_or(ApiError::UserNotFound)
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentity {
    async fn create_user(
        &self,
        email: &str,
        password: &str,
        role_id: i64,
        confirmed: bool,
    ) -> Result<User, ApiError> {
        let password_hash = Self::hash_password(password)?;
        let (confirmed_at, status) = if confirmed {
            (Some(Utc::now()), UserStatus::Active)
        } else {
            (None, UserStatus::Pending)
        };
        let user = self
            .db
            .create_user(email, &password_hash, confirmed_at, role_id, status)?;
        tracing::info!(user_id = %user.id, "user created");
        Ok(user)
    }

    async fn verify_credentials(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let user = self
            .db
            .get_user_by_email(email)?
            .ok_or(ApiError::InvalidCredentials)?;

        if !Self::verify_password(password, &user.password_hash) {
            return Err(ApiError::InvalidCredentials);
        }

        Ok(user)
    }

    async fn issue_session(&self, user: &User) -> Result<Session, ApiError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let refresh_token = random_token();

        self.db.create_session(
            &session_id,
            &user.id,
            &hash_secret(&refresh_token),
            Utc::now() + Duration::days(REFRESH_TTL_DAYS),
        )?;
        let (access_token, expires_at) = self.tokens.generate_access_token(&user.id, &session_id)?;

        Ok(Session {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    async fn verify_token(&self, access_token: &str) -> Result<User, ApiError> {
        let claims = self.tokens.validate_access_token(access_token)?;
        let session = self
            .db
            .get_session(&claims.sid)?
            .ok_or(ApiError::InvalidToken)?;

        if session.revoked || session.user_id != claims.sub {
            return Err(ApiError::InvalidToken);
        }

        self.db.get_user(&claims.sub)?.ok_or(ApiError::InvalidToken)
    }

    async fn restore_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<User, ApiError> {
        let claims = self
            .tokens
            .decode_ignoring_expiry(access_token)
            .map_err(|_| ApiError::TokenExpired)?;
        let session = self
            .db
            .get_session(&claims.sid)?
            .ok_or(ApiError::TokenExpired)?;

        let refresh_matches = session.refresh_token_hash == hash_secret(refresh_token);
        if session.revoked || !refresh_matches || session.expires_at < Utc::now() {
            return Err(ApiError::TokenExpired);
        }

        self.db.get_user(&session.user_id)?.ok_or(ApiError::TokenExpired)
    }

    async fn revoke_session(&self, access_token: &str) -> Result<(), ApiError> {
        let claims = self.tokens.validate_access_token(access_token)?;
        self.db.revoke_session(&claims.sid)?;
        tracing::debug!(session_id = %claims.sid, "session revoked");
        Ok(())
    }

    async fn update_credential(&self, user_id: &str, new_password: &str) -> Result<(), ApiError> {
        let user = self.load_user(user_id)?;
        if Self::verify_password(new_password, &user.password_hash) {
            return Err(ApiError::SamePassword);
        }

        let password_hash = Self::hash_password(new_password)?;
        self.db.set_password_hash(user_id, &password_hash)
    }

    async fn send_verification_email(&self, user: &User) -> Result<(), ApiError> {
        let token = self.issue_email_token(&user.id, OtpKind::Signup)?;
        tracing::info!(
            user_id = %user.id,
            link = %format!("{}/auth/callback?token={}", self.site_url, token),
            "verification email queued"
        );
        Ok(())
    }

    async fn send_password_reset_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let Some(user) = self.db.get_user_by_email(email)? else {
            return Ok(None);
        };

        let token = self.issue_email_token(&user.id, OtpKind::Recovery)?;
        tracing::info!(
            user_id = %user.id,
            link = %format!("{}/auth/v1/verify?token={}", self.site_url, token),
            "password reset email queued"
        );
        Ok(Some(user))
    }

    async fn verify_otp(&self, token: &str, kind: OtpKind) -> Result<User, ApiError> {
        let now = Utc::now();
        let user_id = self
            .db
            .consume_email_token(&hash_secret(token), kind, now)?
            .ok_or(ApiError::TokenExpired)?;

        if kind == OtpKind::Signup {
            self.db.confirm_email(&user_id, now)?;
        }

        self.load_user(&user_id)
    }
}
