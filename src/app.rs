use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::config::{Config, Environment};
use crate::database::Database;
use crate::errors::ApiError;
use crate::handlers::{admin, auth, health};
use crate::identity::{IdentityProvider, LocalIdentity, TokenService};
use crate::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitState, RateLimiter};
use crate::security::{require_api_key, ApiKeyValidator};

const DEV_CSP: &str = "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
     style-src 'self' 'unsafe-inline'; img-src 'self' data: blob:; connect-src 'self' ws: wss:";
const PROD_CSP: &str = "default-src 'self'; script-src 'self'; style-src 'self'; \
     img-src 'self' data:; connect-src 'self'; frame-ancestors 'none'";
const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=()";

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub identity: Arc<dyn IdentityProvider>,
    pub validator: Arc<ApiKeyValidator>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wires the database-backed identity provider and key store.
    pub fn new(config: Config, db: Database) -> Self {
        let tokens = TokenService::new(config.jwt_secret.clone(), config.session_ttl_seconds);
        let identity = LocalIdentity::new(db.clone(), tokens, config.site_url.clone());
        let validator = ApiKeyValidator::new(Arc::new(db.clone()), config.development_bypass());

        Self {
            config: Arc::new(config),
            db,
            identity: Arc::new(identity),
            validator: Arc::new(validator),
            limiter: Arc::new(RateLimiter::new()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let limiter = state.limiter.clone();
    let limited = move |config: RateLimitConfig| {
        middleware::from_fn_with_state(
            RateLimitState::new(limiter.clone(), config),
            rate_limit_middleware,
        )
    };

    let auth_routes = Router::new()
        .route(
            "/register",
            post(auth::register).layer(limited(RateLimitConfig::register())),
        )
        .route(
            "/login",
            post(auth::login).layer(limited(RateLimitConfig::login())),
        )
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .route(
            "/forgot-password",
            post(auth::forgot_password).layer(limited(RateLimitConfig::forgot_password())),
        )
        .route(
            "/reset-password",
            post(auth::reset_password).layer(limited(RateLimitConfig::password_update())),
        )
        .route(
            "/reset-password-token",
            post(auth::reset_password_token).layer(limited(RateLimitConfig::password_update())),
        )
        .route(
            "/change-password",
            post(auth::change_password).layer(limited(RateLimitConfig::password_update())),
        )
        .route("/verify-email", post(auth::verify_email));

    let admin_routes = Router::new()
        .route("/users", get(admin::list_users).post(admin::create_user))
        .route(
            "/users/:id",
            get(admin::get_user)
                .put(admin::update_user)
                .delete(admin::delete_user),
        )
        .route("/logs", get(admin::list_logs))
        .route(
            "/api-keys",
            get(admin::list_api_keys).post(admin::create_api_key),
        )
        .route("/api-keys/:id", delete(admin::deactivate_api_key));

    // The key check wraps the per-route limiters, so it runs first.
    let gated = Router::new()
        .nest("/auth", auth_routes)
        .nest("/admin", admin_routes)
        .layer(middleware::from_fn_with_state(
            state.validator.clone(),
            require_api_key,
        ));

    let app = Router::new()
        .route("/api/health", get(health::health))
        .nest("/api", gated)
        .layer(middleware::map_response(method_not_allowed_envelope));

    with_security_headers(app, state.config.environment)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Known paths hit with the wrong method still answer with the envelope.
async fn method_not_allowed_envelope(response: Response) -> Response {
    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
        return response;
    }

    let allow = response.headers().get(header::ALLOW).cloned();
    let mut envelope = ApiError::MethodNotAllowed.into_response();
    if let Some(allow) = allow {
        envelope.headers_mut().insert(header::ALLOW, allow);
    }
    envelope
}

fn with_security_headers(router: Router<AppState>, environment: Environment) -> Router<AppState> {
    let csp = match environment {
        Environment::Development => DEV_CSP,
        Environment::Production => PROD_CSP,
    };

    router
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static(PERMISSIONS_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(csp),
        ))
}
