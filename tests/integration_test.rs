use auth_gateway::{
    config::Config,
    database::Database,
    identity::{LocalIdentity, TokenService},
    models::{OtpKind, Permissions, UserStatus},
    router,
    security::{display_prefix, generate_api_key},
    AppState,
};
use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

const DEV_FALLBACK_KEY: &str = "dev-fallback-key";
const JWT_SECRET: &str = "integration-secret";

struct TestApp {
    app: Router,
    db: Database,
    auth_key: String,
    admin_key: String,
}

fn setup() -> TestApp {
    let config = Config::from_lookup(|name| match name {
        "APP_ENV" => Some("development".to_string()),
        "API_KEY" => Some(DEV_FALLBACK_KEY.to_string()),
        "JWT_SECRET" => Some(JWT_SECRET.to_string()),
        _ => None,
    })
    .expect("Failed to build config");
    let db = Database::in_memory().expect("Failed to create test database");

    let auth_key = seed_key(&db, "web", &["auth"], None);
    let admin_key = seed_key(&db, "ops", &["auth", "admin"], None);

    TestApp {
        app: router(AppState::new(config, db.clone())),
        db,
        auth_key,
        admin_key,
    }
}

fn seed_key(
    db: &Database,
    name: &str,
    scopes: &[&str],
    expires_at: Option<chrono::DateTime<Utc>>,
) -> String {
    let (key_value, key_hash) = generate_api_key();
    db.create_api_key(
        name,
        &key_hash,
        &display_prefix(&key_value),
        &Permissions::new(scopes.iter().copied()),
        expires_at,
        None,
    )
    .expect("Failed to seed API key");
    key_value
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, value)
}

async fn create_confirmed_user(t: &TestApp, email: &str, password: &str) {
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/admin/users",
        &[("x-api-key", t.admin_key.as_str())],
        Some(json!({ "email": email, "password": password })),
    )
    .await;
    assert_eq!(body["status"], "success", "admin create failed: {}", body);
}

#[tokio::test]
async fn test_health_needs_no_key() {
    println!("🧪 Testing health endpoint...");
    let t = setup();

    let (status, headers, body) = call(&t.app, Method::GET, "/api/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "API is healthy");
    assert_eq!(body["data"]["database"], "connected");
    assert!(body["data"]["version"].is_string());
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert!(headers.contains_key("content-security-policy"));

    println!("✅ Health endpoint test passed");
}

#[tokio::test]
async fn test_api_key_rejections() {
    println!("🧪 Testing API key rejections...");
    let t = setup();
    let expired = seed_key(&t.db, "old", &["auth"], Some(Utc::now() - Duration::minutes(5)));

    let (status, headers, body) = call(&t.app, Method::GET, "/api/auth/me", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Unauthorized: API key not found");
    assert!(!headers.contains_key("x-ratelimit-limit"));

    let (_, _, body) = call(
        &t.app,
        Method::GET,
        "/api/auth/me",
        &[("x-api-key", "ak_0_doesnotexist")],
        None,
    )
    .await;
    assert_eq!(body["message"], "Unauthorized: API key is not valid");

    let (_, _, body) = call(&t.app, Method::GET, "/api/auth/me", &[("x-api-key", expired.as_str())], None).await;
    assert_eq!(body["message"], "Unauthorized: API key has expired");

    println!("✅ API key rejection test passed");
}

#[tokio::test]
async fn test_development_fallback_key() {
    println!("🧪 Testing development fallback key...");
    let t = setup();

    // Admitted: the handler runs and rejects the empty body
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &[("x-api-key", DEV_FALLBACK_KEY)],
        Some(json!({})),
    )
    .await;
    assert_eq!(body["code"], "validation_failed");

    // Carries no scopes, so admin routes stay closed
    let (_, _, body) = call(
        &t.app,
        Method::GET,
        "/api/admin/users",
        &[("x-api-key", DEV_FALLBACK_KEY)],
        None,
    )
    .await;
    assert_eq!(body["message"], "Unauthorized: missing admin permission");

    println!("✅ Development fallback key test passed");
}

#[tokio::test]
async fn test_login_rate_limit() {
    println!("🧪 Testing login rate limit...");
    let t = setup();
    let credentials = json!({ "email": "nobody@example.com", "password": "Password1" });
    let client = [("x-api-key", t.auth_key.as_str()), ("x-forwarded-for", "1.2.3.4")];

    for _ in 0..10 {
        let (_, headers, body) = call(
            &t.app,
            Method::POST,
            "/api/auth/login",
            &client,
            Some(credentials.clone()),
        )
        .await;
        assert_eq!(body["code"], "invalid_credentials");
        assert!(!headers.contains_key("x-ratelimit-limit"));
    }

    let (status, headers, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &client,
        Some(credentials.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Too many requests. Please try again later.");
    assert_eq!(headers["x-ratelimit-limit"], "10");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    let reset: i64 = headers["x-ratelimit-reset"].to_str().unwrap().parse().unwrap();
    assert!(reset > Utc::now().timestamp());
    assert!(reset <= Utc::now().timestamp() + 61);

    // Other clients and other routes keep their own counters
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &[("x-api-key", t.auth_key.as_str()), ("x-forwarded-for", "5.6.7.8")],
        Some(credentials.clone()),
    )
    .await;
    assert_eq!(body["code"], "invalid_credentials");

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/forgot-password",
        &client,
        Some(json!({ "email": "nobody@example.com" })),
    )
    .await;
    assert_eq!(body["status"], "success");

    println!("✅ Login rate limit test passed");
}

#[tokio::test]
async fn test_rejected_keys_do_not_consume_rate_limit() {
    println!("🧪 Testing admission order...");
    let t = setup();
    let credentials = json!({ "email": "nobody@example.com", "password": "Password1" });

    for _ in 0..12 {
        let (_, _, body) = call(
            &t.app,
            Method::POST,
            "/api/auth/login",
            &[("x-forwarded-for", "9.9.9.9")],
            Some(credentials.clone()),
        )
        .await;
        assert_eq!(body["message"], "Unauthorized: API key not found");
    }

    let (_, headers, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &[("x-api-key", t.auth_key.as_str()), ("x-forwarded-for", "9.9.9.9")],
        Some(credentials),
    )
    .await;
    assert_eq!(body["code"], "invalid_credentials");
    assert!(!headers.contains_key("x-ratelimit-limit"));

    println!("✅ Admission order test passed");
}

#[tokio::test]
async fn test_session_lifecycle() {
    println!("🧪 Testing session lifecycle...");
    let t = setup();
    let key = [("x-api-key", t.auth_key.as_str())];
    create_confirmed_user(&t, "member@example.com", "Password1").await;

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &key,
        Some(json!({ "email": "member@example.com", "password": "Password1" })),
    )
    .await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["user"]["role"], "user");
    // Sensitive fields stay hidden by default
    assert!(body["data"]["session"]["refresh_token"].is_null());
    let token = body["data"]["session"]["token"].as_str().unwrap().to_string();
    let bearer = format!("Bearer {}", token);

    let authed = [("x-api-key", t.auth_key.as_str()), ("authorization", bearer.as_str())];
    let (_, _, body) = call(&t.app, Method::GET, "/api/auth/me", &authed, None).await;
    assert_eq!(body["data"]["user"]["role"], "user");
    assert_eq!(body["data"]["user"]["status"], "active");
    assert_eq!(body["data"]["user"]["email_verified"], true);
    assert!(body["data"]["user"]["email"].is_null());

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/change-password",
        &authed,
        Some(json!({
            "current_password": "WrongPass1",
            "new_password": "Password2",
            "confirm_password": "Password2",
        })),
    )
    .await;
    assert_eq!(body["code"], "wrong_password");

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/change-password",
        &authed,
        Some(json!({
            "current_password": "Password1",
            "new_password": "Password2",
            "confirm_password": "Password2",
        })),
    )
    .await;
    assert_eq!(body["status"], "success");

    let (_, _, body) = call(&t.app, Method::POST, "/api/auth/logout", &authed, None).await;
    assert_eq!(body["status"], "success");

    let (_, _, body) = call(&t.app, Method::GET, "/api/auth/me", &authed, None).await;
    assert_eq!(body["code"], "invalid_token");

    let (_, _, body) = call(&t.app, Method::GET, "/api/auth/me", &key, None).await;
    assert_eq!(body["code"], "missing_token");

    let (logs, _) = t.db.list_audit_logs(1, 50).unwrap();
    let actions: Vec<&str> = logs.iter().map(|l| l.action.as_str()).collect();
    for expected in ["admin_create_user", "login", "change_password", "logout"] {
        assert!(actions.contains(&expected), "missing audit action {}", expected);
    }

    println!("✅ Session lifecycle test passed");
}

#[tokio::test]
async fn test_registration_requires_email_verification() {
    println!("🧪 Testing registration and email verification...");
    let t = setup();
    let key = [("x-api-key", t.auth_key.as_str())];
    let credentials = json!({ "email": "new@example.com", "password": "Password1" });

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/register",
        &key,
        Some(json!({
            "email": "new@example.com",
            "password": "Password1",
            "repassword": "Password1",
        })),
    )
    .await;
    assert_eq!(body["status"], "success");
    let user_id = body["data"]["user"]["id"].as_str().unwrap().to_string();

    let (_, _, body) = call(&t.app, Method::POST, "/api/auth/login", &key, Some(credentials.clone())).await;
    assert_eq!(body["code"], "email_not_confirmed");

    let identity = LocalIdentity::new(
        t.db.clone(),
        TokenService::new(JWT_SECRET.to_string(), 3600),
        "http://localhost:3000".to_string(),
    );
    let token = identity.issue_email_token(&user_id, OtpKind::Signup).unwrap();

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/verify-email",
        &key,
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(body["status"], "success");

    let (_, _, body) = call(&t.app, Method::POST, "/api/auth/login", &key, Some(credentials)).await;
    assert_eq!(body["status"], "success");

    // Second registration with the same address
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/register",
        &key,
        Some(json!({
            "email": "NEW@example.com",
            "password": "Password1",
            "repassword": "Password1",
        })),
    )
    .await;
    assert_eq!(body["code"], "user_already_exists");

    println!("✅ Registration test passed");
}

#[tokio::test]
async fn test_password_reset_with_emailed_token() {
    println!("🧪 Testing password reset...");
    let t = setup();
    let key = [("x-api-key", t.auth_key.as_str())];
    create_confirmed_user(&t, "forgetful@example.com", "Password1").await;
    let user = t.db.get_user_by_email("forgetful@example.com").unwrap().unwrap();

    let identity = LocalIdentity::new(
        t.db.clone(),
        TokenService::new(JWT_SECRET.to_string(), 3600),
        "http://localhost:3000".to_string(),
    );
    let token = identity.issue_email_token(&user.id, OtpKind::Recovery).unwrap();

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/reset-password-token",
        &key,
        Some(json!({ "token": "bogus", "new_password": "Password9", "confirm_password": "Password9" })),
    )
    .await;
    assert_eq!(body["code"], "token_expired");

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/reset-password-token",
        &key,
        Some(json!({ "token": token, "new_password": "Password9", "confirm_password": "Password9" })),
    )
    .await;
    assert_eq!(body["status"], "success");

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &key,
        Some(json!({ "email": "forgetful@example.com", "password": "Password9" })),
    )
    .await;
    assert_eq!(body["status"], "success");

    println!("✅ Password reset test passed");
}

#[tokio::test]
async fn test_admin_api_key_management() {
    println!("🧪 Testing admin API key management...");
    let t = setup();
    let admin = [("x-api-key", t.admin_key.as_str())];

    // An auth-only key cannot reach admin routes
    let (_, _, body) = call(
        &t.app,
        Method::GET,
        "/api/admin/api-keys",
        &[("x-api-key", t.auth_key.as_str())],
        None,
    )
    .await;
    assert_eq!(body["code"], "insufficient_scope");

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/admin/api-keys",
        &admin,
        Some(json!({ "key_name": "mobile" })),
    )
    .await;
    assert_eq!(body["status"], "success");
    let new_key = body["data"]["key_value"].as_str().unwrap().to_string();
    let new_id = body["data"]["api_key"]["id"].as_i64().unwrap();
    assert_eq!(body["data"]["api_key"]["permissions"], json!(["auth"]));
    assert!(body["data"]["api_key"]["key_hash"].is_null());

    // Listings never reveal the key value
    let (_, _, body) = call(&t.app, Method::GET, "/api/admin/api-keys", &admin, None).await;
    let listed = body["data"]["api_keys"].as_array().unwrap();
    assert_eq!(listed.len(), 3);
    assert!(!body.to_string().contains(&new_key));

    let (_, _, body) = call(
        &t.app,
        Method::GET,
        "/api/auth/me",
        &[("x-api-key", new_key.as_str())],
        None,
    )
    .await;
    assert_eq!(body["code"], "missing_token");

    let (_, _, body) = call(
        &t.app,
        Method::DELETE,
        &format!("/api/admin/api-keys/{}", new_id),
        &admin,
        None,
    )
    .await;
    assert_eq!(body["status"], "success");

    let (_, _, body) = call(
        &t.app,
        Method::GET,
        "/api/auth/me",
        &[("x-api-key", new_key.as_str())],
        None,
    )
    .await;
    assert_eq!(body["code"], "invalid_api_key");

    let (_, _, body) = call(&t.app, Method::DELETE, "/api/admin/api-keys/9999", &admin, None).await;
    assert_eq!(body["code"], "api_key_not_found");

    println!("✅ Admin API key management test passed");
}

#[tokio::test]
async fn test_admin_user_management() {
    println!("🧪 Testing admin user management...");
    let t = setup();
    let admin = [("x-api-key", t.admin_key.as_str())];
    for i in 0..12 {
        create_confirmed_user(&t, &format!("user{:02}@example.com", i), "Password1").await;
    }

    let (_, _, body) = call(&t.app, Method::GET, "/api/admin/users", &admin, None).await;
    assert_eq!(body["data"]["users"].as_array().unwrap().len(), 10);
    assert_eq!(body["data"]["pagination"]["total"], 12);
    assert_eq!(body["data"]["pagination"]["total_pages"], 2);

    let (_, _, body) = call(&t.app, Method::GET, "/api/admin/users?search=user03", &admin, None).await;
    assert_eq!(body["data"]["pagination"]["total"], 1);
    let user_id = body["data"]["users"][0]["id"].as_str().unwrap().to_string();

    let (_, _, body) = call(
        &t.app,
        Method::PUT,
        &format!("/api/admin/users/{}", user_id),
        &admin,
        Some(json!({ "status": "blocked" })),
    )
    .await;
    assert_eq!(body["data"]["user"]["status"], "blocked");

    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &admin,
        Some(json!({ "email": "user03@example.com", "password": "Password1" })),
    )
    .await;
    assert_eq!(body["code"], "account_inactive");

    let (_, _, body) = call(
        &t.app,
        Method::PUT,
        &format!("/api/admin/users/{}", user_id),
        &admin,
        Some(json!({ "status": "deleted" })),
    )
    .await;
    assert_eq!(body["code"], "validation_failed");
    assert_eq!(body["errors"][0]["path"], "status");

    let (_, _, body) = call(
        &t.app,
        Method::DELETE,
        &format!("/api/admin/users/{}", user_id),
        &admin,
        None,
    )
    .await;
    assert_eq!(body["status"], "success");

    let (_, _, body) = call(
        &t.app,
        Method::GET,
        &format!("/api/admin/users/{}", user_id),
        &admin,
        None,
    )
    .await;
    assert_eq!(body["code"], "user_not_found");

    let (_, _, body) = call(&t.app, Method::GET, "/api/admin/logs?limit=5", &admin, None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 5);
    assert_eq!(body["pagination"]["limit"], 5);

    println!("✅ Admin user management test passed");
}

#[tokio::test]
async fn test_malformed_body_keeps_envelope() {
    println!("🧪 Testing malformed request bodies...");
    let t = setup();

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/auth/login")
                .header("x-api-key", t.auth_key.as_str())
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "invalid_request");

    println!("✅ Malformed body test passed");
}

#[tokio::test]
async fn test_malformed_query_keeps_envelope() {
    println!("🧪 Testing malformed query strings...");
    let t = setup();
    let admin = [("x-api-key", t.admin_key.as_str())];

    let (status, _, body) = call(&t.app, Method::GET, "/api/admin/users?page=1&page=2", &admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "invalid_request");

    let (status, _, body) = call(&t.app, Method::GET, "/api/admin/logs?limit=5&limit=6", &admin, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "invalid_request");

    // Unparsable numbers still fall back to defaults
    let (_, _, body) = call(&t.app, Method::GET, "/api/admin/users?page=abc&limit=-3", &admin, None).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["pagination"]["page"], 1);
    assert_eq!(body["data"]["pagination"]["limit"], 10);

    println!("✅ Malformed query test passed");
}

#[tokio::test]
async fn test_wrong_method_keeps_envelope() {
    println!("🧪 Testing wrong HTTP methods...");
    let t = setup();

    let (status, headers, body) = call(
        &t.app,
        Method::PUT,
        "/api/auth/login",
        &[("x-api-key", t.auth_key.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "method_not_allowed");
    assert!(headers.contains_key("allow"));
    assert_eq!(headers["x-frame-options"], "DENY");

    // The key check still comes first
    let (status, _, body) = call(&t.app, Method::DELETE, "/api/admin/logs", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Unauthorized: API key not found");

    let (status, _, body) = call(&t.app, Method::POST, "/api/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "method_not_allowed");

    println!("✅ Wrong method test passed");
}

#[tokio::test]
async fn test_sign_in_recorded_only_on_login() {
    println!("🧪 Testing last sign-in tracking...");
    let t = setup();
    let key = [("x-api-key", t.auth_key.as_str())];
    create_confirmed_user(&t, "tracked@example.com", "Password1").await;
    let user = t.db.get_user_by_email("tracked@example.com").unwrap().unwrap();
    assert!(user.last_sign_in_at.is_none());

    // Correct password on a blocked account is not a sign-in
    t.db.set_user_status(&user.id, UserStatus::Blocked).unwrap();
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &key,
        Some(json!({ "email": "tracked@example.com", "password": "Password1" })),
    )
    .await;
    assert_eq!(body["code"], "account_inactive");
    let user = t.db.get_user(&user.id).unwrap().unwrap();
    assert!(user.last_sign_in_at.is_none());

    t.db.set_user_status(&user.id, UserStatus::Active).unwrap();
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/login",
        &key,
        Some(json!({ "email": "tracked@example.com", "password": "Password1" })),
    )
    .await;
    assert_eq!(body["status"], "success");
    let signed_in_at = t
        .db
        .get_user(&user.id)
        .unwrap()
        .unwrap()
        .last_sign_in_at
        .expect("login should record the sign-in");

    // Re-checking the password for a change is not a sign-in either
    let bearer = format!("Bearer {}", body["data"]["session"]["token"].as_str().unwrap());
    let (_, _, body) = call(
        &t.app,
        Method::POST,
        "/api/auth/change-password",
        &[("x-api-key", t.auth_key.as_str()), ("authorization", bearer.as_str())],
        Some(json!({
            "current_password": "Password1",
            "new_password": "Password2",
            "confirm_password": "Password2",
        })),
    )
    .await;
    assert_eq!(body["status"], "success");
    let user = t.db.get_user(&user.id).unwrap().unwrap();
    assert_eq!(user.last_sign_in_at, Some(signed_in_at));

    println!("✅ Last sign-in test passed");
}
