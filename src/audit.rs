use axum::http::HeaderMap;
use serde_json::Value;

use crate::database::Database;
use crate::rate_limit::{extract_client_identifier, UNKNOWN_CLIENT};

/// Records a security-relevant action. Failures are logged and swallowed.
pub fn log_activity(
    db: &Database,
    user_id: Option<&str>,
    action: &str,
    details: Value,
    headers: &HeaderMap,
) {
    let ip_address = extract_client_identifier(headers);
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(UNKNOWN_CLIENT);

    if let Err(err) = db.insert_audit_log(user_id, action, &details, &ip_address, user_agent) {
        tracing::warn!(action = %action, error = %err, "failed to write audit log");
    }
}
