use crate::errors::{ApiError, FieldError};
use crate::models::{ApiKey, AuditLog, OtpKind, Pagination, Permissions, Role, User, UserStatus};
use crate::security::{hash_secret, ApiKeyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

const USER_COLUMNS: &str = "u.id, u.email, u.password_hash, u.email_confirmed_at, u.last_sign_in_at, \
     u.role_id, r.name, r.description, u.status, u.created_at, u.updated_at \
     FROM users u JOIN roles r ON r.id = u.role_id";

const API_KEY_COLUMNS: &str = "id, key_name, key_hash, key_prefix, permissions, is_active, \
     expires_at, last_used_at, user_id, created_at, updated_at FROM api_keys";

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub refresh_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Partial update applied by the admin user endpoint.
#[derive(Debug, Default, Clone)]
pub struct UserChanges {
    pub email: Option<String>,
    pub role_id: Option<i64>,
    pub status: Option<UserStatus>,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, ApiError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, ApiError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ApiError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../db/schema.sql"))?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.conn.lock().map_err(|_| {
            tracing::error!("database mutex poisoned");
            ApiError::Internal
        })
    }

    pub fn ping(&self) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM roles", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // User operations
    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        email_confirmed_at: Option<DateTime<Utc>>,
        role_id: i64,
        status: UserStatus,
    ) -> Result<User, ApiError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO users (id, email, password_hash, email_confirmed_at, role_id, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![id, email, password_hash, email_confirmed_at, role_id, status.as_str(), now],
            )
            .map_err(map_constraint)?;
        }
        self.get_user(&id)?.ok_or(ApiError::UserNotFound)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>, ApiError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} WHERE u.id = ?1", USER_COLUMNS),
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} WHERE u.email = ?1", USER_COLUMNS),
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> Result<(Vec<User>, u64), ApiError> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(&s.to_lowercase())));
        let conn = self.conn()?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE (?1 IS NULL OR lower(email) LIKE ?1 ESCAPE '\\')",
            params![pattern],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} WHERE (?1 IS NULL OR lower(u.email) LIKE ?1 ESCAPE '\\') \
             ORDER BY u.created_at DESC, u.rowid DESC LIMIT ?2 OFFSET ?3",
            USER_COLUMNS
        ))?;
        let users = stmt
            .query_map(
                params![pattern, i64::from(limit), Pagination::offset(page, limit) as i64],
                user_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((users, total.max(0) as u64))
    }

    pub fn update_user(&self, user_id: &str, changes: &UserChanges) -> Result<(), ApiError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE users SET \
                   email = COALESCE(?2, email), \
                   role_id = COALESCE(?3, role_id), \
                   status = COALESCE(?4, status), \
                   updated_at = ?5 \
                 WHERE id = ?1",
                params![
                    user_id,
                    changes.email,
                    changes.role_id,
                    changes.status.map(|s| s.as_str()),
                    Utc::now()
                ],
            )
            .map_err(map_constraint)?;
        if updated == 0 {
            return Err(ApiError::UserNotFound);
        }
        Ok(())
    }

    pub fn set_user_status(&self, user_id: &str, status: UserStatus) -> Result<(), ApiError> {
        self.update_user(
            user_id,
            &UserChanges {
                status: Some(status),
                ..UserChanges::default()
            },
        )
    }

    pub fn confirm_email(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET email_confirmed_at = COALESCE(email_confirmed_at, ?2), \
             status = 'active', updated_at = ?2 WHERE id = ?1",
            params![user_id, at],
        )?;
        Ok(())
    }

    pub fn set_password_hash(&self, user_id: &str, password_hash: &str) -> Result<(), ApiError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, password_hash, Utc::now()],
        )?;
        if updated == 0 {
            return Err(ApiError::UserNotFound);
        }
        Ok(())
    }

    pub fn record_sign_in(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET last_sign_in_at = ?2 WHERE id = ?1",
            params![user_id, at],
        )?;
        Ok(())
    }

    pub fn delete_user(&self, user_id: &str) -> Result<(), ApiError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        if deleted == 0 {
            return Err(ApiError::UserNotFound);
        }
        Ok(())
    }

    // API Key operations
    pub fn create_api_key(
        &self,
        key_name: &str,
        key_hash: &str,
        key_prefix: &str,
        permissions: &Permissions,
        expires_at: Option<DateTime<Utc>>,
        user_id: Option<&str>,
    ) -> Result<ApiKey, ApiError> {
        let permissions_json = serde_json::to_string(permissions)?;
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_keys (key_name, key_hash, key_prefix, permissions, expires_at, user_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![key_name, key_hash, key_prefix, permissions_json, expires_at, user_id, now],
        )?;
        let id = conn.last_insert_rowid();

        let key = conn.query_row(
            &format!("SELECT {} WHERE id = ?1", API_KEY_COLUMNS),
            params![id],
            api_key_from_row,
        )?;
        Ok(key)
    }

    pub fn get_active_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, ApiError> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                &format!("SELECT {} WHERE key_hash = ?1 AND is_active = 1", API_KEY_COLUMNS),
                params![key_hash],
                api_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn get_api_key(&self, key_id: i64) -> Result<Option<ApiKey>, ApiError> {
        let conn = self.conn()?;
        let key = conn
            .query_row(
                &format!("SELECT {} WHERE id = ?1", API_KEY_COLUMNS),
                params![key_id],
                api_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKey>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} ORDER BY created_at DESC, id DESC",
            API_KEY_COLUMNS
        ))?;
        let keys = stmt
            .query_map([], api_key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn update_api_key_usage(&self, key_id: i64, at: DateTime<Utc>) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![key_id, at],
        )?;
        Ok(())
    }

    pub fn deactivate_api_key(&self, key_id: i64) -> Result<(), ApiError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE api_keys SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![key_id, Utc::now()],
        )?;
        if updated == 0 {
            return Err(ApiError::KeyNotFound);
        }
        Ok(())
    }

    // Audit log operations
    pub fn insert_audit_log(
        &self,
        user_id: Option<&str>,
        action: &str,
        details: &serde_json::Value,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_logs (user_id, action, details, ip_address, user_agent, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, action, details.to_string(), ip_address, user_agent, Utc::now()],
        )?;
        Ok(())
    }

    pub fn list_audit_logs(&self, page: u32, limit: u32) -> Result<(Vec<AuditLog>, u64), ApiError> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_logs", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, action, details, ip_address, user_agent, created_at \
             FROM audit_logs ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let logs = stmt
            .query_map(
                params![i64::from(limit), Pagination::offset(page, limit) as i64],
                |row| {
                    let details: String = row.get(3)?;
                    Ok(AuditLog {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        action: row.get(2)?,
                        details: serde_json::from_str(&details).unwrap_or_default(),
                        ip_address: row.get(4)?,
                        user_agent: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((logs, total.max(0) as u64))
    }

    // Session operations
    pub fn create_session(
        &self,
        session_id: &str,
        user_id: &str,
        refresh_token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (id, user_id, refresh_token_hash, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, user_id, refresh_token_hash, expires_at, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, ApiError> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT id, user_id, refresh_token_hash, expires_at, revoked FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        refresh_token_hash: row.get(2)?,
                        expires_at: row.get(3)?,
                        revoked: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn revoke_session(&self, session_id: &str) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET revoked = 1 WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    // One-time email token operations
    pub fn create_email_token(
        &self,
        token_hash: &str,
        user_id: &str,
        kind: OtpKind,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO email_tokens (token_hash, user_id, kind, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token_hash, user_id, kind.as_str(), expires_at, Utc::now()],
        )?;
        Ok(())
    }

    /// Marks the token used and returns its user, if it is unused, unexpired and of `kind`.
    pub fn consume_email_token(
        &self,
        token_hash: &str,
        kind: OtpKind,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let found: Option<(String, DateTime<Utc>)> = tx
            .query_row(
                "SELECT user_id, expires_at FROM email_tokens \
                 WHERE token_hash = ?1 AND kind = ?2 AND consumed = 0",
                params![token_hash, kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let user_id = match found {
            Some((user_id, expires_at)) if expires_at >= now => user_id,
            _ => return Ok(None),
        };

        tx.execute(
            "UPDATE email_tokens SET consumed = 1 WHERE token_hash = ?1",
            params![token_hash],
        )?;
        tx.commit()?;
        Ok(Some(user_id))
    }
}

#[async_trait]
impl ApiKeyStore for Database {
    async fn find_active_key(&self, key_value: &str) -> Result<Option<ApiKey>, ApiError> {
        self.get_active_api_key_by_hash(&hash_secret(key_value))
    }

    async fn touch_last_used(&self, key_id: i64, at: DateTime<Utc>) -> Result<(), ApiError> {
        self.update_api_key_usage(key_id, at)
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let status: String = row.get(8)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        email_confirmed_at: row.get(3)?,
        last_sign_in_at: row.get(4)?,
        role: Role {
            id: row.get(5)?,
            name: row.get(6)?,
            description: row.get(7)?,
        },
        status: UserStatus::parse(&status).unwrap_or(UserStatus::Pending),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let permissions_json: String = row.get(4)?;
    Ok(ApiKey {
        id: row.get(0)?,
        key_name: row.get(1)?,
        key_hash: row.get(2)?,
        key_prefix: row.get(3)?,
        permissions: serde_json::from_str(&permissions_json).unwrap_or_default(),
        is_active: row.get(5)?,
        expires_at: row.get(6)?,
        last_used_at: row.get(7)?,
        user_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Search terms match literally; `%` and `_` lose their wildcard meaning.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn map_constraint(err: rusqlite::Error) -> ApiError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_UNIQUE => return ApiError::UserExists,
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return ApiError::Validation(vec![FieldError::new("role_id", "Role does not exist")])
            }
            _ => {}
        }
    }
    ApiError::Database(err)
}
