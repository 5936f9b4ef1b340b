use serde::{Deserialize, Serialize};

use super::auth::{compose_refresh_parts, AuthRecord, RefreshParts};

// One pooled Google account. The persisted field names are camelCase: the
// on-disk document is shared with the host and must stay stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
    pub added_at: i64,
    pub last_used: i64,
    #[serde(default)]
    pub is_rate_limited: bool,
    #[serde(default)]
    pub rate_limit_reset_time: i64,

    // Runtime-only access token cache, never persisted.
    #[serde(skip)]
    pub access_token: Option<String>,
    #[serde(skip)]
    pub access_token_expires_at: i64,
}

impl Account {
    pub fn new(email: impl Into<String>, parts: RefreshParts) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            email: email.into(),
            refresh_token: parts.refresh_token,
            project_id: parts.project_id,
            managed_project_id: parts.managed_project_id,
            added_at: now,
            last_used: now,
            is_rate_limited: false,
            rate_limit_reset_time: 0,
            access_token: None,
            access_token_expires_at: 0,
        }
    }

    pub fn is_cooled(&self, now_ms: i64) -> bool {
        self.is_rate_limited && self.rate_limit_reset_time > now_ms
    }

    pub fn refresh_parts(&self) -> RefreshParts {
        RefreshParts {
            refresh_token: self.refresh_token.clone(),
            project_id: self.project_id.clone(),
            managed_project_id: self.managed_project_id.clone(),
        }
    }

    // Materializes the token bundle, including the cached access token when
    // one is present.
    pub fn auth_details(&self) -> AuthRecord {
        let mut record = AuthRecord::oauth(compose_refresh_parts(&self.refresh_parts()));
        if let Some(access) = &self.access_token {
            record.access = Some(access.clone());
            record.expires = Some(self.access_token_expires_at);
        }
        record
    }

    pub fn display_email(&self) -> &str {
        if self.email.is_empty() {
            "<unknown>"
        } else {
            &self.email
        }
    }
}

pub const POOL_DOCUMENT_VERSION: u32 = 1;

// The persisted pool document: `{ version, accounts, activeIndex }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDocument {
    pub version: u32,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub active_index: usize,
}

impl Default for PoolDocument {
    fn default() -> Self {
        Self {
            version: POOL_DOCUMENT_VERSION,
            accounts: Vec::new(),
            active_index: 0,
        }
    }
}

impl PoolDocument {
    pub fn clamp_active_index(&mut self) {
        if self.accounts.is_empty() || self.active_index >= self.accounts.len() {
            self.active_index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::auth::parse_refresh_parts;

    #[test]
    fn account_serialization_uses_camel_case_contract() {
        let account = Account::new("a@example.com", parse_refresh_parts("rt|proj").unwrap());
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["refreshToken"], "rt");
        assert_eq!(json["projectId"], "proj");
        assert!(json.get("addedAt").is_some());
        assert!(json.get("rateLimitResetTime").is_some());
        // Transient token cache must never reach disk.
        assert!(json.get("accessToken").is_none());
        assert!(json.get("access_token").is_none());
    }

    #[test]
    fn auth_details_includes_cached_access_token() {
        let mut account = Account::new("a@example.com", RefreshParts::new("rt"));
        assert_eq!(account.auth_details().access, None);
        account.access_token = Some("ya29.token".to_string());
        account.access_token_expires_at = 12345;
        let record = account.auth_details();
        assert_eq!(record.access.as_deref(), Some("ya29.token"));
        assert_eq!(record.expires, Some(12345));
    }

    #[test]
    fn clamp_resets_out_of_range_index() {
        let mut doc = PoolDocument {
            accounts: vec![Account::new("a", RefreshParts::new("rt"))],
            active_index: 9,
            ..Default::default()
        };
        doc.clamp_active_index();
        assert_eq!(doc.active_index, 0);
    }

    #[test]
    fn cooldown_check_uses_reset_time() {
        let mut account = Account::new("a", RefreshParts::new("rt"));
        account.is_rate_limited = true;
        account.rate_limit_reset_time = 1_000;
        assert!(account.is_cooled(999));
        assert!(!account.is_cooled(1_000));
    }
}
