use serde::{Deserialize, Serialize};

pub const AUTH_TYPE_OAUTH: &str = "oauth";

// The token bundle exchanged with the host's credential store. `refresh` is
// the composite string; `access`/`expires` are the runtime-cached access
// token and its epoch-ms expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub refresh: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl AuthRecord {
    pub fn oauth(refresh: impl Into<String>) -> Self {
        Self {
            kind: AUTH_TYPE_OAUTH.to_string(),
            refresh: refresh.into(),
            access: None,
            expires: None,
        }
    }

    pub fn with_access(mut self, access: impl Into<String>, expires: i64) -> Self {
        self.access = Some(access.into());
        self.expires = Some(expires);
        self
    }

    // A record is usable as a pool seed when it is an oauth record whose
    // composite parses to a non-empty refresh token.
    pub fn is_seedable(&self) -> bool {
        self.kind == AUTH_TYPE_OAUTH && parse_refresh_parts(&self.refresh).is_some()
    }
}

// Decoded form of the composite refresh string. `None` and the empty string
// are the same value on the wire; parsing never yields `Some("")`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshParts {
    pub refresh_token: String,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
}

impl RefreshParts {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            project_id: None,
            managed_project_id: None,
        }
    }
}

const SEPARATOR: char = '|';

// `refreshToken|projectId|managedProjectId`, trailing empty parts omitted.
// Byte-for-byte contract with the host credential store.
pub fn compose_refresh_parts(parts: &RefreshParts) -> String {
    let project = parts.project_id.as_deref().unwrap_or("");
    let managed = parts.managed_project_id.as_deref().unwrap_or("");
    if !managed.is_empty() {
        format!("{}{SEPARATOR}{}{SEPARATOR}{}", parts.refresh_token, project, managed)
    } else if !project.is_empty() {
        format!("{}{SEPARATOR}{}", parts.refresh_token, project)
    } else {
        parts.refresh_token.clone()
    }
}

// Returns None when the refresh-token segment is empty: such a composite can
// never be used and must not seed an account.
pub fn parse_refresh_parts(composite: &str) -> Option<RefreshParts> {
    let mut segments = composite.splitn(3, SEPARATOR);
    let refresh_token = segments.next().unwrap_or_default();
    if refresh_token.is_empty() {
        return None;
    }
    let non_empty = |s: &str| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };
    Some(RefreshParts {
        refresh_token: refresh_token.to_string(),
        project_id: segments.next().and_then(non_empty),
        managed_project_id: segments.next().and_then(non_empty),
    })
}
