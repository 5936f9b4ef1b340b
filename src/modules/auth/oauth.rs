use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

use crate::constants::{
    oauth_client_id, oauth_client_secret, AUTH_URL, OAUTH_SCOPES, TOKEN_URL, USERINFO_URL,
};
use crate::error::{AppError, AppResult};
use crate::models::auth::{compose_refresh_parts, parse_refresh_parts, AuthRecord, RefreshParts};

pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn pkce_challenge_s256(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    pub name: Option<String>,
}

// Refresh failures split into the one kind that can never succeed again and
// everything else.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh token revoked: {0}")]
    InvalidGrant(String),
    #[error("token refresh failed: {0}")]
    Transient(String),
}

// Pending authorization: `state` is embedded in `url` and joins the redirect
// back to the exchange; `project_id` is carried into the composite on
// success.
#[derive(Debug, Clone)]
pub struct AuthorizationHandle {
    pub url: String,
    pub state: String,
    pub verifier: String,
    pub project_id: Option<String>,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeSuccess {
    pub email: String,
    pub refresh: String,
    pub access: String,
    pub expires: i64,
}

#[derive(Debug, Clone)]
pub struct OauthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl Default for OauthEndpoints {
    fn default() -> Self {
        Self {
            auth_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            userinfo_url: USERINFO_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OauthClient {
    endpoints: OauthEndpoints,
    http: reqwest::Client,
}

impl Default for OauthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OauthClient {
    pub fn new() -> Self {
        Self {
            endpoints: OauthEndpoints::default(),
            http: crate::utils::http::get_long_client(),
        }
    }

    pub fn with_endpoints(endpoints: OauthEndpoints) -> Self {
        Self {
            endpoints,
            http: crate::utils::http::get_long_client(),
        }
    }

    // Builds the consent URL with fresh PKCE material and a random state.
    pub fn authorize(
        &self,
        project_id: Option<String>,
        redirect_uri: &str,
    ) -> AppResult<AuthorizationHandle> {
        let state = uuid::Uuid::new_v4().to_string();
        let verifier = generate_pkce_verifier();
        let challenge = pkce_challenge_s256(&verifier);
        let cid = oauth_client_id();

        let params = vec![
            ("client_id", cid.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", OAUTH_SCOPES),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
            ("state", state.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        let url = url::Url::parse_with_params(&self.endpoints.auth_url, &params)
            .map_err(|e| AppError::OAuth(format!("invalid authorization URL: {}", e)))?;

        Ok(AuthorizationHandle {
            url: url.to_string(),
            state,
            verifier,
            project_id,
            redirect_uri: redirect_uri.to_string(),
        })
    }

    // Completes the code exchange and resolves the account email. The
    // returned composite carries the handle's project id.
    pub async fn exchange(
        &self,
        handle: &AuthorizationHandle,
        code: &str,
    ) -> AppResult<ExchangeSuccess> {
        let cid = oauth_client_id();
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", cid),
            ("code", code.to_string()),
            ("redirect_uri", handle.redirect_uri.clone()),
            ("grant_type", "authorization_code".to_string()),
            ("code_verifier", handle.verifier.clone()),
        ];
        if let Some(secret) = oauth_client_secret() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    AppError::OAuth(format!(
                        "token exchange request failed: {}. Check your network connection to Google services.",
                        e
                    ))
                } else {
                    AppError::OAuth(format!("token exchange request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "token exchange failed: {}",
                error_text
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::OAuth(format!("token response parsing failed: {}", e)))?;
        let refresh_token = token.refresh_token.ok_or_else(|| {
            AppError::OAuth(
                "Google did not return a refresh_token; revoke the app's access and retry"
                    .to_string(),
            )
        })?;

        let user = self.fetch_user_info(&token.access_token).await?;
        tracing::info!("Token exchange successful for {}", user.email);

        let parts = RefreshParts {
            refresh_token,
            project_id: handle.project_id.clone().filter(|p| !p.is_empty()),
            managed_project_id: None,
        };
        Ok(ExchangeSuccess {
            email: user.email,
            refresh: compose_refresh_parts(&parts),
            access: token.access_token,
            expires: chrono::Utc::now().timestamp_millis() + token.expires_in * 1000,
        })
    }

    // Obtains a new access token for the composite's refresh token. Project
    // parts of the composite are preserved untouched.
    pub async fn refresh(&self, record: &AuthRecord) -> Result<AuthRecord, RefreshError> {
        let parts = parse_refresh_parts(&record.refresh)
            .ok_or_else(|| RefreshError::InvalidGrant("malformed refresh composite".to_string()))?;

        let cid = oauth_client_id();
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", cid),
            ("refresh_token", parts.refresh_token.clone()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(secret) = oauth_client_secret() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() && is_invalid_grant(&body) {
                return Err(RefreshError::InvalidGrant(body));
            }
            return Err(RefreshError::Transient(format!(
                "refresh failed with {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::Transient(format!("refresh response parsing failed: {}", e)))?;
        tracing::debug!(
            "Token refreshed, expires in {} second(s)",
            token.expires_in
        );

        Ok(AuthRecord::oauth(record.refresh.clone()).with_access(
            token.access_token,
            chrono::Utc::now().timestamp_millis() + token.expires_in * 1000,
        ))
    }

    async fn fetch_user_info(&self, access_token: &str) -> AppResult<UserInfo> {
        let response = crate::utils::http::get_client()
            .get(&self.endpoints.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::OAuth(format!("user info request failed: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "failed to get user info: {}",
                error_text
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::OAuth(format!("user info parsing failed: {}", e)))
    }
}

fn is_invalid_grant(body: &str) -> bool {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if json.get("error").and_then(|v| v.as_str()) == Some("invalid_grant") {
            return true;
        }
    }
    body.contains("invalid_grant")
}
