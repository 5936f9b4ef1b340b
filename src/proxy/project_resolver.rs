use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::models::auth::{compose_refresh_parts, parse_refresh_parts, AuthRecord};

// Identity metadata sent with every project-discovery call.
fn client_metadata() -> Value {
    json!({
        "ideType": "ANTIGRAVITY",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI"
    })
}

#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub auth: AuthRecord,
    pub effective_project_id: String,
    pub mutated: bool,
}

// Ensures the auth record carries a usable project id. The user-chosen
// project wins, then a previously assigned managed project; otherwise the
// upstream discovery API is asked to produce one and the managed id is
// written back into the composite.
pub async fn ensure_project_context(
    http: &reqwest::Client,
    discovery_base: &str,
    auth: &AuthRecord,
) -> AppResult<ProjectContext> {
    let mut parts = parse_refresh_parts(&auth.refresh)
        .ok_or_else(|| AppError::Account("malformed refresh composite".to_string()))?;

    if let Some(project) = parts.project_id.clone() {
        return Ok(ProjectContext {
            auth: auth.clone(),
            effective_project_id: project,
            mutated: false,
        });
    }
    if let Some(managed) = parts.managed_project_id.clone() {
        return Ok(ProjectContext {
            auth: auth.clone(),
            effective_project_id: managed,
            mutated: false,
        });
    }

    let access = auth
        .access
        .as_deref()
        .ok_or_else(|| AppError::Account("no access token for project discovery".to_string()))?;

    let managed = discover_managed_project(http, discovery_base, access).await?;
    tracing::info!("Resolved managed project {}", managed);

    parts.managed_project_id = Some(managed.clone());
    let mut updated = AuthRecord::oauth(compose_refresh_parts(&parts));
    updated.access = auth.access.clone();
    updated.expires = auth.expires;

    Ok(ProjectContext {
        auth: updated,
        effective_project_id: managed,
        mutated: true,
    })
}

// loadCodeAssist reports the companion project for onboarded accounts;
// accounts without one go through the onboardUser long-running operation.
async fn discover_managed_project(
    http: &reqwest::Client,
    discovery_base: &str,
    access_token: &str,
) -> AppResult<String> {
    let load_url = format!("{}/v1internal:loadCodeAssist", discovery_base);
    let response = http
        .post(&load_url)
        .bearer_auth(access_token)
        .header("User-Agent", crate::constants::USER_AGENT.as_str())
        .json(&json!({ "metadata": client_metadata() }))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Account(format!(
            "loadCodeAssist returned {}: {}",
            status, body
        )));
    }
    let data: Value = response.json().await?;

    if let Some(project) = data.get("cloudaicompanionProject").and_then(|v| v.as_str()) {
        return Ok(project.to_string());
    }

    let tier_id = data
        .get("allowedTiers")
        .and_then(|t| t.as_array())
        .and_then(|tiers| {
            tiers
                .iter()
                .find(|t| t.get("isDefault").and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .and_then(|t| t.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or("free-tier")
        .to_string();

    onboard_user(http, discovery_base, access_token, &tier_id).await
}

async fn onboard_user(
    http: &reqwest::Client,
    discovery_base: &str,
    access_token: &str,
    tier_id: &str,
) -> AppResult<String> {
    let onboard_url = format!("{}/v1internal:onboardUser", discovery_base);
    let body = json!({
        "tierId": tier_id,
        "metadata": client_metadata(),
    });

    // The operation usually completes on the first call; poll a handful of
    // times before giving up and letting the engine rotate accounts.
    for attempt in 0..5 {
        let response = http
            .post(&onboard_url)
            .bearer_auth(access_token)
            .header("User-Agent", crate::constants::USER_AGENT.as_str())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Account(format!(
                "onboardUser returned {}: {}",
                status, text
            )));
        }
        let operation: Value = response.json().await?;
        let done = operation
            .get("done")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if done {
            if let Some(id) = operation
                .get("response")
                .and_then(|r| r.get("cloudaicompanionProject"))
                .and_then(|p| p.get("id"))
                .and_then(|v| v.as_str())
            {
                return Ok(id.to_string());
            }
            return Err(AppError::Account(
                "onboardUser completed without a companion project".to_string(),
            ));
        }
        tracing::debug!("onboardUser pending (attempt {})", attempt + 1);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    Err(AppError::Account(
        "onboardUser did not complete in time".to_string(),
    ))
}
