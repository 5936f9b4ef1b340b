use std::sync::LazyLock;

// Cloudcode endpoints tried in fallback order. The sandbox environments sit
// in front of the prod surface and absorb most of the 429 pressure.
pub const ENDPOINT_DAILY: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const ENDPOINT_AUTOPUSH: &str = "https://autopush-cloudcode-pa.sandbox.googleapis.com";
pub const ENDPOINT_PROD: &str = "https://cloudcode-pa.googleapis.com";

pub fn default_endpoints() -> Vec<String> {
    vec![
        ENDPOINT_DAILY.to_string(),
        ENDPOINT_AUTOPUSH.to_string(),
        ENDPOINT_PROD.to_string(),
    ]
}

pub fn endpoint_label(endpoint: &str) -> &'static str {
    if endpoint.contains("daily-") {
        "daily"
    } else if endpoint.contains("autopush-") {
        "autopush"
    } else {
        "prod"
    }
}

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

pub const OAUTH_SCOPES: &str = concat!(
    "https://www.googleapis.com/auth/cloud-platform ",
    "https://www.googleapis.com/auth/userinfo.email ",
    "https://www.googleapis.com/auth/userinfo.profile ",
    "https://www.googleapis.com/auth/cclog ",
    "https://www.googleapis.com/auth/experimentsandconfigs"
);

// Installed-app credentials shipped with the Antigravity IDE; overridable via
// the environment for self-provisioned OAuth clients.
const DEFAULT_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const DEFAULT_CLIENT_SECRET: &str = "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";

fn env_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

pub fn oauth_client_id() -> String {
    env_first(&[
        "ANTIGRAVITY_RELAY_OAUTH_CLIENT_ID",
        "GOOGLE_OAUTH_CLIENT_ID",
    ])
    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string())
}

pub fn oauth_client_secret() -> Option<String> {
    env_first(&[
        "ANTIGRAVITY_RELAY_OAUTH_CLIENT_SECRET",
        "GOOGLE_OAUTH_CLIENT_SECRET",
    ])
    .or_else(|| Some(DEFAULT_CLIENT_SECRET.to_string()))
    .filter(|s| !s.is_empty())
}

// Environment contract with the host CLI.
pub const ENV_HEADLESS: &str = "OPENCODE_HEADLESS";
pub const ENV_DEBUG: &str = "OPENCODE_ANTIGRAVITY_DEBUG";
pub const ENV_DATA_DIR: &str = "ANTIGRAVITY_RELAY_DATA_DIR";
pub const SSH_ENV_SIGNALS: [&str; 3] = ["SSH_CONNECTION", "SSH_CLIENT", "SSH_TTY"];

pub const ACCOUNTS_FILE: &str = "antigravity-accounts.json";

// Access tokens are refreshed when they are within this skew of expiry.
pub const ACCESS_TOKEN_EXPIRY_SKEW_MS: i64 = 300_000;

// Cooldown applied to a 429 with no parseable retry-after information.
pub const DEFAULT_RETRY_AFTER_MS: i64 = 60_000;

pub const MAX_ENROLL_ACCOUNTS: usize = 10;

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "antigravity-relay/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
