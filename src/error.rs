use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account error: {0}")]
    Account(String),

    #[error("No Antigravity accounts configured. Run `opencode auth login` to connect a Google account.")]
    NoAccounts,

    #[error("All {count} account(s) are rate-limited. Try again in {wait_secs} second(s).")]
    AllAccountsCooled { count: usize, wait_secs: u64 },

    #[error("Every Antigravity refresh token was revoked. Run `opencode auth login` to reauthenticate.")]
    Reauthenticate,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AppResult<T> = Result<T, AppError>;
