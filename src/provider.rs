use std::sync::Arc;

use crate::error::AppResult;
use crate::models::AuthRecord;
use crate::modules::auth::flow::{self, EnrollmentReport, PendingConnect};
use crate::modules::auth::oauth::{ExchangeSuccess, OauthClient};
use crate::modules::persistence::store::AccountStore;
use crate::modules::system::is_headless;
use crate::proxy::dispatch::DispatchEngine;
use crate::proxy::pool::{self, AccountPool, SharedPool};
use crate::proxy::{HostRequest, HostResponse};

// Seam to the host's credential store: the engine clears it when the last
// refresh token is revoked.
pub trait CredentialHost: Send + Sync {
    fn clear_credentials(&self);
}

pub struct NoopCredentialHost;

impl CredentialHost for NoopCredentialHost {
    fn clear_credentials(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethodKind {
    OAuth,
    Api,
}

#[derive(Debug, Clone)]
pub struct AuthMethodDescriptor {
    pub kind: AuthMethodKind,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeMethod {
    // The redirect lands on the loopback listener without user help.
    Auto,
    // The user pastes the redirect URL or a bare authorization code.
    Code,
}

// One in-flight single-account authorization handed to the host UI.
pub struct Authorization {
    pub url: String,
    pub instructions: String,
    pub method: AuthorizeMethod,
    // Join key between the redirect and the exchange; also embedded in `url`.
    pub state: String,
    flow: PendingConnect,
}

impl Authorization {
    // The host's completion callback: `pasted` is required for the Code
    // method and ignored input for Auto.
    pub async fn callback(self, pasted: Option<String>) -> AppResult<ExchangeSuccess> {
        self.flow.finish(pasted).await
    }
}

pub fn create_provider(provider_id: impl Into<String>) -> Provider {
    Provider {
        id: provider_id.into(),
        oauth: OauthClient::new(),
    }
}

// The host plugin entrypoint: a loader wrapping the dispatch engine plus the
// authentication methods surfaced in the host's auth UI.
pub struct Provider {
    pub id: String,
    oauth: OauthClient,
}

impl Provider {
    pub fn methods(&self) -> Vec<AuthMethodDescriptor> {
        vec![
            AuthMethodDescriptor {
                kind: AuthMethodKind::OAuth,
                label: "Sign in with Google (Antigravity)".to_string(),
            },
            AuthMethodDescriptor {
                kind: AuthMethodKind::Api,
                label: "Manually enter API key".to_string(),
            },
        ]
    }

    // Builds the request pathway. `api_key` is deliberately empty: all
    // authentication happens per-request inside the engine.
    pub fn loader(
        &self,
        seed_auth: Option<AuthRecord>,
        host: Arc<dyn CredentialHost>,
    ) -> AppResult<Loader> {
        let store = AccountStore::at_default_location()?;
        let pool = pool::shared(AccountPool::load_from_disk(store, seed_auth.as_ref()));
        Ok(Loader::new(pool, self.oauth.clone(), host))
    }

    // Single-account connect for the host-embedded UI (`/connect`).
    pub async fn authorize(&self, project_id: Option<String>) -> AppResult<Authorization> {
        let pending = flow::begin_connect(&self.oauth, project_id).await?;
        let method = if is_headless() {
            AuthorizeMethod::Code
        } else {
            AuthorizeMethod::Auto
        };
        Ok(Authorization {
            url: pending.url().to_string(),
            instructions: pending.instructions(),
            method,
            state: pending.state().to_string(),
            flow: pending,
        })
    }

    // Interactive multi-account enrollment (`opencode auth login`).
    pub async fn login(&self, pool: &SharedPool) -> AppResult<EnrollmentReport> {
        flow::login_flow(pool, &self.oauth).await
    }
}

pub struct Loader {
    pub api_key: String,
    engine: DispatchEngine,
    pool: SharedPool,
}

impl Loader {
    pub fn new(pool: SharedPool, oauth: OauthClient, host: Arc<dyn CredentialHost>) -> Self {
        let engine = DispatchEngine::new(
            pool.clone(),
            oauth,
            crate::constants::default_endpoints(),
            host,
        );
        Self {
            api_key: String::new(),
            engine,
            pool,
        }
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    pub async fn fetch(&self, request: HostRequest) -> AppResult<HostResponse> {
        self.engine.fetch(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_exposes_oauth_and_api_methods() {
        let provider = create_provider("antigravity");
        let methods = provider.methods();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].kind, AuthMethodKind::OAuth);
        assert_eq!(methods[1].kind, AuthMethodKind::Api);
    }

    #[test]
    fn loader_has_empty_api_key() {
        let provider = create_provider("antigravity");
        let loader = provider
            .loader(None, Arc::new(NoopCredentialHost))
            .expect("loader");
        assert!(loader.api_key.is_empty());
    }
}
