use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::constants::{endpoint_label, ACCESS_TOKEN_EXPIRY_SKEW_MS};
use crate::error::{AppError, AppResult};
use crate::models::auth::AuthRecord;
use crate::modules::auth::oauth::{OauthClient, RefreshError};
use crate::provider::CredentialHost;

use super::pool::{lock, SharedPool};
use super::request_rewriter::{self, Prepared};
use super::response::{self, Disposition};
use super::{debug_logger, project_resolver, HostBody, HostRequest, HostResponse};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// The two-level retry loop: rotate accounts in the outer loop, fall through
// the endpoint list in the inner one. All pool transitions are followed by a
// best-effort persist.
pub struct DispatchEngine {
    pool: SharedPool,
    oauth: OauthClient,
    endpoints: Vec<String>,
    http: reqwest::Client,
    host: Arc<dyn CredentialHost>,
}

impl DispatchEngine {
    pub fn new(
        pool: SharedPool,
        oauth: OauthClient,
        endpoints: Vec<String>,
        host: Arc<dyn CredentialHost>,
    ) -> Self {
        debug_assert!(!endpoints.is_empty());
        Self {
            pool,
            oauth,
            endpoints,
            http: crate::utils::http::get_dispatch_client(),
            host,
        }
    }

    pub async fn fetch(&self, request: HostRequest) -> AppResult<HostResponse> {
        if !request_rewriter::is_generative_request(&request.url) {
            return self.passthrough(request).await;
        }
        if debug_logger::is_enabled() {
            debug_logger::log_event(
                "request",
                json!({ "method": request.method.as_str(), "url": request.url }),
            );
        }

        let total = lock(&self.pool).count();
        if total == 0 {
            return Err(AppError::NoAccounts);
        }

        let mut last_failure: Option<(reqwest::Response, Prepared)> = None;
        let mut last_error: Option<AppError> = None;

        // Bounded by the pool size at entry; evictions shrink the pool but
        // never extend the walk.
        for _ in 0..total {
            let picked = lock(&self.pool).pick_next();
            let Some(account) = picked else {
                let (count, wait_ms) = {
                    let pool = lock(&self.pool);
                    (pool.count(), pool.min_wait_ms())
                };
                let wait_secs = (wait_ms.max(0) as u64).div_ceil(1000);
                return Err(AppError::AllAccountsCooled { count, wait_secs });
            };
            self.persist_best_effort("rotation");

            let email = account.display_email().to_string();
            let token = &account.refresh_token;

            // Lazy refresh: only when the cached access token is missing or
            // inside the expiry skew.
            let mut auth = match lock(&self.pool).to_auth_details(token) {
                Some(auth) => auth,
                None => continue,
            };
            if needs_refresh(&auth) {
                match self.oauth.refresh(&auth).await {
                    Ok(refreshed) => {
                        lock(&self.pool).update_from_auth(token, &refreshed);
                        self.persist_best_effort("token-refresh");
                        auth = refreshed;
                    }
                    Err(RefreshError::InvalidGrant(msg)) => {
                        warn!(
                            "[W-REFRESH-REVOKED] evicting_account {}: {}",
                            email, msg
                        );
                        let emptied = {
                            let mut pool = lock(&self.pool);
                            pool.remove_account(token);
                            pool.count() == 0
                        };
                        if emptied {
                            if let Err(e) = lock(&self.pool).clear_persisted() {
                                warn!("[W-POOL-CLEAR] failed_to_clear_accounts_document: {}", e);
                            }
                            self.host.clear_credentials();
                            return Err(AppError::Reauthenticate);
                        }
                        self.persist_best_effort("eviction");
                        last_error = Some(AppError::OAuth(msg));
                        continue;
                    }
                    Err(RefreshError::Transient(msg)) => {
                        warn!("[W-REFRESH-FAILED] {}: {}", email, msg);
                        last_error = Some(AppError::OAuth(msg));
                        continue;
                    }
                }
            }

            // Project discovery may mutate the composite; fold the change
            // back into the pool before dispatching.
            let discovery_base = &self.endpoints[0];
            let context =
                match project_resolver::ensure_project_context(&self.http, discovery_base, &auth)
                    .await
                {
                    Ok(context) => context,
                    Err(e) => {
                        warn!("[W-PROJECT-RESOLVE] {}: {}", email, e);
                        last_error = Some(e);
                        continue;
                    }
                };
            if context.mutated {
                lock(&self.pool).update_from_auth(token, &context.auth);
                self.persist_best_effort("project-resolution");
            }
            let Some(access) = context.auth.access.clone() else {
                last_error = Some(AppError::Account(format!(
                    "account {} has no access token after refresh",
                    email
                )));
                continue;
            };

            for (i, endpoint) in self.endpoints.iter().enumerate() {
                let has_next = i + 1 < self.endpoints.len();
                let prepared = request_rewriter::prepare(
                    &request,
                    &access,
                    &context.effective_project_id,
                    endpoint,
                )?;

                match self.execute(&prepared).await {
                    Ok(upstream) => {
                        let status = upstream.status();
                        let pool_len = lock(&self.pool).count();
                        match response::classify(status, upstream.headers(), pool_len, has_next) {
                            Disposition::CooldownAccount { retry_after_ms } => {
                                info!(
                                    "Account {} rate-limited at {} endpoint, rotating",
                                    email,
                                    endpoint_label(endpoint)
                                );
                                lock(&self.pool).mark_rate_limited(token, retry_after_ms);
                                self.persist_best_effort("cooldown");
                                debug_logger::log_event(
                                    "cooldown",
                                    json!({ "email": email, "retry_after_ms": retry_after_ms }),
                                );
                                last_failure = Some((upstream, prepared));
                                break;
                            }
                            Disposition::FallbackEndpoint => {
                                warn!(
                                    "Endpoint {} returned {}, trying next endpoint",
                                    endpoint_label(endpoint),
                                    status
                                );
                                last_failure = Some((upstream, prepared));
                                continue;
                            }
                            Disposition::Return => {
                                if i > 0 {
                                    info!(
                                        "Endpoint fallback succeeded at {} ({})",
                                        endpoint_label(endpoint),
                                        status
                                    );
                                } else {
                                    debug!(
                                        "Upstream {} responded {}",
                                        endpoint_label(endpoint),
                                        status
                                    );
                                }
                                debug_logger::log_event(
                                    "response",
                                    json!({ "status": status.as_u16(), "endpoint": endpoint }),
                                );
                                return Ok(response::transform(upstream, &prepared).await);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "HTTP request failed at {} endpoint: {}",
                            endpoint_label(endpoint),
                            e
                        );
                        last_error = Some(AppError::Network(e));
                        if has_next {
                            continue;
                        }
                        break;
                    }
                }
            }
            // Cooldown or exhausted endpoints: rotate to the next account.
        }

        if let Some((upstream, prepared)) = last_failure {
            debug_logger::log_event(
                "response",
                json!({ "status": upstream.status().as_u16(), "terminal": "last-failure" }),
            );
            return Ok(response::transform(upstream, &prepared).await);
        }
        Err(last_error
            .unwrap_or_else(|| AppError::Unknown("all accounts failed".to_string())))
    }

    async fn execute(&self, prepared: &Prepared) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .http
            .request(prepared.method.clone(), &prepared.url)
            .headers(prepared.headers.clone());
        if let Some(body) = &prepared.body {
            builder = builder.body(body.clone());
        }
        builder.send().await
    }

    // Non-generative traffic goes straight to the underlying fetch.
    async fn passthrough(&self, request: HostRequest) -> AppResult<HostResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let upstream = builder.send().await?;
        Ok(HostResponse {
            status: upstream.status(),
            headers: upstream.headers().clone(),
            body: HostBody::Stream(futures::StreamExt::boxed(upstream.bytes_stream())),
        })
    }

    fn persist_best_effort(&self, what: &str) {
        if let Err(e) = lock(&self.pool).save_to_disk() {
            warn!("[W-POOL-PERSIST] failed_to_persist_{}: {}", what, e);
        }
    }
}

fn needs_refresh(auth: &AuthRecord) -> bool {
    match (&auth.access, auth.expires) {
        (Some(_), Some(expires)) => expires <= now_ms() + ACCESS_TOKEN_EXPIRY_SKEW_MS,
        (Some(_), None) => true,
        (None, _) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_needed_without_access_token() {
        assert!(needs_refresh(&AuthRecord::oauth("rt")));
    }

    #[test]
    fn refresh_needed_inside_expiry_skew() {
        let soon = now_ms() + ACCESS_TOKEN_EXPIRY_SKEW_MS - 1000;
        assert!(needs_refresh(
            &AuthRecord::oauth("rt").with_access("tok", soon)
        ));
    }

    #[test]
    fn fresh_token_is_reused() {
        let later = now_ms() + ACCESS_TOKEN_EXPIRY_SKEW_MS + 60_000;
        assert!(!needs_refresh(
            &AuthRecord::oauth("rt").with_access("tok", later)
        ));
    }
}
