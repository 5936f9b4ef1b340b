use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::constants::MAX_ENROLL_ACCOUNTS;
use crate::error::{AppError, AppResult};
use crate::modules::auth::oauth::{AuthorizationHandle, ExchangeSuccess, OauthClient};
use crate::modules::auth::oauth_server::{open_browser_url, LoopbackListener, RedirectOutcome};
use crate::modules::system::is_headless;
use crate::proxy::pool::{lock, EnrollOutcome, SharedPool};

// A prepared single-account connect: the authorization URL has been issued
// and the loopback listener (headful) is armed. `finish` consumes the flow,
// closing the listener on every path.
pub struct PendingConnect {
    oauth: OauthClient,
    handle: AuthorizationHandle,
    listener: Option<LoopbackListener>,
    headless: bool,
}

impl PendingConnect {
    pub fn url(&self) -> &str {
        &self.handle.url
    }

    pub fn state(&self) -> &str {
        &self.handle.state
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn instructions(&self) -> String {
        if self.headless {
            "Open the URL in a browser, sign in with your Google account, then paste the \
             redirect URL or the authorization code here."
                .to_string()
        } else {
            "Your browser has been opened to sign in with Google. Waiting for the redirect..."
                .to_string()
        }
    }

    // Headful path: await the loopback redirect. Headless path (or when the
    // host already collected input): parse the pasted URL/code.
    pub async fn finish(mut self, pasted: Option<String>) -> AppResult<ExchangeSuccess> {
        let outcome = match pasted {
            Some(input) => parse_pasted_input(&input, &self.handle.state)?,
            None => {
                let listener = self.listener.as_mut().ok_or_else(|| {
                    AppError::OAuth(
                        "no pasted authorization input and no active loopback listener".to_string(),
                    )
                })?;
                listener.wait_for_redirect().await?
            }
        };
        // The listener's job is done whichever path delivered the code.
        if let Some(listener) = self.listener.take() {
            listener.close();
        }

        if let Some(received) = &outcome.state {
            if received != &self.handle.state {
                return Err(AppError::OAuth(
                    "OAuth state mismatch (CSRF protection)".to_string(),
                ));
            }
        }

        let success = self.oauth.exchange(&self.handle, &outcome.code).await?;
        Ok(success)
    }
}

// Starts one authorization: binds the loopback listener, builds the consent
// URL, and opens the browser unless headless.
pub async fn begin_connect(
    oauth: &OauthClient,
    project_id: Option<String>,
) -> AppResult<PendingConnect> {
    let headless = is_headless();
    let listener = LoopbackListener::bind().await?;
    let handle = oauth.authorize(project_id, listener.redirect_uri())?;

    if !headless {
        if let Err(e) = open_browser_url(&handle.url) {
            warn!(
                "[W-BROWSER-OPEN] {}; open the URL manually: {}",
                e, handle.url
            );
        }
    }

    Ok(PendingConnect {
        oauth: oauth.clone(),
        handle,
        listener: Some(listener),
        headless,
    })
}

// Pasted input is either the full redirect URL (code and state extracted) or
// a bare authorization code, in which case the originally generated state is
// assumed.
pub fn parse_pasted_input(input: &str, fallback_state: &str) -> AppResult<RedirectOutcome> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AppError::OAuth("empty authorization input".to_string()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url = url::Url::parse(trimmed)
            .map_err(|e| AppError::OAuth(format!("unparseable redirect URL: {}", e)))?;
        let mut code = None;
        let mut state = None;
        for (k, v) in url.query_pairs() {
            if k == "code" {
                code = Some(v.to_string());
            } else if k == "state" {
                state = Some(v.to_string());
            }
        }
        let code = code.ok_or_else(|| {
            AppError::OAuth("redirect URL carries no authorization code".to_string())
        })?;
        return Ok(RedirectOutcome {
            code,
            state: Some(state.unwrap_or_else(|| fallback_state.to_string())),
        });
    }
    Ok(RedirectOutcome {
        code: trimmed.to_string(),
        state: Some(fallback_state.to_string()),
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentReport {
    pub added: usize,
    pub updated: usize,
}

// Interactive `opencode auth login` loop: enroll up to MAX_ENROLL_ACCOUNTS
// accounts, one authorization each.
pub async fn login_flow(pool: &SharedPool, oauth: &OauthClient) -> AppResult<EnrollmentReport> {
    let mut report = EnrollmentReport::default();

    for enrolled in 0..MAX_ENROLL_ACCOUNTS {
        let project_id = prompt("Google Cloud project id (leave blank for a managed project): ")
            .await?
            .trim()
            .to_string();
        let project_id = if project_id.is_empty() {
            None
        } else {
            Some(project_id)
        };

        let pending = begin_connect(oauth, project_id).await?;
        println!("\nAuthorize this device:\n  {}\n", pending.url());
        println!("{}", pending.instructions());

        let success = if pending.headless() {
            let pasted = prompt("Paste the redirect URL or authorization code: ").await?;
            pending.finish(Some(pasted)).await
        } else {
            pending.finish(None).await
        };

        match success {
            Ok(exchange) => {
                enroll_exchange(pool, &exchange, &mut report);
                println!("Connected {}.", exchange.email);
            }
            Err(e) => {
                warn!("[W-ENROLL] authorization_failed: {}", e);
                println!("Authorization failed: {}", e);
            }
        }

        if enrolled + 1 < MAX_ENROLL_ACCOUNTS {
            let again = prompt("Add another account? [y/N] ").await?;
            if !matches!(again.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                break;
            }
        }
    }

    Ok(report)
}

pub fn enroll_exchange(
    pool: &SharedPool,
    exchange: &ExchangeSuccess,
    report: &mut EnrollmentReport,
) {
    let auth = crate::models::AuthRecord::oauth(exchange.refresh.clone())
        .with_access(exchange.access.clone(), exchange.expires);
    let mut guard = lock(pool);
    match guard.enroll(&exchange.email, &auth) {
        Some(EnrollOutcome::Added) => {
            report.added += 1;
            info!("Enrolled new account {}", exchange.email);
        }
        Some(EnrollOutcome::Updated) => {
            report.updated += 1;
            info!("Refreshed existing account {}", exchange.email);
        }
        None => warn!("[W-ENROLL] exchange_produced_unusable_composite"),
    }
    if let Err(e) = guard.save_to_disk() {
        warn!("[W-POOL-PERSIST] failed_to_persist_enrollment: {}", e);
    }
}

// Terminal prompt on tokio stdin; the reader is dropped (and the handle
// released) when the call returns.
async fn prompt(message: &str) -> AppResult<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    reader.read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_code_falls_back_to_generated_state() {
        let outcome = parse_pasted_input("ABC", "XYZ").unwrap();
        assert_eq!(outcome.code, "ABC");
        assert_eq!(outcome.state.as_deref(), Some("XYZ"));
    }

    #[test]
    fn redirect_url_supplies_code_and_state() {
        let outcome = parse_pasted_input(
            "http://127.0.0.1:5001/oauth/callback?code=4%2Fcode&state=real-state",
            "fallback",
        )
        .unwrap();
        assert_eq!(outcome.code, "4/code");
        assert_eq!(outcome.state.as_deref(), Some("real-state"));
    }

    #[test]
    fn redirect_url_without_state_uses_fallback() {
        let outcome =
            parse_pasted_input("http://127.0.0.1:5001/oauth/callback?code=abc", "gen").unwrap();
        assert_eq!(outcome.state.as_deref(), Some("gen"));
    }

    #[test]
    fn empty_and_codeless_inputs_are_rejected() {
        assert!(parse_pasted_input("  ", "s").is_err());
        assert!(parse_pasted_input("http://127.0.0.1/cb?error=denied", "s").is_err());
    }
}
