use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::auth::{parse_refresh_parts, AuthRecord};
use crate::models::{Account, PoolDocument};
use crate::modules::persistence::store::AccountStore;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Added,
    Updated,
}

#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub email: String,
    pub added_at: i64,
    pub last_used: i64,
    pub is_rate_limited: bool,
    pub rate_limit_reset_time: i64,
}

// In-memory model of the account pool. Every method is a short,
// non-suspending critical section; persistence is a separate best-effort
// step after each transition.
pub struct AccountPool {
    doc: PoolDocument,
    store: AccountStore,
    dirty: bool,
}

pub type SharedPool = Arc<Mutex<AccountPool>>;

pub fn shared(pool: AccountPool) -> SharedPool {
    Arc::new(Mutex::new(pool))
}

// Mutex poisoning only happens when a holder panicked mid-section; the pool
// data is still structurally valid, so recover the guard.
pub fn lock(pool: &SharedPool) -> MutexGuard<'_, AccountPool> {
    pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AccountPool {
    // Reads the persisted document, clamping `activeIndex` into range. An
    // empty pool is seeded from the host's auth record when its composite is
    // usable.
    pub fn load_from_disk(store: AccountStore, seed_auth: Option<&AuthRecord>) -> Self {
        let mut doc = match store.load() {
            Ok(Some(doc)) => doc,
            Ok(None) => PoolDocument::default(),
            Err(e) => {
                warn!("[W-POOL-LOAD] failed_to_read_accounts_document: {}", e);
                PoolDocument::default()
            }
        };

        if doc.accounts.is_empty() {
            if let Some(record) = seed_auth.filter(|r| r.is_seedable()) {
                if let Some(parts) = parse_refresh_parts(&record.refresh) {
                    let mut account = Account::new("", parts);
                    account.access_token = record.access.clone();
                    account.access_token_expires_at = record.expires.unwrap_or(0);
                    doc.accounts.push(account);
                    info!("Seeded account pool from host credentials");
                }
            }
        }
        doc.clamp_active_index();

        Self {
            doc,
            store,
            dirty: false,
        }
    }

    pub fn count(&self) -> usize {
        self.doc.accounts.len()
    }

    pub fn active_index(&self) -> usize {
        self.doc.active_index
    }

    pub fn accounts(&self) -> Vec<AccountSummary> {
        self.doc
            .accounts
            .iter()
            .map(|a| AccountSummary {
                email: a.display_email().to_string(),
                added_at: a.added_at,
                last_used: a.last_used,
                is_rate_limited: a.is_cooled(now_ms()),
                rate_limit_reset_time: a.rate_limit_reset_time,
            })
            .collect()
    }

    // Round-robin scan from `activeIndex`. Expired cooldowns encountered
    // during the scan are cleared opportunistically. Returns None iff every
    // account is currently cooled.
    pub fn pick_next(&mut self) -> Option<Account> {
        let len = self.doc.accounts.len();
        if len == 0 {
            return None;
        }
        let now = now_ms();

        for step in 0..len {
            let idx = (self.doc.active_index + step) % len;
            {
                let account = &mut self.doc.accounts[idx];
                if account.is_rate_limited && account.rate_limit_reset_time <= now {
                    debug!(
                        "Cooldown expired for {}, clearing",
                        account.display_email()
                    );
                    account.is_rate_limited = false;
                    account.rate_limit_reset_time = 0;
                    self.dirty = true;
                }
            }
            if !self.doc.accounts[idx].is_cooled(now) {
                self.doc.accounts[idx].last_used = now;
                self.doc.active_index = (idx + 1) % len;
                self.dirty = true;
                return Some(self.doc.accounts[idx].clone());
            }
        }
        None
    }

    // Smallest remaining cooldown across cooled accounts, floored at 0. Only
    // meaningful right after `pick_next` returned None.
    pub fn min_wait_ms(&self) -> i64 {
        let now = now_ms();
        self.doc
            .accounts
            .iter()
            .filter(|a| a.is_cooled(now))
            .map(|a| a.rate_limit_reset_time - now)
            .min()
            .unwrap_or(0)
            .max(0)
    }

    // Cooldowns only ever extend: a shorter proposal never shrinks an
    // existing reset time. No-op when the account left the pool.
    pub fn mark_rate_limited(&mut self, refresh_token: &str, retry_after_ms: i64) {
        let Some(account) = self.find_mut(refresh_token) else {
            return;
        };
        let proposed = now_ms() + retry_after_ms.max(0);
        account.is_rate_limited = true;
        account.rate_limit_reset_time = account.rate_limit_reset_time.max(proposed);
        let email = account.display_email().to_string();
        let reset = account.rate_limit_reset_time;
        self.dirty = true;
        info!(
            "Account {} rate-limited for {}ms (reset at {})",
            email, retry_after_ms, reset
        );
    }

    // Refreshes access/expiry/project fields from a new token bundle.
    pub fn update_from_auth(&mut self, refresh_token: &str, auth: &AuthRecord) {
        let Some(parts) = parse_refresh_parts(&auth.refresh) else {
            return;
        };
        let Some(account) = self.find_mut(refresh_token) else {
            return;
        };
        account.project_id = parts.project_id;
        account.managed_project_id = parts.managed_project_id;
        account.access_token = auth.access.clone();
        account.access_token_expires_at = auth.expires.unwrap_or(0);
        self.dirty = true;
    }

    // Removes by refresh-token identity.
    pub fn remove_account(&mut self, refresh_token: &str) -> bool {
        let before = self.doc.accounts.len();
        self.doc.accounts.retain(|a| a.refresh_token != refresh_token);
        let removed = self.doc.accounts.len() != before;
        if removed {
            self.doc.clamp_active_index();
            self.dirty = true;
        }
        removed
    }

    // Enrolling a refresh token that is already pooled updates the existing
    // entry in place instead of duplicating it.
    pub fn enroll(&mut self, email: &str, auth: &AuthRecord) -> Option<EnrollOutcome> {
        let parts = parse_refresh_parts(&auth.refresh)?;
        let now = now_ms();
        let outcome = if let Some(existing) = self.find_mut(&parts.refresh_token) {
            existing.email = email.to_string();
            existing.project_id = parts.project_id;
            existing.managed_project_id = parts.managed_project_id;
            existing.last_used = now;
            existing.access_token = auth.access.clone();
            existing.access_token_expires_at = auth.expires.unwrap_or(0);
            EnrollOutcome::Updated
        } else {
            let mut account = Account::new(email, parts);
            account.access_token = auth.access.clone();
            account.access_token_expires_at = auth.expires.unwrap_or(0);
            self.doc.accounts.push(account);
            EnrollOutcome::Added
        };
        self.dirty = true;
        Some(outcome)
    }

    pub fn to_auth_details(&self, refresh_token: &str) -> Option<AuthRecord> {
        self.doc
            .accounts
            .iter()
            .find(|a| a.refresh_token == refresh_token)
            .map(Account::auth_details)
    }

    // The request path never persists an empty accounts array; an emptied
    // pool is only written out through `clear_persisted`.
    pub fn save_to_disk(&mut self) -> AppResult<()> {
        if self.doc.accounts.is_empty() {
            debug!("Skipping save of empty account pool");
            return Ok(());
        }
        self.doc.clamp_active_index();
        self.store.save(&self.doc)?;
        self.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // Total-revocation path: drop every account and delete the document.
    pub fn clear_persisted(&mut self) -> AppResult<()> {
        self.doc.accounts.clear();
        self.doc.active_index = 0;
        self.dirty = false;
        self.store.clear()
    }

    fn find_mut(&mut self, refresh_token: &str) -> Option<&mut Account> {
        self.doc
            .accounts
            .iter_mut()
            .find(|a| a.refresh_token == refresh_token)
    }
}
