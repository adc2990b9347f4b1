use std::path::Path;
use std::sync::Arc;

use time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::refresh::TokenRefresher;
use crate::store::{self, Account, StoreError};

/// Refresh when the access token is within this window of expiry.
const REFRESH_LEEWAY: Duration = Duration::seconds(60);

/// Snapshot of an account handed to one in-flight request.
#[derive(Debug, Clone)]
pub struct Lease {
    pub index: usize,
    pub name: String,
    pub access_token: String,
    pub project_id: Option<String>,
    /// False only for the single lease that claimed the enrolment
    /// handshake; every other lease skips onboarding.
    pub onboarded: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum LeaseOutcome {
    Success,
    AuthRejected,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no accounts configured")]
    Empty,
    #[error("no usable accounts: {0}")]
    Exhausted(String),
}

struct PoolInner {
    accounts: Vec<Account>,
    cursor: usize,
}

/// Ordered account set with a rotation cursor. One mutex covers the
/// cursor and all per-account mutation; token refresh runs inside the
/// same critical section so two concurrent leases can never race two
/// refreshes of one credential.
pub struct AccountPool {
    refresher: Arc<dyn TokenRefresher>,
    inner: Mutex<PoolInner>,
}

impl AccountPool {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_accounts(refresher, Vec::new())
    }

    pub fn with_accounts(refresher: Arc<dyn TokenRefresher>, accounts: Vec<Account>) -> Self {
        AccountPool {
            refresher,
            inner: Mutex::new(PoolInner {
                accounts,
                cursor: 0,
            }),
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.accounts.len()
    }

    pub async fn add(&self, path: &Path) -> Result<(), StoreError> {
        let account = store::load_file(path)?;
        info!(account = %account.display_name(), "account added to pool");
        self.inner.lock().await.accounts.push(account);
        Ok(())
    }

    /// Advance the cursor, refresh the chosen credential if it is expired
    /// or about to expire, persist the refreshed record, and hand out a
    /// lease. Dead accounts are skipped; `invalid_grant` marks an account
    /// dead for the rest of the process.
    pub async fn lease(&self) -> Result<Lease, PoolError> {
        let mut inner = self.inner.lock().await;
        if inner.accounts.is_empty() {
            return Err(PoolError::Empty);
        }

        let len = inner.accounts.len();
        let mut last_error = "all accounts marked dead".to_string();
        for _ in 0..len {
            let idx = inner.cursor % len;
            inner.cursor = (inner.cursor + 1) % len;
            if inner.accounts[idx].dead {
                continue;
            }

            if inner.accounts[idx].record.needs_refresh(REFRESH_LEEWAY) {
                match self.refresher.refresh(&inner.accounts[idx].record).await {
                    Ok(token) => {
                        let account = &mut inner.accounts[idx];
                        account
                            .record
                            .apply_refresh(&token.access_token, token.expires_in);
                        if let Err(err) = store::persist(account) {
                            warn!(account = %account.display_name(), error = %err,
                                "failed to persist refreshed token");
                        }
                        info!(account = %account.display_name(), "access token refreshed");
                    }
                    Err(err) if err.is_fatal() => {
                        let account = &mut inner.accounts[idx];
                        warn!(account = %account.display_name(), error = %err,
                            "marking account dead");
                        account.dead = true;
                        last_error = err.to_string();
                        continue;
                    }
                    Err(err) => {
                        if inner.accounts[idx].record.token.is_none() {
                            last_error = err.to_string();
                            continue;
                        }
                        warn!(account = %inner.accounts[idx].display_name(), error = %err,
                            "transient refresh failure, using last known token");
                    }
                }
            }

            // Claim the enrolment handshake under the same mutex, so two
            // concurrent leases of a fresh account cannot both run it.
            // Later leases proceed as if onboarded while the claimant's
            // handshake is in flight.
            let account = &mut inner.accounts[idx];
            let claims_onboarding = !account.onboarded && !account.onboarding;
            if claims_onboarding {
                account.onboarding = true;
            }
            return Ok(Lease {
                index: idx,
                name: account.display_name(),
                access_token: account.record.token.clone().unwrap_or_default(),
                project_id: account.record.project_id.clone(),
                onboarded: !claims_onboarding,
            });
        }

        Err(PoolError::Exhausted(last_error))
    }

    /// Return an account after one HTTP exchange. Quarantine on repeated
    /// failures would hook in here; for now the outcome is only logged.
    pub async fn release(&self, lease: &Lease, outcome: LeaseOutcome) {
        debug!(account = %lease.name, outcome = ?outcome, "lease released");
    }

    pub async fn set_project_id(&self, index: usize, project_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.get_mut(index) else {
            return;
        };
        account.record.project_id = Some(project_id.to_string());
        if let Err(err) = store::persist(account) {
            warn!(account = %account.display_name(), error = %err,
                "failed to persist project id");
        }
    }

    pub async fn mark_onboarded(&self, index: usize) {
        let mut inner = self.inner.lock().await;
        if let Some(account) = inner.accounts.get_mut(index) {
            account.onboarded = true;
            account.onboarding = false;
        }
    }

    /// Hand back an onboarding claim after a failed handshake so a
    /// later lease can retry it.
    pub async fn abort_onboarding(&self, index: usize) {
        let mut inner = self.inner.lock().await;
        if let Some(account) = inner.accounts.get_mut(index) {
            account.onboarding = false;
        }
    }
}
