//! CodeAssist control plane: tier / project discovery and the one-time
//! per-account enrolment handshake.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::info;

use grelay_accounts::{AccountPool, Lease};

use crate::error::RelayError;
use crate::upstream::{client_metadata, UpstreamBody, UpstreamClient, UpstreamRequest};

const ONBOARD_DEADLINE: Duration = Duration::from_secs(120);
const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct CodeAssist {
    client: Arc<dyn UpstreamClient>,
    base_url: String,
}

impl CodeAssist {
    pub fn new(client: Arc<dyn UpstreamClient>, base_url: impl Into<String>) -> Self {
        CodeAssist {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!(
            "{}/v1internal:{method}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn call(
        &self,
        method: &str,
        bearer: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, RelayError> {
        let body = serde_json::to_vec(&payload)
            .map_err(|err| RelayError::Internal(err.to_string()))?;
        let response = self
            .client
            .send(UpstreamRequest {
                url: self.url(method),
                bearer: bearer.to_string(),
                body: Bytes::from(body),
                stream: false,
            })
            .await
            .map_err(|err| RelayError::UpstreamUnavailable(err.to_string()))?;

        let UpstreamBody::Bytes(bytes) = response.body else {
            return Err(RelayError::Internal(format!(
                "{method} returned a streaming body"
            )));
        };
        if !(200..300).contains(&response.status) {
            return Err(RelayError::UpstreamRejected {
                status: response.status,
                message: format!(
                    "{method} failed: {}",
                    String::from_utf8_lossy(&bytes).trim()
                ),
            });
        }
        serde_json::from_slice(&bytes).map_err(|err| RelayError::Internal(err.to_string()))
    }

    /// Resolve the account's upstream project id via `loadCodeAssist`.
    pub async fn discover_project_id(&self, bearer: &str) -> Result<Option<String>, RelayError> {
        let data = self
            .call(
                "loadCodeAssist",
                bearer,
                json!({"metadata": client_metadata(None)}),
            )
            .await?;
        Ok(data
            .get("cloudaicompanionProject")
            .and_then(JsonValue::as_str)
            .map(str::to_string))
    }

    /// Run the enrolment handshake: if `loadCodeAssist` reports no
    /// current tier, poll `onboardUser` until the long-running operation
    /// completes. Returns a project id when the upstream reports one.
    pub async fn onboard(
        &self,
        bearer: &str,
        project_id: Option<&str>,
    ) -> Result<Option<String>, RelayError> {
        let load = self
            .call(
                "loadCodeAssist",
                bearer,
                json!({
                    "cloudaicompanionProject": project_id,
                    "metadata": client_metadata(project_id),
                }),
            )
            .await?;

        if load.get("currentTier").is_some_and(|tier| !tier.is_null()) {
            return Ok(project_from_load(&load));
        }

        let tier_id = default_tier_id(&load);
        let payload = json!({
            "tierId": tier_id,
            "cloudaicompanionProject": project_id,
            "metadata": client_metadata(project_id),
        });

        let deadline = Instant::now() + ONBOARD_DEADLINE;
        loop {
            let operation = self.call("onboardUser", bearer, payload.clone()).await?;
            if operation.get("done").and_then(JsonValue::as_bool) == Some(true) {
                return Ok(project_from_operation(&operation));
            }
            if Instant::now() >= deadline {
                return Err(RelayError::UpstreamUnavailable(
                    "onboarding timed out after 120s".to_string(),
                ));
            }
            tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
        }
    }

    /// Make a leased account usable for generation: a project id from
    /// the record, the configured fallback, or upstream discovery, plus
    /// the one-time onboarding handshake. The handshake is single-flight
    /// per account: the pool hands the claim to exactly one lease, and a
    /// claimant that fails or is cancelled mid-handshake gives the claim
    /// back so a later lease retries.
    pub async fn ensure_account_ready(
        &self,
        pool: &Arc<AccountPool>,
        lease: &Lease,
        configured_project: Option<&str>,
    ) -> Result<String, RelayError> {
        let mut claim = if lease.onboarded {
            None
        } else {
            Some(OnboardClaim {
                pool: Arc::clone(pool),
                index: lease.index,
                armed: true,
            })
        };

        let result = self.make_ready(pool, lease, configured_project).await;
        if result.is_ok() {
            // mark_onboarded settled the flag; nothing to give back.
            if let Some(claim) = claim.as_mut() {
                claim.disarm();
            }
        }
        result
    }

    async fn make_ready(
        &self,
        pool: &AccountPool,
        lease: &Lease,
        configured_project: Option<&str>,
    ) -> Result<String, RelayError> {
        let mut project = lease
            .project_id
            .clone()
            .or_else(|| configured_project.map(str::to_string));
        if project.is_none() {
            project = self.discover_project_id(&lease.access_token).await?;
        }

        if !lease.onboarded {
            let from_onboard = self
                .onboard(&lease.access_token, project.as_deref())
                .await?;
            if project.is_none() {
                project = from_onboard;
            }
            pool.mark_onboarded(lease.index).await;
            info!(account = %lease.name, "account onboarded");
        }

        let project = project.ok_or_else(|| {
            RelayError::Internal("no project id available for account".to_string())
        })?;
        if lease.project_id.as_deref() != Some(project.as_str()) {
            pool.set_project_id(lease.index, &project).await;
        }
        Ok(project)
    }
}

/// Returns an onboarding claim to the pool unless disarmed. Dropping an
/// armed claim covers both the error path and a request future that is
/// cancelled while the handshake is in flight.
struct OnboardClaim {
    pool: Arc<AccountPool>,
    index: usize,
    armed: bool,
}

impl OnboardClaim {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for OnboardClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let index = self.index;
        tokio::spawn(async move {
            pool.abort_onboarding(index).await;
        });
    }
}

fn default_tier_id(load: &JsonValue) -> String {
    load.get("allowedTiers")
        .and_then(JsonValue::as_array)
        .and_then(|tiers| {
            tiers.iter().find(|tier| {
                tier.get("isDefault").and_then(JsonValue::as_bool) == Some(true)
            })
        })
        .and_then(|tier| tier.get("id"))
        .and_then(JsonValue::as_str)
        .unwrap_or("legacy-tier")
        .to_string()
}

fn project_from_load(load: &JsonValue) -> Option<String> {
    load.get("cloudaicompanionProject")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// The LRO reports the project either as a bare string or as an object
/// with an `id`.
fn project_from_operation(operation: &JsonValue) -> Option<String> {
    let project = operation.get("response")?.get("cloudaicompanionProject")?;
    project
        .as_str()
        .map(str::to_string)
        .or_else(|| {
            project
                .get("id")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
}
