//! C7: the per-request pipeline tying every other component together.
//!
//! Received -> validated -> estimated -> downgraded? -> admitted ->
//! in-flight -> completed, matching the state machine in the design doc.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::admission::{AdmissionController, Outcome};
use crate::concurrency::ConcurrencyGate;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::ledger::TenantLedger;
use crate::model_family;
use crate::rolling_window::Accountant;
use crate::upstream::{RetryingCaller, UpstreamClient};
use crate::{estimator, stats};

/// Shared proxy state, cloned cheaply (an `Arc` internally) into every
/// request handler.
#[derive(Clone)]
pub struct ProxyState(Arc<Inner>);

struct Inner {
    config: ProxyConfig,
    accountant: Accountant,
    ledger: TenantLedger,
    gate: ConcurrencyGate,
    upstream: UpstreamClient,
    /// Requests past validation but not yet holding a concurrency-gate
    /// permit: waiting on admission or on the gate's semaphore queue.
    queued: AtomicUsize,
}

/// Decrements `Inner::queued` when a request leaves the queued phase,
/// however it leaves it (admitted, rejected, or timed out).
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        let upstream = UpstreamClient::new(
            config.upstream_url.clone(),
            config.upstream_credential.clone(),
            Duration::from_secs(300),
        );
        let gate = ConcurrencyGate::new(config.max_concurrent);

        Self(Arc::new(Inner {
            accountant: Accountant::new(),
            ledger: TenantLedger::new(),
            gate,
            upstream,
            config,
            queued: AtomicUsize::new(0),
        }))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.0.config
    }

    pub fn accountant(&self) -> &Accountant {
        &self.0.accountant
    }

    pub fn ledger(&self) -> &TenantLedger {
        &self.0.ledger
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.0.gate
    }

    /// Requests currently waiting on admission or a concurrency-gate permit,
    /// as distinct from `gate().active_count()` requests already in flight.
    pub fn queued_count(&self) -> usize {
        self.0.queued.load(Ordering::SeqCst)
    }

    /// Run one request through the full pipeline: validate the body,
    /// estimate its cost, apply forbidden-model downgrade, admit it against
    /// tenant and family budgets, acquire a concurrency slot, and call
    /// upstream with retries.
    pub async fn handle_request(
        &self,
        tenant_id: &str,
        mut body: Value,
        upstream_headers: &HeaderMap,
    ) -> Result<Value> {
        validate(&body)?;

        let requested_model = body
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::InvalidRequest("missing \"model\" field".to_string()))?
            .to_string();

        let mut family = model_family::classify(&requested_model);
        let mut downgraded_from: Option<String> = None;
        if let Some(fallback_family) = self.config().downgrade_for(&family) {
            let fallback_family = fallback_family.to_string();
            if let Some(fallback_model) = self.fallback_model_for(&fallback_family) {
                tracing::info!(requested_model, fallback_model, "downgrading forbidden model");
                body["model"] = Value::String(fallback_model.clone());
                downgraded_from = Some(requested_model.clone());
                family = fallback_family;
            }
        }

        let estimated_input_tokens = estimator::estimate_input_tokens(&body);

        let _in_flight = {
            self.0.queued.fetch_add(1, Ordering::SeqCst);
            let _queued_guard = QueuedGuard(&self.0.queued);

            let admission = AdmissionController::new(self.config(), self.accountant(), self.ledger());
            match admission.admit(tenant_id, &family, estimated_input_tokens).await {
                Outcome::Admitted => {}
                Outcome::RejectedQuotaExceeded { used_today, daily_limit } => {
                    return Err(ProxyError::QuotaExceededToday { used_today, daily_limit });
                }
                Outcome::RejectedTimeout => {
                    return Err(ProxyError::AdmissionDeadlineExceeded);
                }
            }

            self.gate().acquire().await
        };

        let caller = RetryingCaller::new(&self.0.upstream, &self.config().retry);
        let mut response = caller.call(&body, upstream_headers).await?;

        self.reconcile(tenant_id, &family, estimated_input_tokens, &response);

        if let Some(requested_model) = downgraded_from {
            if let Value::Object(ref mut map) = response {
                map.insert(
                    "proxy_metadata".to_string(),
                    serde_json::json!({
                        "downgraded": true,
                        "requested_model": requested_model,
                        "served_model": body["model"].clone(),
                    }),
                );
            }
        }

        Ok(response)
    }

    /// Record actual usage once upstream answers, on top of the input-only
    /// reservation made at admission time. The reservation itself is never
    /// mutated: a supplementary delta event corrects the rolling window, and
    /// the tenant ledger is updated with the call's actual totals.
    fn reconcile(&self, tenant_id: &str, family: &str, estimated_input_tokens: u64, response: &Value) {
        let output_tokens = response
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let actual_input_tokens = response
            .get("usage")
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(estimated_input_tokens);

        let delta_input_tokens = actual_input_tokens.saturating_sub(estimated_input_tokens);
        self.accountant().record_reconciliation(family, delta_input_tokens, output_tokens);
        self.ledger().record(tenant_id, actual_input_tokens, output_tokens);
    }

    fn fallback_model_for(&self, family: &str) -> Option<String> {
        match family {
            "sonnet-4" => Some("claude-sonnet-4-20250514".to_string()),
            "haiku-3" => Some("claude-3-haiku-20240307".to_string()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> stats::StatsSnapshot {
        stats::snapshot(self)
    }
}

fn validate(body: &Value) -> Result<()> {
    if !body.is_object() {
        return Err(ProxyError::InvalidRequest("request body must be a JSON object".to_string()));
    }

    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::InvalidRequest("missing \"messages\" field".to_string()))?;

    if messages.is_empty() {
        return Err(ProxyError::InvalidRequest("\"messages\" must not be empty".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_state() -> ProxyState {
        let mut config = ProxyConfig::default();
        config.upstream_url = "http://127.0.0.1:1".to_string();
        ProxyState::new(config)
    }

    #[test]
    fn test_validate_rejects_empty_messages() {
        let body = json!({"model": "claude-sonnet-4-20250514", "messages": []});
        assert!(validate(&body).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_messages() {
        let body = json!({"model": "claude-sonnet-4-20250514"});
        assert!(validate(&body).is_err());
    }

    #[test]
    fn test_validate_accepts_well_formed_body() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}]
        });
        assert!(validate(&body).is_ok());
    }

    #[tokio::test]
    async fn test_handle_request_rejects_missing_model() {
        let state = test_state();
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let result = state.handle_request("tenant-a", body, &HeaderMap::new()).await;
        assert!(matches!(result, Err(ProxyError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_handle_request_rejects_quota_exceeded() {
        let mut config = ProxyConfig::default();
        config.daily_tokens_per_tenant = 10;
        config.upstream_url = "http://127.0.0.1:1".to_string();
        let state = ProxyState::new(config);

        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "this message is long enough to exceed ten tokens of budget easily"}]
        });
        let result = state.handle_request("tenant-a", body, &HeaderMap::new()).await;
        assert!(matches!(result, Err(ProxyError::QuotaExceededToday { .. })));
    }

    #[test]
    fn test_fallback_model_for_known_family() {
        let state = test_state();
        assert_eq!(state.fallback_model_for("sonnet-4"), Some("claude-sonnet-4-20250514".to_string()));
        assert_eq!(state.fallback_model_for("unknown"), None);
    }

    #[test]
    fn test_queued_count_starts_at_zero() {
        let state = test_state();
        assert_eq!(state.queued_count(), 0);
    }
}
