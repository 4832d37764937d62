//! C4: admission control combining the tenant ledger and per-family rolling
//! window, with bounded wait-then-reject semantics.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{ModelLimits, ProxyConfig};
use crate::ledger::TenantLedger;
use crate::rolling_window::Accountant;

const POLL_FLOOR_MILLIS: u64 = 1000;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Admitted,
    RejectedQuotaExceeded { used_today: u64, daily_limit: u64 },
    RejectedTimeout,
}

/// Combines the daily ledger and rolling window into a single admit
/// decision, polling the rolling window until capacity frees up or the
/// caller's deadline passes.
pub struct AdmissionController<'a> {
    pub config: &'a ProxyConfig,
    pub accountant: &'a Accountant,
    pub ledger: &'a TenantLedger,
}

impl<'a> AdmissionController<'a> {
    pub fn new(config: &'a ProxyConfig, accountant: &'a Accountant, ledger: &'a TenantLedger) -> Self {
        Self { config, accountant, ledger }
    }

    /// Attempt to admit a request for `tenant_id` in `family` estimated to
    /// need `estimated_input_tokens`, waiting up to `config.max_request_wait_millis`
    /// for rolling-window capacity before giving up.
    pub async fn admit(&self, tenant_id: &str, family: &str, estimated_input_tokens: u64) -> Outcome {
        let daily_limit = self.config.daily_tokens_per_tenant;
        let used_today = self.ledger.used_today(tenant_id);
        if used_today + estimated_input_tokens > daily_limit {
            return Outcome::RejectedQuotaExceeded { used_today, daily_limit };
        }

        let limits: &ModelLimits = self.config.limits_for(family);
        let deadline = Instant::now() + Duration::from_millis(self.config.max_request_wait_millis);

        loop {
            let headroom = self.accountant.headroom(family, estimated_input_tokens, limits);
            if headroom.has_room {
                self.accountant.record_reservation(family, estimated_input_tokens);
                return Outcome::Admitted;
            }

            let now = Instant::now();
            if now >= deadline {
                return Outcome::RejectedTimeout;
            }

            let wait = headroom
                .retry_after_millis
                .map(|millis| millis + 1000)
                .unwrap_or(POLL_FLOOR_MILLIS)
                .max(POLL_FLOOR_MILLIS);
            let remaining = deadline.saturating_duration_since(now);
            let sleep_for = Duration::from_millis(wait).min(remaining);
            if sleep_for.is_zero() {
                return Outcome::RejectedTimeout;
            }
            tokio::time::sleep(sleep_for).await;
        }
    }
}
