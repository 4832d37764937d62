//! C8: a read-only snapshot of proxy, per-family, and per-tenant state for
//! the `/stats` endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ProxyConfig;
use crate::proxy::ProxyState;

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub proxy: ProxyStats,
    pub per_family: Vec<FamilyStats>,
    pub per_tenant: Vec<TenantStats>,
    pub config: ConfigSummary,
}

/// The subset of `ProxyConfig` safe to expose over `/stats`: everything
/// except `upstream_credential`, which callers have no business seeing.
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub max_concurrent: usize,
    pub daily_tokens_per_tenant: u64,
    pub max_request_wait_millis: u64,
    pub forbidden_models: Vec<String>,
}

impl From<&ProxyConfig> for ConfigSummary {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            daily_tokens_per_tenant: config.daily_tokens_per_tenant,
            max_request_wait_millis: config.max_request_wait_millis,
            forbidden_models: config.forbidden_models.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProxyStats {
    pub active_requests: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Serialize)]
pub struct FamilyStats {
    pub family: String,
    pub input_tokens_in_window: u64,
    pub requests_in_window: u64,
    pub safe_input_tokens_per_minute: u64,
    pub safe_requests_per_minute: u64,
}

#[derive(Debug, Serialize)]
pub struct TenantStats {
    pub tenant_id: String,
    pub input_tokens_today: u64,
    pub output_tokens_today: u64,
    pub requests_today: u64,
    pub daily_limit: u64,
}

/// Build a point-in-time snapshot without contending with the hot path
/// beyond the same locks every request already takes.
pub fn snapshot(state: &ProxyState) -> StatsSnapshot {
    let proxy = ProxyStats {
        active_requests: state.gate().active_count(),
        queued: state.queued_count(),
        max_concurrent: state.gate().capacity(),
    };

    let per_family = state
        .accountant()
        .known_families()
        .into_iter()
        .map(|family| {
            let (input_tokens, requests) = state.accountant().snapshot(&family);
            let limits = state.config().limits_for(&family);
            FamilyStats {
                family,
                input_tokens_in_window: input_tokens,
                requests_in_window: requests,
                safe_input_tokens_per_minute: limits.safe_input_tokens_per_minute(),
                safe_requests_per_minute: limits.safe_requests_per_minute(),
            }
        })
        .collect();

    let daily_limit = state.config().daily_tokens_per_tenant;
    let per_tenant = state
        .ledger()
        .snapshot()
        .into_iter()
        .map(|(tenant_id, usage)| TenantStats {
            tenant_id,
            input_tokens_today: usage.input_tokens,
            output_tokens_today: usage.output_tokens,
            requests_today: usage.request_count,
            daily_limit,
        })
        .collect();

    StatsSnapshot { timestamp: Utc::now(), proxy, per_family, per_tenant, config: state.config().into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    #[test]
    fn test_snapshot_reflects_ledger_and_accountant() {
        let mut config = ProxyConfig::default();
        config.upstream_url = "http://127.0.0.1:1".to_string();
        let state = ProxyState::new(config);

        state.ledger().record("tenant-a", 123, 7);
        state.accountant().record_reservation("sonnet-4", 50);
        state.accountant().record_reconciliation("sonnet-4", 0, 10);

        let snapshot = snapshot(&state);
        assert_eq!(snapshot.per_tenant.len(), 1);
        assert_eq!(snapshot.per_tenant[0].input_tokens_today, 123);
        assert_eq!(snapshot.per_tenant[0].output_tokens_today, 7);
        assert_eq!(snapshot.per_family.len(), 1);
        assert_eq!(snapshot.per_family[0].family, "sonnet-4");
    }

    #[test]
    fn test_snapshot_proxy_stats_reports_capacity() {
        let mut config = ProxyConfig::default();
        config.max_concurrent = 7;
        config.upstream_url = "http://127.0.0.1:1".to_string();
        let state = ProxyState::new(config);

        let snapshot = snapshot(&state);
        assert_eq!(snapshot.proxy.max_concurrent, 7);
        assert_eq!(snapshot.proxy.active_requests, 0);
        assert_eq!(snapshot.proxy.queued, 0);
    }

    #[test]
    fn test_snapshot_reports_family_limits_alongside_usage() {
        let mut config = ProxyConfig::default();
        config.upstream_url = "http://127.0.0.1:1".to_string();
        let state = ProxyState::new(config);

        state.accountant().record_reservation("opus-4", 10);

        let snapshot = snapshot(&state);
        let family = snapshot.per_family.iter().find(|f| f.family == "opus-4").unwrap();
        assert_eq!(family.safe_input_tokens_per_minute, 22_500);
        assert_eq!(family.safe_requests_per_minute, 22);
    }

    #[test]
    fn test_snapshot_includes_timestamp_and_config() {
        let mut config = ProxyConfig::default();
        config.upstream_url = "http://127.0.0.1:1".to_string();
        let state = ProxyState::new(config.clone());

        let snapshot = snapshot(&state);
        assert_eq!(snapshot.config.max_concurrent, config.max_concurrent);
        assert!(snapshot.timestamp <= Utc::now());
    }
}
