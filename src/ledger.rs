//! C3: per-tenant daily token ledger with UTC day rollover.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};

/// A tenant's accumulated usage for the current UTC day.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantDailyUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
}

#[derive(Debug)]
struct TenantEntry {
    day: NaiveDate,
    usage: TenantDailyUsage,
}

/// Daily usage tracking per tenant, reset automatically at UTC midnight.
#[derive(Debug, Default)]
pub struct TenantLedger {
    entries: Mutex<HashMap<String, TenantEntry>>,
}

impl TenantLedger {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Input tokens a tenant has used so far today (the quantity the daily
    /// budget is measured against), rolling over to zero if the UTC date has
    /// changed since the last recorded entry.
    pub fn used_today(&self, tenant_id: &str) -> u64 {
        self.today(tenant_id).input_tokens
    }

    /// Full daily usage record for a tenant, applying rollover first.
    pub fn today(&self, tenant_id: &str) -> TenantDailyUsage {
        let today = Utc::now().date_naive();
        let mut entries = self.entries.lock().expect("ledger mutex poisoned");
        let entry = entries
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantEntry { day: today, usage: TenantDailyUsage::default() });

        if entry.day != today {
            entry.day = today;
            entry.usage = TenantDailyUsage::default();
        }

        entry.usage
    }

    /// Remaining budget for a tenant given `daily_limit`, after applying
    /// rollover. Saturates at zero rather than underflowing.
    pub fn remaining(&self, tenant_id: &str, daily_limit: u64) -> u64 {
        daily_limit.saturating_sub(self.used_today(tenant_id))
    }

    /// Record a completed call's actual token usage against a tenant's
    /// daily counters and bump its request count.
    pub fn record(&self, tenant_id: &str, input_tokens: u64, output_tokens: u64) {
        let today = Utc::now().date_naive();
        let mut entries = self.entries.lock().expect("ledger mutex poisoned");
        let entry = entries
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantEntry { day: today, usage: TenantDailyUsage::default() });

        if entry.day != today {
            entry.day = today;
            entry.usage = TenantDailyUsage::default();
        }
        entry.usage.input_tokens += input_tokens;
        entry.usage.output_tokens += output_tokens;
        entry.usage.request_count += 1;
    }

    /// Snapshot of all known tenants' usage today, for the stats endpoint.
    pub fn snapshot(&self) -> HashMap<String, TenantDailyUsage> {
        let today = Utc::now().date_naive();
        let entries = self.entries.lock().expect("ledger mutex poisoned");
        entries
            .iter()
            .map(|(tenant, entry)| {
                let usage = if entry.day == today { entry.usage } else { TenantDailyUsage::default() };
                (tenant.clone(), usage)
            })
            .collect()
    }
}
