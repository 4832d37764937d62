//! C2: per-model-family rolling-window usage accounting.
//!
//! A sharded, mutex-guarded store of recent usage events pruned lazily on
//! every access rather than on a background timer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ModelLimits;

const WINDOW_MILLIS: u64 = 60_000;

/// One admitted (or reserved) call against a family's budget.
#[derive(Debug, Clone, Copy)]
pub struct UsageEvent {
    pub timestamp_millis: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Whether this event is the admission-time reservation for a request,
    /// as opposed to its post-call reconciliation delta. Only reservation
    /// events count toward the requests-per-minute budget — a reconciliation
    /// delta corrects token accounting for a request that already counted.
    pub is_reservation: bool,
}

/// Events for a single family within the trailing window.
#[derive(Debug, Default)]
struct RollingWindow {
    events: std::collections::VecDeque<UsageEvent>,
}

impl RollingWindow {
    fn prune(&mut self, now_millis: u64) {
        while let Some(front) = self.events.front() {
            if now_millis.saturating_sub(front.timestamp_millis) > WINDOW_MILLIS {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn input_tokens(&self) -> u64 {
        self.events.iter().map(|e| e.input_tokens).sum()
    }

    fn request_count(&self) -> u64 {
        self.events.iter().filter(|e| e.is_reservation).count() as u64
    }

    fn earliest_expiry_millis(&self, now_millis: u64) -> Option<u64> {
        self.events
            .front()
            .map(|e| (e.timestamp_millis + WINDOW_MILLIS).saturating_sub(now_millis))
    }
}

/// Whether a family has room for a reservation of the given size right now.
#[derive(Debug, Clone, Copy)]
pub struct Headroom {
    pub has_room: bool,
    /// Milliseconds until the oldest event ages out of the window, if the
    /// family is currently at capacity.
    pub retry_after_millis: Option<u64>,
}

/// Sharded-by-family accountant for rolling-window rate limits.
#[derive(Debug, Default)]
pub struct Accountant {
    windows: Mutex<HashMap<String, RollingWindow>>,
}

impl Accountant {
    pub fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    /// Check whether `family` has room for `estimated_input_tokens` more
    /// input tokens and one more request, against `limits`.
    pub fn headroom(&self, family: &str, estimated_input_tokens: u64, limits: &ModelLimits) -> Headroom {
        let now = now_millis();
        let mut windows = self.windows.lock().expect("accountant mutex poisoned");
        let window = windows.entry(family.to_string()).or_default();
        window.prune(now);

        let projected_tokens = window.input_tokens() + estimated_input_tokens;
        let projected_requests = window.request_count() + 1;

        let has_room = projected_tokens <= limits.safe_input_tokens_per_minute()
            && projected_requests <= limits.safe_requests_per_minute();

        Headroom {
            has_room,
            retry_after_millis: if has_room { None } else { window.earliest_expiry_millis(now) },
        }
    }

    /// Record a reservation for `family`. Called before the upstream call is
    /// made; not rolled back on failure (see resolved open question). Counts
    /// toward both the token and request budgets.
    pub fn record_reservation(&self, family: &str, input_tokens: u64) {
        self.push(family, input_tokens, 0, true);
    }

    /// Record a reconciliation delta for `family` after a call completes:
    /// the difference between estimated and actual input tokens, plus
    /// output tokens. Does not count as an additional request — the
    /// reservation already did.
    pub fn record_reconciliation(&self, family: &str, input_tokens_delta: u64, output_tokens: u64) {
        self.push(family, input_tokens_delta, output_tokens, false);
    }

    fn push(&self, family: &str, input_tokens: u64, output_tokens: u64, is_reservation: bool) {
        let now = now_millis();
        let mut windows = self.windows.lock().expect("accountant mutex poisoned");
        let window = windows.entry(family.to_string()).or_default();
        window.prune(now);
        window.events.push_back(UsageEvent {
            timestamp_millis: now,
            input_tokens,
            output_tokens,
            is_reservation,
        });
    }

    /// Snapshot of current window usage for a family, for the stats endpoint.
    pub fn snapshot(&self, family: &str) -> (u64, u64) {
        let now = now_millis();
        let mut windows = self.windows.lock().expect("accountant mutex poisoned");
        let window = windows.entry(family.to_string()).or_default();
        window.prune(now);
        (window.input_tokens(), window.request_count())
    }

    pub fn known_families(&self) -> Vec<String> {
        self.windows.lock().expect("accountant mutex poisoned").keys().cloned().collect()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}
