//! A rate-limited, multi-tenant admission-control proxy in front of the
//! Anthropic Messages API.
//!
//! Requests are validated, their input token cost is estimated, forbidden
//! models are downgraded to an approved fallback, admission is checked
//! against both a per-tenant daily budget and a per-model-family rolling
//! window, and only then is the request forwarded upstream with retry and
//! backoff.

pub mod admission;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod estimator;
pub mod http;
pub mod ledger;
pub mod model_family;
pub mod proxy;
pub mod rolling_window;
pub mod stats;
pub mod upstream;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use proxy::ProxyState;
