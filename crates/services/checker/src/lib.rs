//! Object-store integrity checker.
//!
//! Tablet data (rowsets composed of segment files) lives in external
//! storage vaults; authoritative metadata lives in the transactional KV
//! store. This service continuously verifies both directions:
//!
//! - **forward check** — every segment referenced by visible rowset
//!   metadata exists in its vault;
//! - **inverted check** — every segment-shaped object in a vault is
//!   referenced by some rowset.
//!
//! It also inspects whether each instance is checked often enough relative
//! to its buckets' object-expiration lifecycle, and alarms when an
//! instance risks losing unexpired objects because checking has fallen
//! behind.
//!
//! The [`daemon::Checker`] owns the fleet protocol: instance discovery, a
//! bounded pending queue, a worker pool, and a KV-leased exclusivity
//! guarantee of at most one active checker per instance across processes.

pub mod daemon;
pub mod filter;
pub mod instance;
pub mod lease;
pub mod metrics;
pub mod model;
pub mod sync_executor;

pub use self::{
    daemon::Checker,
    instance::{CheckError, CheckOutcome, InstanceChecker},
    metrics::CheckerMetrics,
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
