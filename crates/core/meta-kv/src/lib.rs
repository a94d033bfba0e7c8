//! Transactional KV store contract for strata metadata.
//!
//! Authoritative metadata (instances, rowsets, vault bindings, check-job
//! records) lives in an external transactional key-value store. This crate
//! defines the client contract the rest of the workspace programs against:
//!
//! - [`TxnKv`] — the thread-safe client handle, shared across services.
//! - [`Transaction`] — a single optimistic transaction; `commit` fails with
//!   [`KvError::Conflict`] when a concurrently committed transaction touched
//!   the keys this one read.
//! - [`TxnKv::full_range_get`] — a lazy, paginated range scan. Items are
//!   `Result`s: an `Err` item signals that the iterator was invalidated
//!   mid-scan, which consumers must treat differently from plain exhaustion.
//!
//! Production backends plug in behind these traits. The bundled
//! [`MemTxnKv`] backend (`memory:` URL scheme) backs tests and local mode.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use url::Url;

pub mod keys;
mod mem;

pub use self::mem::MemTxnKv;

/// A lazy key-value range scan. `Err` items signal iterator invalidation.
pub type KvStream = BoxStream<'static, Result<(Bytes, Bytes), KvError>>;

/// Errors surfaced by the KV client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The transaction read keys that were modified by a concurrent commit.
    #[error("transaction conflict")]
    Conflict,

    /// The backend could not be reached or returned a malformed response.
    #[error("kv transport error: {0}")]
    Transport(String),
}

/// Options for [`TxnKv::full_range_get`].
#[derive(Debug, Clone, Copy)]
pub struct RangeGetOptions {
    /// Ask the backend to pipeline the next page while the current one is
    /// being consumed.
    pub prefetch: bool,
    /// Maximum number of pairs fetched per page.
    pub batch_size: usize,
}

impl Default for RangeGetOptions {
    fn default() -> Self {
        Self {
            prefetch: false,
            batch_size: 1_000,
        }
    }
}

impl RangeGetOptions {
    /// Options with prefetching enabled, as used by the scan-heavy check
    /// loops.
    pub fn prefetching() -> Self {
        Self {
            prefetch: true,
            ..Self::default()
        }
    }
}

/// One optimistic transaction against the KV store.
///
/// Writes are buffered locally and become visible to other clients only
/// after a successful [`commit`](Transaction::commit). Reads observe the
/// transaction's own buffered writes.
#[async_trait]
pub trait Transaction: Send {
    /// Read a single key. `Ok(None)` means the key does not exist.
    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, KvError>;

    /// Buffer a put of `key` to `value`.
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Buffer a deletion of `key`.
    fn delete(&mut self, key: &[u8]);

    /// Atomically commit the buffered writes.
    ///
    /// Fails with [`KvError::Conflict`] when any key read by this
    /// transaction was modified since it was read. Conflicted transactions
    /// are not retried here; retry policy belongs to the caller.
    async fn commit(self: Box<Self>) -> Result<(), KvError>;
}

/// Thread-safe handle to the transactional KV store.
#[async_trait]
pub trait TxnKv: Send + Sync + 'static {
    /// Begin a new transaction.
    async fn create_txn(&self) -> Result<Box<dyn Transaction>, KvError>;

    /// Lazily scan `[begin, end)` in lexicographic key order.
    ///
    /// The stream yields pairs until exhaustion; an `Err` item means the
    /// scan was invalidated (e.g. the backend dropped the iterator) and the
    /// consumer must not treat the preceding items as a complete range.
    fn full_range_get(&self, begin: &[u8], end: &[u8], opts: RangeGetOptions) -> KvStream;
}

/// Connect to a KV store by URL.
///
/// Only the `memory:` scheme is resolved here; real backends are deployment
/// concerns wired up behind [`TxnKv`] by the embedding binary.
pub fn connect(url: &Url) -> Result<Arc<dyn TxnKv>, ConnectError> {
    match url.scheme() {
        "memory" => Ok(Arc::new(MemTxnKv::new())),
        other => Err(ConnectError::UnsupportedScheme(other.to_string())),
    }
}

/// Failed to resolve a KV store URL into a client.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// No backend is registered for the URL scheme.
    #[error("unsupported kv url scheme: {0}")]
    UnsupportedScheme(String),
}
