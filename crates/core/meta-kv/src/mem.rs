//! In-process KV backend with optimistic transactions.
//!
//! Backs the `memory:` URL scheme. Conflict detection is read-set
//! validation: a commit fails when any key the transaction read (including
//! keys observed as absent) was modified by a commit that landed after the
//! read. Range scans read committed state page by page, like a backend
//! iterator that re-reads behind a cursor.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::{KvError, KvStream, RangeGetOptions, Transaction, TxnKv};

#[derive(Debug, Clone)]
struct Versioned {
    value: Bytes,
    /// Commit sequence number of the last write to this key.
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Versioned>,
    /// Monotonic commit counter; also stamps deletions via `tombstones`.
    version: u64,
    /// Last-deleted version per key, so reads-of-absent conflict correctly.
    tombstones: HashMap<Vec<u8>, u64>,
    /// When set, every range stream yields an error after this many items.
    range_fault_after: Option<usize>,
}

/// In-memory [`TxnKv`] implementation.
#[derive(Debug, Clone, Default)]
pub struct MemTxnKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemTxnKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent range scan fail after yielding `after` items.
    ///
    /// Test support for the iterator-invalidation paths; `None` clears the
    /// fault.
    pub fn set_range_fault(&self, after: Option<usize>) {
        self.inner.lock().unwrap().range_fault_after = after;
    }

    /// Number of keys currently stored. Test support.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn observed_version(inner: &Inner, key: &[u8]) -> Option<u64> {
        inner
            .data
            .get(key)
            .map(|v| v.version)
            .or_else(|| inner.tombstones.get(key).copied())
    }
}

#[derive(Debug, Clone)]
enum Write {
    Put(Bytes),
    Delete,
}

struct MemTransaction {
    inner: Arc<Mutex<Inner>>,
    /// Key -> version observed at read time (`None` = observed absent and
    /// never deleted).
    read_set: HashMap<Vec<u8>, Option<u64>>,
    writes: Vec<(Vec<u8>, Write)>,
}

#[async_trait]
impl Transaction for MemTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, KvError> {
        // Reads observe the transaction's own buffered writes.
        if let Some((_, w)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(match w {
                Write::Put(v) => Some(v.clone()),
                Write::Delete => None,
            });
        }

        let inner = self.inner.lock().unwrap();
        let observed = MemTxnKv::observed_version(&inner, key);
        self.read_set.insert(key.to_vec(), observed);
        Ok(inner.data.get(key).map(|v| v.value.clone()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.writes
            .push((key.to_vec(), Write::Put(Bytes::copy_from_slice(value))));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.push((key.to_vec(), Write::Delete));
    }

    async fn commit(self: Box<Self>) -> Result<(), KvError> {
        let mut inner = self.inner.lock().unwrap();

        for (key, observed) in &self.read_set {
            if MemTxnKv::observed_version(&inner, key) != *observed {
                return Err(KvError::Conflict);
            }
        }

        if self.writes.is_empty() {
            return Ok(());
        }

        inner.version += 1;
        let version = inner.version;
        for (key, write) in self.writes {
            match write {
                Write::Put(value) => {
                    inner.tombstones.remove(&key);
                    inner.data.insert(key, Versioned { value, version });
                }
                Write::Delete => {
                    inner.data.remove(&key);
                    inner.tombstones.insert(key, version);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TxnKv for MemTxnKv {
    async fn create_txn(&self) -> Result<Box<dyn Transaction>, KvError> {
        Ok(Box::new(MemTransaction {
            inner: self.inner.clone(),
            read_set: HashMap::new(),
            writes: Vec::new(),
        }))
    }

    fn full_range_get(&self, begin: &[u8], end: &[u8], opts: RangeGetOptions) -> KvStream {
        let inner = self.inner.clone();
        let begin = begin.to_vec();
        let end = end.to_vec();
        let batch = opts.batch_size.max(1);

        async_stream::try_stream! {
            let mut cursor = begin;
            let mut yielded = 0usize;
            loop {
                let (page, fault_after) = {
                    let inner = inner.lock().unwrap();
                    let page: Vec<(Bytes, Bytes)> = inner
                        .data
                        .range(cursor.clone()..end.clone())
                        .take(batch)
                        .map(|(k, v)| {
                            (Bytes::copy_from_slice(k), v.value.clone())
                        })
                        .collect();
                    (page, inner.range_fault_after)
                };
                if page.is_empty() {
                    break;
                }
                // Resume strictly after the last key of this page.
                cursor = {
                    let mut next = page.last().unwrap().0.to_vec();
                    next.push(0);
                    next
                };
                for pair in page {
                    if let Some(limit) = fault_after {
                        if yielded >= limit {
                            Err(KvError::Transport("range iterator invalidated".into()))?;
                        }
                    }
                    yielded += 1;
                    yield pair;
                }
            }
        }
        .boxed()
    }
}
