//! In-memory accessors for tests and local mode.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::StreamExt;
use object_store::{ObjectStore, memory::InMemory, path::Path};

use crate::{
    AccessorFactory, CreateVaultError, VaultConf,
    accessor::{Accessor, AccessorError, AccessorKind, BucketProps, FileMeta, ListStream},
};

/// [`Accessor`] over an in-memory object store, with settable bucket
/// properties and fault injection for listing failures.
pub struct MemAccessor {
    kind: AccessorKind,
    uri: String,
    store: Arc<InMemory>,
    props: BucketProps,
    list_fault: Mutex<bool>,
}

impl MemAccessor {
    pub fn new() -> Self {
        Self {
            kind: AccessorKind::S3,
            uri: "memory://vault".to_string(),
            store: Arc::new(InMemory::new()),
            props: BucketProps {
                versioning_enabled: true,
                lifecycle_days: None,
            },
            list_fault: Mutex::new(false),
        }
    }

    pub fn with_kind(mut self, kind: AccessorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_lifecycle_days(mut self, days: i64) -> Self {
        self.props.lifecycle_days = Some(days);
        self
    }

    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.props.versioning_enabled = enabled;
        self
    }

    /// Store an object of `size` arbitrary bytes at `path`.
    pub async fn put_object(&self, path: &str, size: usize) {
        self.store
            .put(&Path::from(path), vec![0u8; size].into())
            .await
            .expect("in-memory put cannot fail");
    }

    /// Remove the object at `path` if present.
    pub async fn remove_object(&self, path: &str) {
        let _ = self.store.delete(&Path::from(path)).await;
    }

    /// Make every subsequent listing fail immediately.
    pub fn fail_listings(&self) {
        *self.list_fault.lock().unwrap() = true;
    }
}

impl Default for MemAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Accessor for MemAccessor {
    fn kind(&self) -> AccessorKind {
        self.kind
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn list_directory(&self, dir: &str) -> ListStream {
        if *self.list_fault.lock().unwrap() {
            let uri = self.uri.clone();
            return futures::stream::once(async move {
                Err(AccessorError::Unsupported(format!(
                    "listing failure injected for {uri}"
                )))
            })
            .boxed();
        }

        let store = self.store.clone();
        let prefix = Path::from(dir);
        async_stream::try_stream! {
            let mut listing = store.list(Some(&prefix));
            while let Some(meta) = futures::TryStreamExt::try_next(&mut listing).await? {
                yield FileMeta {
                    path: meta.location.to_string(),
                    size: meta.size as i64,
                };
            }
        }
        .boxed()
    }

    async fn check_versioning(&self) -> Result<(), AccessorError> {
        if self.props.versioning_enabled {
            Ok(())
        } else {
            Err(AccessorError::VersioningDisabled(self.uri.clone()))
        }
    }

    async fn get_life_cycle(&self) -> Result<i64, AccessorError> {
        self.props
            .lifecycle_days
            .ok_or_else(|| AccessorError::NoLifecycle(self.uri.clone()))
    }
}

/// [`AccessorFactory`] that hands out pre-built accessors by resource id.
///
/// Lets tests (and local mode) bind vault configurations to in-memory
/// accessors populated ahead of time.
#[derive(Default)]
pub struct StaticAccessorFactory {
    accessors: Mutex<HashMap<String, Arc<dyn Accessor>>>,
}

impl StaticAccessorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource_id: impl Into<String>, accessor: Arc<dyn Accessor>) {
        self.accessors
            .lock()
            .unwrap()
            .insert(resource_id.into(), accessor);
    }
}

impl AccessorFactory for StaticAccessorFactory {
    fn build(&self, conf: &VaultConf) -> Result<Arc<dyn Accessor>, CreateVaultError> {
        self.accessors
            .lock()
            .unwrap()
            .get(&conf.id)
            .cloned()
            .ok_or_else(|| CreateVaultError::UnknownResource(conf.id.clone()))
    }
}
