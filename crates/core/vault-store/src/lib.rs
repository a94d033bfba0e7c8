//! Storage-vault configuration, accessors, and path layouts.
//!
//! A storage vault is a configured backend (S3 bucket or HDFS root) plus a
//! remote path layout. Vault bindings are stored in the metadata KV and
//! materialized into [`StorageVault`]s — an [`Accessor`] doing the listing
//! and inspection calls, and a [`PathVersion`] mapping tablets and segments
//! to object keys — by an [`AccessorFactory`].

use std::sync::Arc;

use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, prefix::PrefixStore};

pub mod accessor;
pub mod layout;
pub mod mem;

pub use self::{
    accessor::{
        Accessor, AccessorError, AccessorKind, BucketProps, FileMeta, ListStream,
        ObjectStoreAccessor,
    },
    layout::{PathParseError, PathVersion, SegmentPathParts},
};

/// Serialized vault binding, as stored inline in an instance record or
/// under the `storage_vault/{instance_id}/` keyspace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VaultConf {
    /// Resource id rowsets refer to.
    pub id: String,
    #[serde(default)]
    pub path_version: PathVersion,
    pub backend: VaultBackend,
}

/// Backend-specific vault configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultBackend {
    S3 {
        bucket: String,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        prefix: String,
        /// Object-expiration lifecycle of the bucket, in days.
        #[serde(default)]
        lifecycle_days: Option<i64>,
        /// Whether object versioning is enabled on the bucket.
        #[serde(default)]
        versioning_enabled: bool,
    },
    Hdfs {
        /// Root URI. `file://` roots are served by the local filesystem.
        uri: String,
        #[serde(default)]
        prefix: String,
    },
}

/// A vault bound to one instance checker: accessor plus path layout.
#[derive(Clone)]
pub struct StorageVault {
    id: String,
    layout: PathVersion,
    accessor: Arc<dyn Accessor>,
}

impl StorageVault {
    pub fn new(id: impl Into<String>, layout: PathVersion, accessor: Arc<dyn Accessor>) -> Self {
        Self {
            id: id.into(),
            layout,
            accessor,
        }
    }

    /// Materialize a vault from its serialized configuration.
    pub fn create(
        conf: &VaultConf,
        factory: &dyn AccessorFactory,
    ) -> Result<Self, CreateVaultError> {
        let accessor = factory.build(conf)?;
        Ok(Self::new(conf.id.clone(), conf.path_version, accessor))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor> {
        &self.accessor
    }

    pub fn layout(&self) -> PathVersion {
        self.layout
    }

    pub fn tablet_path(&self, tablet_id: i64) -> String {
        self.layout.tablet_path(tablet_id)
    }

    pub fn segment_path(&self, tablet_id: i64, rowset_id: &str, seg_idx: i32) -> String {
        self.layout.segment_path(tablet_id, rowset_id, seg_idx)
    }
}

impl std::fmt::Debug for StorageVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageVault")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("uri", &self.accessor.uri())
            .finish()
    }
}

/// Builds accessors from vault configurations.
///
/// Injected into the checker so tests can substitute in-memory vaults; see
/// [`mem::StaticAccessorFactory`].
pub trait AccessorFactory: Send + Sync {
    fn build(&self, conf: &VaultConf) -> Result<Arc<dyn Accessor>, CreateVaultError>;
}

/// Failed to materialize a vault from its configuration.
#[derive(Debug, thiserror::Error)]
pub enum CreateVaultError {
    #[error("failed to build object store for vault {id}: {source}")]
    ObjectStore {
        id: String,
        #[source]
        source: object_store::Error,
    },

    #[error("unsupported vault backend for {0}")]
    UnsupportedBackend(String),

    #[error("no accessor registered for resource {0}")]
    UnknownResource(String),
}

/// Production [`AccessorFactory`] over `object_store` builders.
///
/// Cloud credentials come from the environment (`AWS_*`), matching the rest
/// of the workspace's object-store configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectStoreFactory;

impl AccessorFactory for ObjectStoreFactory {
    fn build(&self, conf: &VaultConf) -> Result<Arc<dyn Accessor>, CreateVaultError> {
        match &conf.backend {
            VaultBackend::S3 {
                bucket,
                endpoint,
                region,
                prefix,
                lifecycle_days,
                versioning_enabled,
            } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                let store = builder.build().map_err(|source| {
                    CreateVaultError::ObjectStore {
                        id: conf.id.clone(),
                        source,
                    }
                })?;
                let store: Arc<dyn ObjectStore> =
                    Arc::new(PrefixStore::new(store, prefix.as_str()));
                Ok(Arc::new(ObjectStoreAccessor::new(
                    AccessorKind::S3,
                    format!("s3://{bucket}/{prefix}"),
                    store,
                    BucketProps {
                        versioning_enabled: *versioning_enabled,
                        lifecycle_days: *lifecycle_days,
                    },
                )))
            }
            VaultBackend::Hdfs { uri, prefix } => {
                // Only filesystem-backed roots are served in-process; real
                // HDFS clients implement `Accessor` behind this factory.
                let Some(root) = uri.strip_prefix("file://") else {
                    return Err(CreateVaultError::UnsupportedBackend(conf.id.clone()));
                };
                let store = LocalFileSystem::new_with_prefix(root).map_err(|source| {
                    CreateVaultError::ObjectStore {
                        id: conf.id.clone(),
                        source,
                    }
                })?;
                let store: Arc<dyn ObjectStore> =
                    Arc::new(PrefixStore::new(store, prefix.as_str()));
                Ok(Arc::new(ObjectStoreAccessor::new(
                    AccessorKind::Hdfs,
                    uri.clone(),
                    store,
                    BucketProps::default(),
                )))
            }
        }
    }
}
