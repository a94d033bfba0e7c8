//! Per-instance forward and inverted checks.
//!
//! An [`InstanceChecker`] is bound to one instance for the duration of one
//! check job. `init` materializes the instance's storage vaults,
//! `do_check` verifies metadata-to-storage existence, `do_inverted_check`
//! verifies storage-to-metadata references.
//!
//! Both checks stream their authoritative source with bounded memory: the
//! forward check caches the file listing of a single tablet directory, the
//! inverted check caches the rowset-id set of a single tablet. Rowset keys
//! arrive in ascending tablet order, so each tablet is listed exactly
//! once per scan.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use futures::{StreamExt, TryStreamExt};
use meta_kv::{KvError, RangeGetOptions, TxnKv, keys};
use vault_store::{
    AccessorError, AccessorFactory, AccessorKind, CreateVaultError, StorageVault, VaultConf,
};

use crate::{
    metrics::CheckerMetrics,
    model::{InstanceInfo, RowsetMeta},
    sync_executor::{SyncExecutor, TaskPool},
};

/// Result of a check that ran to a reportable end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every probe passed.
    Clean,
    /// At least one probe failed; details are logged and counted.
    LossDetected,
}

impl CheckOutcome {
    pub fn is_clean(self) -> bool {
        matches!(self, CheckOutcome::Clean)
    }
}

/// A check that could not run to a reportable end. The job record is left
/// untouched so the lease expires naturally.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("kv scan failed")]
    Kv(#[source] KvError),

    #[error("vault listing failed")]
    Accessor(#[source] AccessorError),

    #[error("check aborted")]
    Aborted,
}

/// Failed to initialize an instance checker.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("failed to create storage vault {resource_id}")]
    Vault {
        resource_id: String,
        #[source]
        source: CreateVaultError,
    },

    #[error("malformed storage vault record")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to scan storage vaults")]
    Kv(#[source] KvError),
}

/// Checker for a single instance.
pub struct InstanceChecker {
    txn_kv: Arc<dyn TxnKv>,
    instance_id: String,
    factory: Arc<dyn AccessorFactory>,
    metrics: Arc<CheckerMetrics>,
    pool: Arc<TaskPool>,
    /// Registry of the instance's vaults, keyed by resource id.
    vaults: HashMap<String, StorageVault>,
    stopped: Arc<AtomicBool>,
}

impl InstanceChecker {
    pub fn new(
        txn_kv: Arc<dyn TxnKv>,
        instance_id: impl Into<String>,
        factory: Arc<dyn AccessorFactory>,
        metrics: Arc<CheckerMetrics>,
        pool: Arc<TaskPool>,
    ) -> Self {
        Self {
            txn_kv,
            instance_id: instance_id.into(),
            factory,
            metrics,
            pool,
            vaults: HashMap::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Request cooperative abort of the in-flight check.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Load the instance's vaults: first the legacy inline bindings, then
    /// the `storage_vault/` keyspace. Duplicate resource ids collapse on
    /// the first binding seen.
    pub async fn init(&mut self, instance: &InstanceInfo) -> Result<(), InitError> {
        self.init_inline_vaults(instance)?;
        self.init_storage_vaults(instance).await
    }

    fn init_inline_vaults(&mut self, instance: &InstanceInfo) -> Result<(), InitError> {
        for conf in &instance.obj_info {
            let vault = StorageVault::create(conf, self.factory.as_ref()).map_err(|source| {
                InitError::Vault {
                    resource_id: conf.id.clone(),
                    source,
                }
            })?;
            self.vaults.entry(conf.id.clone()).or_insert(vault);
        }
        Ok(())
    }

    async fn init_storage_vaults(&mut self, instance: &InstanceInfo) -> Result<(), InitError> {
        if instance.resource_ids.is_empty() {
            return Ok(());
        }

        let (begin, end) = keys::storage_vault_range(&self.instance_id);
        let mut stream =
            self.txn_kv
                .full_range_get(&begin, &end, RangeGetOptions::prefetching());
        while let Some(item) = stream.next().await {
            let (key, value) = item.map_err(InitError::Kv)?;
            let conf: VaultConf = serde_json::from_slice(&value).map_err(|err| {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    key = %String::from_utf8_lossy(&key),
                    "malformed storage vault, unable to deserialize"
                );
                InitError::Malformed(err)
            })?;
            let vault = StorageVault::create(&conf, self.factory.as_ref()).map_err(|source| {
                InitError::Vault {
                    resource_id: conf.id.clone(),
                    source,
                }
            })?;
            self.vaults.entry(conf.id.clone()).or_insert(vault);
        }
        Ok(())
    }

    /// Forward check: every segment referenced by visible rowset metadata
    /// must exist in its vault.
    ///
    /// Statistics are reported on every exit path.
    pub async fn do_check(&self) -> Result<CheckOutcome, CheckError> {
        tracing::info!(instance_id = %self.instance_id, "begin to check instance objects");
        let start = Instant::now();
        let mut stats = ForwardStats::default();

        let result = self.forward_check(&mut stats).await;

        let cost = start.elapsed();
        tracing::info!(
            instance_id = %self.instance_id,
            cost_s = cost.as_secs_f32(),
            num_scanned = stats.num_scanned,
            num_scanned_with_segment = stats.num_scanned_with_segment,
            num_check_failed = stats.num_check_failed,
            instance_volume = stats.instance_volume,
            "check instance objects finished"
        );
        let id = [self.instance_id.as_str()];
        let metrics = &self.metrics;
        metrics.num_scanned.with_label_values(&id).set(stats.num_scanned);
        metrics
            .num_scanned_with_segment
            .with_label_values(&id)
            .set(stats.num_scanned_with_segment);
        metrics
            .num_check_failed
            .with_label_values(&id)
            .set(stats.num_check_failed);
        metrics
            .check_cost_s
            .with_label_values(&id)
            .set(cost.as_secs() as i64);
        // Tablets whose listing failed are not included; the volume is a
        // lower bound on partial-failure cycles.
        metrics
            .instance_volume
            .with_label_values(&id)
            .set(stats.instance_volume);

        result?;
        Ok(if stats.num_check_failed == 0 {
            CheckOutcome::Clean
        } else {
            CheckOutcome::LossDetected
        })
    }

    async fn forward_check(&self, stats: &mut ForwardStats) -> Result<(), CheckError> {
        let (begin, end) = keys::meta_rowset_range(&self.instance_id);
        let mut stream =
            self.txn_kv
                .full_range_get(&begin, &end, RangeGetOptions::prefetching());

        // Single-slot cache of the current tablet's file listing; bounds
        // memory at "largest tablet directory".
        let mut cache: Option<TabletFiles> = None;

        while let Some(item) = stream.next().await {
            if self.stopped() {
                return Err(CheckError::Aborted);
            }
            let (key, value) = item.map_err(CheckError::Kv)?;
            stats.num_scanned += 1;

            let rs_meta: RowsetMeta = match serde_json::from_slice(&value) {
                Ok(meta) => meta,
                Err(err) => {
                    stats.num_check_failed += 1;
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "malformed rowset meta"
                    );
                    continue;
                }
            };

            self.check_rowset_objects(&rs_meta, &key, &mut cache, stats)
                .await;
        }
        Ok(())
    }

    /// Probe every segment of one rowset against the tablet's file set.
    /// Failures are counted, never fatal.
    async fn check_rowset_objects(
        &self,
        rs_meta: &RowsetMeta,
        key: &[u8],
        cache: &mut Option<TabletFiles>,
        stats: &mut ForwardStats,
    ) {
        if rs_meta.num_segments == 0 {
            return;
        }
        stats.num_scanned_with_segment += 1;

        if cache.as_ref().map(|c| c.tablet_id) != Some(rs_meta.tablet_id) {
            // Rowsets for a different tablet evict the cache unconditionally.
            *cache = None;

            let Some(vault) = self.vaults.get(&rs_meta.resource_id) else {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    resource_id = %rs_meta.resource_id,
                    tablet_id = rs_meta.tablet_id,
                    rowset_id = %rs_meta.rowset_id_v2,
                    "resource id not found in vault registry"
                );
                stats.num_check_failed += 1;
                return;
            };

            let mut files = HashSet::new();
            let mut tablet_volume = 0i64;
            let mut listing = vault
                .accessor()
                .list_directory(&vault.tablet_path(rs_meta.tablet_id));
            loop {
                match listing.try_next().await {
                    Ok(Some(file)) => {
                        tablet_volume += file.size;
                        files.insert(file.path);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(
                            instance_id = %self.instance_id,
                            tablet_id = rs_meta.tablet_id,
                            error = %err,
                            "failed to list tablet directory"
                        );
                        stats.num_check_failed += 1;
                        return;
                    }
                }
            }
            // Each tablet contributes its volume exactly once per scan.
            stats.instance_volume += tablet_volume;
            *cache = Some(TabletFiles {
                tablet_id: rs_meta.tablet_id,
                files,
                vault: vault.clone(),
            });
        }

        let Some(tablet) = cache.as_ref() else {
            return;
        };
        for seg_idx in 0..rs_meta.num_segments {
            let path = tablet
                .vault
                .segment_path(rs_meta.tablet_id, &rs_meta.rowset_id_v2, seg_idx);
            if tablet.files.contains(&path) {
                continue;
            }

            // The object is absent. Re-read the rowset key in a fresh
            // transaction: a vanished key means the rowset was deleted
            // concurrently, not data loss.
            match key_exist(self.txn_kv.as_ref(), key).await {
                Ok(false) => continue,
                Ok(true) => {
                    stats.num_check_failed += 1;
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        path = %path,
                        key = %String::from_utf8_lossy(key),
                        "object not exist"
                    );
                }
                Err(err) => {
                    stats.num_check_failed += 1;
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        path = %path,
                        error = %err,
                        "failed to re-probe rowset key"
                    );
                }
            }
        }
    }

    /// Minimum object-expiration lifecycle across the instance's S3
    /// vaults, in days. `None` when the instance has no S3 vaults.
    ///
    /// Bucket versioning is verified on the way; any failure aborts.
    pub async fn get_bucket_lifecycle(&self) -> Result<Option<i64>, CheckError> {
        let mut min_days: Option<i64> = None;
        for vault in self.vaults.values() {
            if vault.accessor().kind() != AccessorKind::S3 {
                continue;
            }
            vault
                .accessor()
                .check_versioning()
                .await
                .map_err(CheckError::Accessor)?;
            let days = vault
                .accessor()
                .get_life_cycle()
                .await
                .map_err(CheckError::Accessor)?;
            min_days = Some(min_days.map_or(days, |m| m.min(days)));
        }
        Ok(min_days)
    }

    /// Inverted check: every segment-shaped object in a vault must be
    /// referenced by some rowset.
    ///
    /// Vaults are checked concurrently on the shared pool; the first
    /// unrecoverable vault error cancels not-yet-started vaults.
    pub async fn do_inverted_check(&self) -> Result<CheckOutcome, CheckError> {
        tracing::info!(instance_id = %self.instance_id, "begin to inverted check objects");
        let start = Instant::now();

        let mut executor = SyncExecutor::with_cancel(
            self.pool.clone(),
            format!("inverted check {}", self.instance_id),
            |result: &Result<InvertedVaultStats, CheckError>| result.is_err(),
        );
        for vault in self.vaults.values() {
            let task = InvertedVaultTask {
                txn_kv: self.txn_kv.clone(),
                instance_id: self.instance_id.clone(),
                vault: vault.clone(),
                stopped: self.stopped.clone(),
            };
            executor.add(async move { task.run().await });
        }
        let (results, finished) = executor.when_all().await;

        let mut stats = InvertedVaultStats::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(vault_stats) => {
                    stats.num_scanned += vault_stats.num_scanned;
                    stats.num_check_failed += vault_stats.num_check_failed;
                }
                Err(err) => first_error = first_error.or(Some(err)),
            }
        }

        tracing::info!(
            instance_id = %self.instance_id,
            cost_s = start.elapsed().as_secs_f32(),
            num_scanned = stats.num_scanned,
            num_check_failed = stats.num_check_failed,
            "inverted check instance objects finished"
        );

        if let Some(err) = first_error {
            return Err(err);
        }
        if !finished {
            return Err(CheckError::Aborted);
        }
        Ok(if stats.num_check_failed == 0 {
            CheckOutcome::Clean
        } else {
            CheckOutcome::LossDetected
        })
    }
}

#[derive(Debug, Default)]
struct ForwardStats {
    num_scanned: i64,
    num_scanned_with_segment: i64,
    num_check_failed: i64,
    instance_volume: i64,
}

/// Single-slot cache: the file listing of the current tablet.
struct TabletFiles {
    tablet_id: i64,
    files: HashSet<String>,
    vault: StorageVault,
}

/// Single-slot cache: the known rowset ids of the current tablet.
#[derive(Default)]
struct TabletRowsets {
    tablet_id: i64,
    rowset_ids: HashSet<String>,
}

#[derive(Debug, Default)]
struct InvertedVaultStats {
    num_scanned: i64,
    num_check_failed: i64,
}

/// Inverted check of a single vault.
struct InvertedVaultTask {
    txn_kv: Arc<dyn TxnKv>,
    instance_id: String,
    vault: StorageVault,
    stopped: Arc<AtomicBool>,
}

impl InvertedVaultTask {
    async fn run(&self) -> Result<InvertedVaultStats, CheckError> {
        let mut stats = InvertedVaultStats::default();
        let mut cache: Option<TabletRowsets> = None;

        let mut listing = self.vault.accessor().list_directory("data");
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(CheckError::Aborted);
            }
            match listing.try_next().await {
                Ok(Some(file)) => {
                    stats.num_scanned += 1;
                    if !self.check_segment_file(&file.path, &mut cache).await? {
                        stats.num_check_failed += 1;
                        tracing::warn!(
                            instance_id = %self.instance_id,
                            uri = %self.vault.accessor().uri(),
                            path = %file.path,
                            "failed to check segment file"
                        );
                    }
                }
                Ok(None) => break,
                // A failed listing leaves an unknown set of unverified
                // objects; the whole check is unrecoverable.
                Err(err) => {
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        uri = %self.vault.accessor().uri(),
                        error = %err,
                        "failed to list data directory"
                    );
                    return Err(CheckError::Accessor(err));
                }
            }
        }
        Ok(stats)
    }

    /// Returns whether `path` is referenced by a known rowset. `Err` only
    /// on KV scan invalidation.
    async fn check_segment_file(
        &self,
        path: &str,
        cache: &mut Option<TabletRowsets>,
    ) -> Result<bool, CheckError> {
        let parts = match self.vault.layout().parse_segment_path(path) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    path = %path,
                    error = %err,
                    "failed to parse segment path"
                );
                return Ok(false);
            }
        };

        if let Some(tablet) = cache {
            if tablet.tablet_id == parts.tablet_id {
                return Ok(tablet.rowset_ids.contains(&parts.rowset_id));
            }
        }

        // Cache miss: collect every rowset id of this tablet.
        let mut tablet = TabletRowsets {
            tablet_id: parts.tablet_id,
            rowset_ids: HashSet::new(),
        };
        let (begin, end) = keys::tablet_rowset_range(&self.instance_id, parts.tablet_id);
        let mut stream =
            self.txn_kv
                .full_range_get(&begin, &end, RangeGetOptions::prefetching());
        while let Some(item) = stream.next().await {
            let (key, value) = item.map_err(CheckError::Kv)?;
            match serde_json::from_slice::<RowsetMeta>(&value) {
                Ok(rs_meta) => {
                    tablet.rowset_ids.insert(rs_meta.rowset_id_v2);
                }
                Err(err) => {
                    // The reference set is incomplete; fail this file but
                    // leave the cache unset so the next file retries.
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "malformed rowset meta value"
                    );
                    return Ok(false);
                }
            }
        }

        let known = tablet.rowset_ids.contains(&parts.rowset_id);
        *cache = Some(tablet);
        Ok(known)
    }
}

/// Whether `key` currently exists, read in a fresh transaction.
pub(crate) async fn key_exist(txn_kv: &dyn TxnKv, key: &[u8]) -> Result<bool, KvError> {
    let mut txn = txn_kv.create_txn().await?;
    Ok(txn.get(key).await?.is_some())
}
