//! Integration tests for the per-instance forward and inverted checks.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use checker::{
    CheckError, CheckOutcome, CheckerMetrics, InstanceChecker,
    model::{InstanceInfo, InstanceStatus, RowsetMeta},
    sync_executor::TaskPool,
};
use meta_kv::{MemTxnKv, TxnKv, keys};
use vault_store::{
    Accessor, AccessorError, AccessorKind, ListStream, PathVersion, VaultBackend, VaultConf,
    mem::{MemAccessor, StaticAccessorFactory},
};

fn vault_conf(id: &str) -> VaultConf {
    VaultConf {
        id: id.to_string(),
        path_version: PathVersion::V0,
        backend: VaultBackend::S3 {
            bucket: "b".to_string(),
            endpoint: None,
            region: None,
            prefix: String::new(),
            lifecycle_days: Some(30),
            versioning_enabled: true,
        },
    }
}

fn instance_info(id: &str, vaults: &[&str]) -> InstanceInfo {
    InstanceInfo {
        instance_id: id.to_string(),
        status: InstanceStatus::Normal,
        ctime_ms: 0,
        obj_info: vaults.iter().map(|v| vault_conf(v)).collect(),
        resource_ids: Vec::new(),
    }
}

async fn put_rowset(
    kv: &MemTxnKv,
    instance_id: &str,
    tablet_id: i64,
    end_version: i64,
    rowset_id: &str,
    resource_id: &str,
    num_segments: i32,
) {
    let meta = RowsetMeta {
        tablet_id,
        rowset_id_v2: rowset_id.to_string(),
        resource_id: resource_id.to_string(),
        num_segments,
    };
    let mut txn = kv.create_txn().await.expect("create txn");
    txn.put(
        &keys::meta_rowset_key(instance_id, tablet_id, end_version),
        &serde_json::to_vec(&meta).expect("encode rowset meta"),
    );
    txn.commit().await.expect("commit");
}

async fn build_checker(
    kv: &MemTxnKv,
    instance: &InstanceInfo,
    accessors: &[(&str, Arc<MemAccessor>)],
) -> (InstanceChecker, Arc<CheckerMetrics>) {
    let factory = Arc::new(StaticAccessorFactory::new());
    for (id, accessor) in accessors {
        factory.insert(*id, accessor.clone() as Arc<dyn Accessor>);
    }
    let metrics = Arc::new(CheckerMetrics::new());
    let mut checker = InstanceChecker::new(
        Arc::new(kv.clone()),
        instance.instance_id.clone(),
        factory,
        metrics.clone(),
        TaskPool::new(4),
    );
    checker.init(instance).await.expect("init checker");
    (checker, metrics)
}

#[tokio::test]
async fn forward_check_passes_on_complete_instance() {
    //* Given
    // One tablet, one rowset with both segment objects present.
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 2).await;

    let accessor = Arc::new(MemAccessor::new().with_lifecycle_days(30));
    accessor.put_object("data/100/R1_0.dat", 10).await;
    accessor.put_object("data/100/R1_1.dat", 20).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, metrics) = build_checker(&kv, &instance, &[("v1", accessor)]).await;

    //* When
    let outcome = checker.do_check().await.expect("forward check");

    //* Then
    assert_eq!(outcome, CheckOutcome::Clean);
    assert_eq!(metrics.num_scanned.with_label_values(&["i1"]).get(), 1);
    assert_eq!(
        metrics
            .num_scanned_with_segment
            .with_label_values(&["i1"])
            .get(),
        1
    );
    assert_eq!(metrics.num_check_failed.with_label_values(&["i1"]).get(), 0);
    assert_eq!(metrics.instance_volume.with_label_values(&["i1"]).get(), 30);
}

#[tokio::test]
async fn forward_check_reports_missing_segment() {
    //* Given
    // The rowset references two segments but only one object exists, and
    // the rowset key is still present at re-probe time: real loss.
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 2).await;

    let accessor = Arc::new(MemAccessor::new());
    accessor.put_object("data/100/R1_0.dat", 10).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, metrics) = build_checker(&kv, &instance, &[("v1", accessor)]).await;

    //* When
    let outcome = checker.do_check().await.expect("forward check");

    //* Then
    assert_eq!(outcome, CheckOutcome::LossDetected);
    assert_eq!(metrics.num_check_failed.with_label_values(&["i1"]).get(), 1);
}

/// Accessor that deletes a KV key the first time it is listed, simulating
/// a rowset deleted between the metadata scan and the re-probe.
struct DeleteKeyOnList {
    inner: Arc<MemAccessor>,
    kv: MemTxnKv,
    key: Vec<u8>,
    deleted: AtomicBool,
}

#[async_trait]
impl Accessor for DeleteKeyOnList {
    fn kind(&self) -> AccessorKind {
        self.inner.kind()
    }

    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn list_directory(&self, dir: &str) -> ListStream {
        if !self.deleted.swap(true, Ordering::SeqCst) {
            let kv = self.kv.clone();
            let key = self.key.clone();
            let inner = self.inner.list_directory(dir);
            return Box::pin(async_stream::try_stream! {
                let mut txn = kv
                    .create_txn()
                    .await
                    .map_err(|err| AccessorError::Unsupported(err.to_string()))?;
                txn.delete(&key);
                txn.commit()
                    .await
                    .map_err(|err| AccessorError::Unsupported(err.to_string()))?;
                for await item in inner {
                    yield item?;
                }
            });
        }
        self.inner.list_directory(dir)
    }

    async fn check_versioning(&self) -> Result<(), AccessorError> {
        self.inner.check_versioning().await
    }

    async fn get_life_cycle(&self) -> Result<i64, AccessorError> {
        self.inner.get_life_cycle().await
    }
}

#[tokio::test]
async fn forward_check_tolerates_concurrently_deleted_rowset() {
    //* Given
    // The segment object is missing but the rowset key vanishes before the
    // re-probe: not data loss.
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 2).await;

    let inner = Arc::new(MemAccessor::new());
    inner.put_object("data/100/R1_0.dat", 10).await;
    let accessor = Arc::new(DeleteKeyOnList {
        inner,
        kv: kv.clone(),
        key: keys::meta_rowset_key("i1", 100, 2),
        deleted: AtomicBool::new(false),
    });

    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", accessor as Arc<dyn Accessor>);
    let metrics = Arc::new(CheckerMetrics::new());
    let instance = instance_info("i1", &["v1"]);
    let mut checker = InstanceChecker::new(
        Arc::new(kv.clone()),
        "i1",
        factory,
        metrics.clone(),
        TaskPool::new(2),
    );
    checker.init(&instance).await.expect("init");

    //* When
    let outcome = checker.do_check().await.expect("forward check");

    //* Then
    assert_eq!(outcome, CheckOutcome::Clean);
    assert_eq!(metrics.num_check_failed.with_label_values(&["i1"]).get(), 0);
}

#[tokio::test]
async fn forward_check_counts_unknown_resource_as_failure() {
    //* Given
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "missing-vault", 1).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, metrics) =
        build_checker(&kv, &instance, &[("v1", Arc::new(MemAccessor::new()))]).await;

    //* When
    let outcome = checker.do_check().await.expect("forward check");

    //* Then
    // An unknown resource id is counted and scanned past, not fatal.
    assert_eq!(outcome, CheckOutcome::LossDetected);
    assert_eq!(metrics.num_check_failed.with_label_values(&["i1"]).get(), 1);
}

#[tokio::test]
async fn forward_check_aborts_on_kv_scan_invalidation() {
    //* Given
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 1).await;
    kv.set_range_fault(Some(0));

    let instance = instance_info("i1", &["v1"]);
    let (checker, _metrics) =
        build_checker(&kv, &instance, &[("v1", Arc::new(MemAccessor::new()))]).await;

    //* When
    let res = checker.do_check().await;

    //* Then
    assert!(matches!(res, Err(CheckError::Kv(_))));
}

#[tokio::test]
async fn forward_check_skips_rowsets_without_segments() {
    //* Given
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R0", "v1", 0).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, metrics) =
        build_checker(&kv, &instance, &[("v1", Arc::new(MemAccessor::new()))]).await;

    //* When
    let outcome = checker.do_check().await.expect("forward check");

    //* Then
    assert_eq!(outcome, CheckOutcome::Clean);
    assert_eq!(metrics.num_scanned.with_label_values(&["i1"]).get(), 1);
    assert_eq!(
        metrics
            .num_scanned_with_segment
            .with_label_values(&["i1"])
            .get(),
        0
    );
}

#[tokio::test]
async fn inverted_check_flags_unreferenced_object() {
    //* Given
    // The vault holds an object for rowset R2 but metadata only knows R1.
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 1).await;

    let accessor = Arc::new(MemAccessor::new());
    accessor.put_object("data/100/R2_0.dat", 10).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, _metrics) = build_checker(&kv, &instance, &[("v1", accessor)]).await;

    //* When
    let outcome = checker.do_inverted_check().await.expect("inverted check");

    //* Then
    assert_eq!(outcome, CheckOutcome::LossDetected);
}

#[tokio::test]
async fn inverted_check_passes_when_objects_are_referenced() {
    //* Given
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 1).await;

    let accessor = Arc::new(MemAccessor::new());
    accessor.put_object("data/100/R1_0.dat", 10).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, _metrics) = build_checker(&kv, &instance, &[("v1", accessor)]).await;

    //* When / Then
    let outcome = checker.do_inverted_check().await.expect("inverted check");
    assert_eq!(outcome, CheckOutcome::Clean);
}

#[tokio::test]
async fn inverted_check_is_unrecoverable_on_list_failure() {
    //* Given
    let kv = MemTxnKv::new();
    let accessor = Arc::new(MemAccessor::new());
    accessor.fail_listings();

    let instance = instance_info("i1", &["v1"]);
    let (checker, _metrics) = build_checker(&kv, &instance, &[("v1", accessor)]).await;

    //* When / Then
    assert!(matches!(
        checker.do_inverted_check().await,
        Err(CheckError::Accessor(_))
    ));
}

#[tokio::test]
async fn stopped_checker_aborts_without_result() {
    //* Given
    let kv = MemTxnKv::new();
    put_rowset(&kv, "i1", 100, 2, "R1", "v1", 1).await;

    let instance = instance_info("i1", &["v1"]);
    let (checker, _metrics) =
        build_checker(&kv, &instance, &[("v1", Arc::new(MemAccessor::new()))]).await;

    //* When
    checker.stop();
    let res = checker.do_check().await;

    //* Then
    assert!(checker.stopped());
    assert!(matches!(res, Err(CheckError::Aborted)));
}
