//! Integration tests for the checker daemon and the interval inspector.

use std::{sync::Arc, time::Duration};

use checker::{
    Checker, CheckerMetrics,
    model::{InstanceInfo, InstanceStatus, JobRecord, JobStatus, RowsetMeta},
};
use meta_kv::{MemTxnKv, TxnKv, keys};
use strata_config::Config;
use url::Url;
use vault_store::{
    Accessor, AccessorKind, PathVersion, VaultBackend, VaultConf,
    mem::{MemAccessor, StaticAccessorFactory},
};

const DAY_MS: i64 = 86_400_000;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        scan_interval: Duration::from_millis(50),
        recycle_concurrency: 2,
        lease_expiration: Duration::from_secs(60),
        check_object_interval: Duration::from_secs(60),
        reserved_buffer_days: 3,
        recycle_whitelist: Vec::new(),
        recycle_blacklist: Vec::new(),
        enable_inverted_check: false,
        listen_port: 0,
        kv_url: Url::parse("memory:").unwrap(),
    })
}

fn vault_conf(id: &str, lifecycle_days: Option<i64>) -> VaultConf {
    VaultConf {
        id: id.to_string(),
        path_version: PathVersion::V0,
        backend: VaultBackend::S3 {
            bucket: "b".to_string(),
            endpoint: None,
            region: None,
            prefix: String::new(),
            lifecycle_days,
            versioning_enabled: true,
        },
    }
}

async fn put_instance(kv: &MemTxnKv, instance: &InstanceInfo) {
    let mut txn = kv.create_txn().await.expect("create txn");
    txn.put(
        &keys::instance_key(&instance.instance_id),
        &serde_json::to_vec(instance).expect("encode instance"),
    );
    txn.commit().await.expect("commit");
}

async fn put_rowset(kv: &MemTxnKv, instance_id: &str, tablet_id: i64, rowset_id: &str) {
    let meta = RowsetMeta {
        tablet_id,
        rowset_id_v2: rowset_id.to_string(),
        resource_id: "v1".to_string(),
        num_segments: 1,
    };
    let mut txn = kv.create_txn().await.expect("create txn");
    txn.put(
        &keys::meta_rowset_key(instance_id, tablet_id, 2),
        &serde_json::to_vec(&meta).expect("encode rowset meta"),
    );
    txn.commit().await.expect("commit");
}

async fn read_job_record(kv: &MemTxnKv, instance_id: &str) -> Option<JobRecord> {
    let mut txn = kv.create_txn().await.expect("create txn");
    let value = txn
        .get(&keys::job_check_key(instance_id))
        .await
        .expect("get job record")?;
    Some(JobRecord::decode(&value).expect("decode job record"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn daemon_checks_discovered_instance_and_finishes_job() {
    //* Given
    let kv = MemTxnKv::new();
    let instance = InstanceInfo {
        instance_id: "i1".to_string(),
        status: InstanceStatus::Normal,
        ctime_ms: now_ms(),
        obj_info: vec![vault_conf("v1", Some(30))],
        resource_ids: Vec::new(),
    };
    put_instance(&kv, &instance).await;
    put_rowset(&kv, "i1", 100, "R1").await;

    let accessor = Arc::new(MemAccessor::new().with_lifecycle_days(30));
    accessor.put_object("data/100/R1_0.dat", 10).await;
    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", accessor as Arc<dyn Accessor>);

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        test_config(),
        factory,
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );

    //* When
    daemon.start();

    // Wait for the worker to claim, check, and release the job.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let record = loop {
        if let Some(record) = read_job_record(&kv, "i1").await {
            if record.status == JobStatus::Idle {
                break record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "daemon did not finish the check job in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    daemon.stop().await;

    //* Then
    assert_eq!(record.lessee, "10.0.0.1:5100");
    assert!(
        record.last_success_time_ms.is_some(),
        "clean check must stamp last_success_time_ms"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn daemon_skips_deleted_and_filtered_instances() {
    //* Given
    let kv = MemTxnKv::new();
    let mut deleted = InstanceInfo {
        instance_id: "gone".to_string(),
        status: InstanceStatus::Deleted,
        ctime_ms: now_ms(),
        obj_info: vec![vault_conf("v1", Some(30))],
        resource_ids: Vec::new(),
    };
    put_instance(&kv, &deleted).await;
    deleted.instance_id = "denied".to_string();
    deleted.status = InstanceStatus::Normal;
    put_instance(&kv, &deleted).await;

    let mut config = (*test_config()).clone();
    config.recycle_blacklist = vec!["denied".to_string()];

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        Arc::new(config),
        Arc::new(StaticAccessorFactory::new()),
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );

    //* When
    daemon.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    daemon.stop().await;

    //* Then
    assert!(read_job_record(&kv, "gone").await.is_none());
    assert!(read_job_record(&kv, "denied").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_joins_all_tasks_promptly() {
    //* Given
    let kv = MemTxnKv::new();
    for i in 0..5 {
        let instance = InstanceInfo {
            instance_id: format!("i{i}"),
            status: InstanceStatus::Normal,
            ctime_ms: now_ms(),
            obj_info: vec![vault_conf("v1", Some(30))],
            resource_ids: Vec::new(),
        };
        put_instance(&kv, &instance).await;
        put_rowset(&kv, &instance.instance_id, 100, "R1").await;
    }
    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", Arc::new(MemAccessor::new()) as Arc<dyn Accessor>);

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        test_config(),
        factory,
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );
    daemon.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    //* When / Then
    tokio::time::timeout(Duration::from_secs(5), daemon.stop())
        .await
        .expect("stop must join every task in bounded time");
    assert!(daemon.stopped());
}

#[tokio::test]
async fn inspector_alarms_when_check_recency_falls_behind_lifecycle() {
    //* Given
    // Lifecycle 10d, buffer 3d: the budget is 7d; the last check (the
    // instance's creation, absent any job record) was 8d ago.
    let kv = MemTxnKv::new();
    let accessor = Arc::new(MemAccessor::new().with_lifecycle_days(10));
    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", accessor as Arc<dyn Accessor>);

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        test_config(),
        factory,
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );
    let instance = InstanceInfo {
        instance_id: "i1".to_string(),
        status: InstanceStatus::Normal,
        ctime_ms: now_ms() - 8 * DAY_MS,
        obj_info: vec![vault_conf("v1", Some(10))],
        resource_ids: Vec::new(),
    };

    //* When
    let alarm = daemon.do_inspect(&instance).await;

    //* Then
    let alarm = alarm.expect("alarm must fire");
    assert_eq!(alarm.instance_id, "i1");
    assert_eq!(alarm.bucket_lifecycle_days, 10);
    assert_eq!(alarm.expiration_ms, 7 * DAY_MS);
}

#[tokio::test]
async fn inspector_stays_quiet_for_recently_checked_instance() {
    //* Given
    let kv = MemTxnKv::new();
    let accessor = Arc::new(MemAccessor::new().with_lifecycle_days(7));
    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", accessor as Arc<dyn Accessor>);

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        test_config(),
        factory,
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );

    //* When / Then
    // Checked one day ago with a 4d budget (7d lifecycle - 3d buffer).
    let fresh = InstanceInfo {
        instance_id: "i1".to_string(),
        status: InstanceStatus::Normal,
        ctime_ms: now_ms() - DAY_MS,
        obj_info: vec![vault_conf("v1", Some(7))],
        resource_ids: Vec::new(),
    };
    assert!(daemon.do_inspect(&fresh).await.is_none());

    // Checked five days ago: past the 4d budget.
    let stale = InstanceInfo {
        ctime_ms: now_ms() - 5 * DAY_MS,
        ..fresh
    };
    assert!(daemon.do_inspect(&stale).await.is_some());
}

#[tokio::test]
async fn inspector_skips_instances_without_s3_vaults() {
    //* Given
    let kv = MemTxnKv::new();
    let accessor = Arc::new(MemAccessor::new().with_kind(AccessorKind::Hdfs));
    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", accessor as Arc<dyn Accessor>);

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        test_config(),
        factory,
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );
    let instance = InstanceInfo {
        instance_id: "i1".to_string(),
        status: InstanceStatus::Normal,
        // Ancient, but nothing expires outside S3.
        ctime_ms: now_ms() - 100 * DAY_MS,
        obj_info: vec![vault_conf("v1", None)],
        resource_ids: Vec::new(),
    };

    //* When / Then
    assert!(daemon.do_inspect(&instance).await.is_none());
}

#[tokio::test]
async fn inspector_aborts_when_versioning_is_disabled() {
    //* Given
    let kv = MemTxnKv::new();
    let accessor = Arc::new(
        MemAccessor::new()
            .with_lifecycle_days(10)
            .with_versioning(false),
    );
    let factory = Arc::new(StaticAccessorFactory::new());
    factory.insert("v1", accessor as Arc<dyn Accessor>);

    let daemon = Checker::new(
        Arc::new(kv.clone()),
        test_config(),
        factory,
        Arc::new(CheckerMetrics::new()),
        "10.0.0.1:5100".to_string(),
    );
    let instance = InstanceInfo {
        instance_id: "i1".to_string(),
        status: InstanceStatus::Normal,
        ctime_ms: now_ms() - 100 * DAY_MS,
        obj_info: vec![vault_conf("v1", Some(10))],
        resource_ids: Vec::new(),
    };

    //* When / Then
    // Versioning failures abort the inspection without an alarm.
    assert!(daemon.do_inspect(&instance).await.is_none());
}
