use std::sync::Arc;

use checker::{CheckOutcome, CheckerMetrics, InstanceChecker, model::InstanceInfo};
use checker::sync_executor::TaskPool;
use meta_kv::keys;
use strata_config::Config;
use vault_store::ObjectStoreFactory;

/// One-shot check of a single instance, for incident triage.
///
/// No job lease is taken; a daemon checking the same instance concurrently
/// is harmless since checks only read.
pub async fn run(config: Config, instance_id: String, inverted: bool) -> Result<(), Error> {
    let txn_kv = meta_kv::connect(&config.kv_url).map_err(Error::KvConnect)?;

    let mut txn = txn_kv.create_txn().await.map_err(Error::Kv)?;
    let value = txn
        .get(&keys::instance_key(&instance_id))
        .await
        .map_err(Error::Kv)?
        .ok_or_else(|| Error::InstanceNotFound(instance_id.clone()))?;
    let instance: InstanceInfo =
        serde_json::from_slice(&value).map_err(Error::MalformedInstance)?;

    let mut instance_checker = InstanceChecker::new(
        txn_kv,
        instance_id.clone(),
        Arc::new(ObjectStoreFactory),
        Arc::new(CheckerMetrics::new()),
        TaskPool::new(config.recycle_concurrency),
    );
    instance_checker
        .init(&instance)
        .await
        .map_err(Error::Init)?;

    let mut outcome = instance_checker.do_check().await.map_err(Error::Check)?;
    if inverted {
        let inverted_outcome = instance_checker
            .do_inverted_check()
            .await
            .map_err(Error::Check)?;
        if !inverted_outcome.is_clean() {
            outcome = inverted_outcome;
        }
    }

    match outcome {
        CheckOutcome::Clean => {
            println!("instance {instance_id} is consistent");
            Ok(())
        }
        CheckOutcome::LossDetected => Err(Error::InconsistencyFound(instance_id)),
    }
}

/// Errors that can occur during a one-shot check.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to connect to the KV store.
    #[error("failed to connect to kv store: {0}")]
    KvConnect(#[source] meta_kv::ConnectError),

    /// KV read failed.
    #[error("kv error: {0}")]
    Kv(#[source] meta_kv::KvError),

    /// The instance record does not exist.
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// The instance record could not be decoded.
    #[error("malformed instance record: {0}")]
    MalformedInstance(#[source] serde_json::Error),

    /// Checker initialization failed.
    #[error("failed to init instance checker: {0}")]
    Init(#[source] checker::instance::InitError),

    /// The check could not run to a reportable end.
    #[error("check did not complete: {0}")]
    Check(#[source] checker::CheckError),

    /// The check completed and found inconsistencies.
    #[error("inconsistencies found in instance {0}, see logs for details")]
    InconsistencyFound(String),
}
