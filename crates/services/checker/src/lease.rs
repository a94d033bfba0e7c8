//! Distributed check-job lease protocol.
//!
//! Three KV-transacted primitives keyed by `job_check/{instance_id}`
//! guarantee at most one active checker per instance across the fleet.
//! All three are compare-and-set: they fail when the record's current
//! lessee is not the caller or the lease has expired, and a conflicted
//! transaction is never retried here — the caller skips the instance for
//! this cycle.

use std::time::Duration;

use meta_kv::{KvError, TxnKv, keys};

use crate::{
    model::{JobRecord, JobStatus},
    now_ms,
};

/// Claim the check job for `instance_id`, writing a busy record with a
/// lease of `lease_duration`.
///
/// `last_ctime_ms` is preserved when the record already exists, otherwise
/// initialized to now.
pub async fn prepare_check_job(
    txn_kv: &dyn TxnKv,
    instance_id: &str,
    lessee: &str,
    lease_duration: Duration,
) -> Result<(), PrepareError> {
    let key = keys::job_check_key(instance_id);
    let mut txn = txn_kv.create_txn().await.map_err(PrepareError::Kv)?;

    let now = now_ms();
    let existing = match txn.get(&key).await.map_err(PrepareError::Kv)? {
        Some(value) => Some(JobRecord::decode(&value).map_err(|source| {
            PrepareError::Malformed {
                instance_id: instance_id.to_string(),
                source,
            }
        })?),
        None => None,
    };

    if let Some(record) = &existing {
        if record.status == JobStatus::Busy && now < record.lease_expiration_ms {
            return Err(PrepareError::Conflict {
                lessee: record.lessee.clone(),
            });
        }
    }

    let record = JobRecord {
        instance_id: instance_id.to_string(),
        lessee: lessee.to_string(),
        lease_expiration_ms: now + lease_duration.as_millis() as i64,
        last_ctime_ms: existing
            .as_ref()
            .and_then(|r| r.last_ctime_ms)
            .or(Some(now)),
        last_success_time_ms: existing.as_ref().and_then(|r| r.last_success_time_ms),
        status: JobStatus::Busy,
    };
    txn.put(&key, &record.encode());
    txn.commit().await.map_err(|err| match err {
        KvError::Conflict => PrepareError::Conflict {
            lessee: "<concurrent>".to_string(),
        },
        other => PrepareError::Kv(other),
    })
}

/// Extend the lease held by `lessee` to now + `lease_duration`.
///
/// [`LeaseError::Lost`] means the record was stolen, released, or expired;
/// the caller must stop the in-flight check.
pub async fn lease_check_job(
    txn_kv: &dyn TxnKv,
    instance_id: &str,
    lessee: &str,
    lease_duration: Duration,
) -> Result<(), LeaseError> {
    let key = keys::job_check_key(instance_id);
    let mut txn = txn_kv.create_txn().await.map_err(LeaseError::Kv)?;

    let now = now_ms();
    let Some(value) = txn.get(&key).await.map_err(LeaseError::Kv)? else {
        return Err(LeaseError::Lost);
    };
    let mut record = JobRecord::decode(&value).map_err(|source| LeaseError::Malformed {
        instance_id: instance_id.to_string(),
        source,
    })?;

    if record.status != JobStatus::Busy || record.lessee != lessee || now >= record.lease_expiration_ms
    {
        return Err(LeaseError::Lost);
    }

    record.lease_expiration_ms = now + lease_duration.as_millis() as i64;
    txn.put(&key, &record.encode());
    txn.commit().await.map_err(LeaseError::Kv)
}

/// Release the check job, recording the outcome of the finished check.
///
/// Sets the record idle with `last_ctime_ms = ctime_ms`; a successful
/// check also stamps `last_success_time_ms`.
pub async fn finish_check_job(
    txn_kv: &dyn TxnKv,
    instance_id: &str,
    lessee: &str,
    success: bool,
    ctime_ms: i64,
) -> Result<(), FinishError> {
    let key = keys::job_check_key(instance_id);
    let mut txn = txn_kv.create_txn().await.map_err(FinishError::Kv)?;

    let now = now_ms();
    let Some(value) = txn.get(&key).await.map_err(FinishError::Kv)? else {
        return Err(FinishError::NotOwner);
    };
    let mut record = JobRecord::decode(&value).map_err(|source| FinishError::Malformed {
        instance_id: instance_id.to_string(),
        source,
    })?;

    if record.status != JobStatus::Busy || record.lessee != lessee || now >= record.lease_expiration_ms
    {
        return Err(FinishError::NotOwner);
    }

    record.status = JobStatus::Idle;
    record.last_ctime_ms = Some(ctime_ms);
    if success {
        record.last_success_time_ms = Some(now);
    }
    txn.put(&key, &record.encode());
    txn.commit().await.map_err(FinishError::Kv)
}

/// Errors from [`prepare_check_job`].
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    /// Another lessee holds an unexpired lease; skip this cycle.
    #[error("check job is busy, held by {lessee}")]
    Conflict { lessee: String },

    /// The stored record could not be decoded.
    #[error("malformed job record for instance {instance_id}")]
    Malformed {
        instance_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("kv error while preparing check job")]
    Kv(#[source] KvError),
}

/// Errors from [`lease_check_job`].
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease was stolen, released, or expired; abort the check.
    #[error("check job lease lost")]
    Lost,

    #[error("malformed job record for instance {instance_id}")]
    Malformed {
        instance_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("kv error while renewing check job lease")]
    Kv(#[source] KvError),
}

/// Errors from [`finish_check_job`].
#[derive(Debug, thiserror::Error)]
pub enum FinishError {
    /// The record is gone, idle, expired, or held by someone else.
    #[error("check job is not held by this process")]
    NotOwner,

    #[error("malformed job record for instance {instance_id}")]
    Malformed {
        instance_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("kv error while finishing check job")]
    Kv(#[source] KvError),
}
