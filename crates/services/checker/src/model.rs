//! KV-resident records the checker reads and writes.
//!
//! All values are JSON-encoded. Decoding failures are surfaced to callers,
//! which count or log them per the check algorithms; a malformed value
//! never panics and never silently passes.

use vault_store::VaultConf;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Normal,
    Deleted,
}

/// A logical tenant: owns tablets, rowsets, and vault bindings.
///
/// Read-only to the checker; written by the instance-management service.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    #[serde(default = "default_instance_status")]
    pub status: InstanceStatus,
    /// Creation time, ms since epoch.
    #[serde(default)]
    pub ctime_ms: i64,
    /// Legacy inline vault bindings (path layout v0).
    #[serde(default)]
    pub obj_info: Vec<VaultConf>,
    /// Resource ids bound via the `storage_vault/` keyspace.
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

fn default_instance_status() -> InstanceStatus {
    InstanceStatus::Normal
}

/// Metadata of one visible rowset, stored under
/// `meta_rowset/{instance_id}/{tablet_id}/{end_version}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RowsetMeta {
    pub tablet_id: i64,
    pub rowset_id_v2: String,
    /// Vault the rowset's segments live in.
    pub resource_id: String,
    /// A rowset with zero segments has no object-store footprint.
    pub num_segments: i32,
}

/// Status of a check job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Busy,
}

/// The per-instance check-job record, stored under
/// `job_check/{instance_id}`.
///
/// Invariant: across the fleet, at most one lessee holds an unexpired
/// lease per instance at any instant.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobRecord {
    pub instance_id: String,
    /// `ip:port` identity of the process holding the lease.
    pub lessee: String,
    /// Lease deadline, ms since epoch.
    pub lease_expiration_ms: i64,
    /// Start time of the last check that ran to a reportable end.
    #[serde(default)]
    pub last_ctime_ms: Option<i64>,
    /// Completion time of the last fully clean check.
    #[serde(default)]
    pub last_success_time_ms: Option<i64>,
    pub status: JobStatus,
}

impl JobRecord {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("job record encoding is infallible")
    }
}
