//! Key schema for checker-visible metadata.
//!
//! Keys are UTF-8 paths with `/`-separated components. Numeric components
//! are zero-padded to 20 digits so that lexicographic KV order equals
//! numeric order; the check loops rely on rowset keys arriving in ascending
//! tablet order.
//!
//! ```text
//! instance/{instance_id}                                 -> InstanceInfo
//! storage_vault/{instance_id}/{vault_id}                 -> VaultConf
//! meta_rowset/{instance_id}/{tablet_id}/{end_version}    -> RowsetMeta
//! job_check/{instance_id}                                -> JobRecord
//! ```

/// Key of an instance record.
pub fn instance_key(instance_id: &str) -> Vec<u8> {
    format!("instance/{instance_id}").into_bytes()
}

/// Range covering every instance record.
pub fn instance_range() -> (Vec<u8>, Vec<u8>) {
    prefix_range(b"instance/")
}

/// Key of the check-job record for an instance.
pub fn job_check_key(instance_id: &str) -> Vec<u8> {
    format!("job_check/{instance_id}").into_bytes()
}

/// Key of one storage-vault binding.
pub fn storage_vault_key(instance_id: &str, vault_id: &str) -> Vec<u8> {
    format!("storage_vault/{instance_id}/{vault_id}").into_bytes()
}

/// Range covering every vault binding of an instance.
pub fn storage_vault_range(instance_id: &str) -> (Vec<u8>, Vec<u8>) {
    prefix_range(format!("storage_vault/{instance_id}/").as_bytes())
}

/// Key of one visible rowset's metadata.
pub fn meta_rowset_key(instance_id: &str, tablet_id: i64, end_version: i64) -> Vec<u8> {
    format!("meta_rowset/{instance_id}/{tablet_id:020}/{end_version:020}").into_bytes()
}

/// Range covering every visible rowset of an instance, tablets ascending.
pub fn meta_rowset_range(instance_id: &str) -> (Vec<u8>, Vec<u8>) {
    (
        meta_rowset_key(instance_id, 0, 0),
        meta_rowset_key(instance_id, i64::MAX, 0),
    )
}

/// Range covering every visible rowset of one tablet.
pub fn tablet_rowset_range(instance_id: &str, tablet_id: i64) -> (Vec<u8>, Vec<u8>) {
    (
        meta_rowset_key(instance_id, tablet_id, 0),
        meta_rowset_key(instance_id, tablet_id, i64::MAX),
    )
}

/// `[prefix, successor-of-prefix)` — the half-open range of all keys that
/// start with `prefix`.
fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let begin = prefix.to_vec();
    let mut end = prefix.to_vec();
    // The schema's prefixes never end in 0xff, so bumping the last byte is
    // always the exact successor.
    let last = end.last_mut().unwrap();
    *last += 1;
    (begin, end)
}
