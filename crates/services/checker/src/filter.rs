//! Instance allow/deny filtering.

use std::collections::HashSet;

/// Accepts or rejects instance ids by allow/deny lists.
///
/// When the whitelist is non-empty it is authoritative and the blacklist
/// is ignored. Captured once at daemon start; not reloadable.
#[derive(Debug, Default)]
pub struct InstanceFilter {
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

impl InstanceFilter {
    pub fn new(
        whitelist: impl IntoIterator<Item = String>,
        blacklist: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            whitelist: whitelist.into_iter().collect(),
            blacklist: blacklist.into_iter().collect(),
        }
    }

    /// Returns `true` when `instance_id` must be skipped.
    pub fn filter_out(&self, instance_id: &str) -> bool {
        if !self.whitelist.is_empty() {
            return !self.whitelist.contains(instance_id);
        }
        self.blacklist.contains(instance_id)
    }
}
