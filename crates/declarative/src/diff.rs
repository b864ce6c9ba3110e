//! Set difference between resource lists.

use crate::resource::{ObjectKey, ResourceInfo};
use crds::Resource;
use std::collections::HashSet;

/// Elements of `current` whose identity is absent from `target`, in input order.
///
/// This is the prune set of a reconciliation.
#[must_use]
pub fn difference(current: &[ResourceInfo], target: &[ResourceInfo]) -> Vec<ResourceInfo> {
    let target_keys: HashSet<ObjectKey> = target.iter().map(ResourceInfo::key).collect();
    current
        .iter()
        .filter(|info| !target_keys.contains(&info.key()))
        .cloned()
        .collect()
}

/// Recorded resources present in only one of the two lists.
///
/// Entries of `old` come first, then entries of `new`, each in input order.
#[must_use]
pub fn resources_diff(old: &[Resource], new: &[Resource]) -> Vec<Resource> {
    let old_set: HashSet<&Resource> = old.iter().collect();
    let new_set: HashSet<&Resource> = new.iter().collect();
    old.iter()
        .filter(|r| !new_set.contains(r))
        .chain(new.iter().filter(|r| !old_set.contains(r)))
        .cloned()
        .collect()
}
