use std::collections::HashSet;

use crate::domain::{DishRecord, OptionGroup};

/// Primary groups then secondary groups, first occurrence of each id wins.
/// Entries without an id are dropped.
pub fn merge_groups(record: Option<&DishRecord>) -> Vec<OptionGroup> {
    let Some(record) = record else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    record
        .groups_primary
        .iter()
        .chain(record.groups_secondary.iter())
        .filter_map(OptionGroup::from_entry)
        .filter(|group| seen.insert(group.id))
        .collect()
}
