use crate::models::{CollectionSnapshot, DuplicateGroup, RemoteItem};
use std::collections::HashMap;

/// Grouping key: lowercased name, "|", then the lowercased artist names
/// sorted and joined with ",".
pub fn grouping_key(item: &RemoteItem) -> String {
    let mut artists: Vec<String> = item.artists.iter().map(|a| a.to_lowercase()).collect();
    artists.sort();
    format!("{}|{}", item.name.to_lowercase(), artists.join(","))
}

/// Partition a snapshot into duplicate groups.
///
/// Only keys with two or more occurrences are returned. Members are sorted by
/// position, so the first member is the occurrence to keep; groups are
/// ordered by the position of that first member. Unavailable slots are
/// ignored.
pub fn detect_groups(snapshot: &CollectionSnapshot) -> Vec<DuplicateGroup> {
    let mut by_key: HashMap<String, Vec<RemoteItem>> = HashMap::new();
    for item in snapshot.items.iter().filter(|i| i.available) {
        by_key.entry(grouping_key(item)).or_default().push(item.clone());
    }

    let mut groups: Vec<DuplicateGroup> = by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, mut members)| {
            members.sort_by_key(|m| m.position);
            DuplicateGroup { key, members }
        })
        .collect();
    groups.sort_by_key(|g| g.members[0].position);
    groups
}

/// Number of occurrences that keep-first dedup would remove.
pub fn redundant_count(groups: &[DuplicateGroup]) -> usize {
    groups.iter().map(|g| g.members.len() - 1).sum()
}
