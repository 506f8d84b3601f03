//! Survivor selection for hosts sharing one identity key.

use crate::state::Host;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::identity::normalize_ip;

/// Ordering where the preferred survivor sorts first.
///
/// Most recent `last_seen` wins and a missing `last_seen` loses to any value.
/// Equal `last_seen` prefers the newer row; when neither row was ever seen the
/// older row wins. Ties fall back to id order.
pub fn survivor_order(a: &Host, b: &Host) -> Ordering {
    let by_seen = match (a.last_seen, b.last_seen) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| b.created_at.cmp(&a.created_at)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.created_at.cmp(&b.created_at),
    };
    by_seen.then_with(|| a.id.cmp(&b.id))
}

/// One duplicate group: the row to keep and the ids to fold into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub ip: String,
    pub survivor: String,
    pub duplicates: Vec<String>,
}

/// Group hosts by normalised IP and plan a merge for every group of two or more.
pub fn plan_merges(hosts: &[Host]) -> Vec<MergePlan> {
    let mut groups: BTreeMap<String, Vec<&Host>> = BTreeMap::new();
    for host in hosts {
        groups.entry(normalize_ip(&host.ip)).or_default().push(host);
    }

    groups
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .map(|(ip, mut group)| {
            group.sort_by(|a, b| survivor_order(a, b));
            let survivor = group[0].id.clone();
            let duplicates = group[1..].iter().map(|h| h.id.clone()).collect();
            MergePlan {
                ip,
                survivor,
                duplicates,
            }
        })
        .collect()
}
