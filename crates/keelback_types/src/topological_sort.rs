//! Deterministic topological ordering of package records by their `depends`
//! edges, used to sequence LINK operations (dependencies first) and, in
//! reverse, UNLINK operations.

use std::collections::{BTreeMap, BTreeSet};

use crate::PackageRecord;

/// Sorts records so that every record appears after all of its dependencies
/// that are part of the set. The result only depends on the contents of the
/// set, never on its input order. Cycles are broken deterministically: the
/// first record forced out of a cycle is the lexicographically smallest
/// non-noarch-python name, so noarch python packages (which need their
/// interpreter at link time) sort as late as possible.
pub fn sort_topologically<T: AsRef<PackageRecord> + Clone>(records: Vec<T>) -> Vec<T> {
    let by_name: BTreeMap<&str, &T> = records
        .iter()
        .map(|record| (record.as_ref().name.as_str(), record))
        .collect();

    // Outstanding dependency edges, restricted to names present in the set.
    // Virtual packages are constraint-only and never linked.
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, record) in &by_name {
        let deps: BTreeSet<&str> = record
            .as_ref()
            .depends
            .iter()
            .map(|spec| spec_name(spec))
            .filter(|dep| dep != name && !dep.starts_with("__") && by_name.contains_key(dep))
            .collect();
        for dep in &deps {
            dependents.entry(dep).or_default().push(name);
        }
        pending.insert(name, deps);
    }

    let mut order: Vec<&str> = Vec::with_capacity(by_name.len());
    let mut emitted: BTreeSet<&str> = BTreeSet::new();

    while emitted.len() < by_name.len() {
        // All records whose dependencies are satisfied, smallest name first.
        let ready: Vec<&str> = pending
            .iter()
            .filter(|(name, deps)| !emitted.contains(*name) && deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        let next = if let Some(&first) = ready.first() {
            first
        } else {
            // A cycle: force out the smallest name, keeping noarch python
            // packages in the cycle for as long as possible.
            *pending
                .iter()
                .filter(|(name, _)| !emitted.contains(*name))
                .map(|(name, _)| name)
                .min_by_key(|name| {
                    let record = by_name[**name].as_ref();
                    (record.noarch.is_python(), **name)
                })
                .expect("there are unemitted records")
        };

        emitted.insert(next);
        pending.remove(next);
        order.push(next);
        if let Some(waiters) = dependents.get(next) {
            for waiter in waiters {
                if let Some(deps) = pending.get_mut(waiter) {
                    deps.remove(next);
                }
            }
        }
    }

    order
        .into_iter()
        .map(|name| (*by_name[name]).clone())
        .collect()
}

fn spec_name(spec: &str) -> &str {
    spec.split([' ', '=', '<', '>', '!', '~'])
        .next()
        .unwrap_or(spec)
}
