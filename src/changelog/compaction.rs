//! Change-log compaction.
//!
//! Each entry is compared with the next live entry for the same target, however far
//! apart the two are. Rules are applied until nothing changes:
//! - a noop entry followed by any live entry is removed;
//! - `add X` followed by `add X` removes the first;
//! - `add X` followed by `delete X` removes both;
//! - a `delete X` with no live entry for X before it is removed.
//!
//! An `add X` is kept while a live entry depending on X sits between it and its
//! successor, since replaying that entry needs the earlier version of X.

use std::collections::HashSet;

use super::{Action, ChangeLog, Resource};
use crate::resources::DEFAULT_NAMESPACE;

/// Whether replaying `entry` needs the resource `target` adds.
fn depends_on(entry: &ChangeLog, target: &ChangeLog) -> bool {
    let (Some(needed), Some(resource)) = (target.cmd.resource(), entry.cmd.resource()) else {
        return false;
    };
    match needed {
        Resource::Namespace => resource != Resource::Namespace && entry.namespace == target.name,
        Resource::Service | Resource::Module => resource == Resource::Route,
        Resource::Collection => resource == Resource::Document && entry.namespace == target.namespace,
        _ => false,
    }
}

/// Returns the entries that can be deleted from storage without changing the
/// state a replay would produce. Input must be in id order.
pub fn compact(logs: &[ChangeLog]) -> Vec<ChangeLog> {
    let mut alive = vec![true; logs.len()];
    let next_live = |alive: &[bool], from: usize| (from + 1..logs.len()).find(|&j| alive[j]);

    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..logs.len() {
            if !alive[i] {
                continue;
            }
            let cl = &logs[i];

            if cl.cmd.is_noop() {
                if next_live(&alive, i).is_some() {
                    alive[i] = false;
                    changed = true;
                }
                continue;
            }

            match cl.cmd.action() {
                Some(Action::Add) => {
                    let Some(j) = (i + 1..logs.len()).find(|&j| alive[j] && cl.same_target(&logs[j])) else {
                        continue;
                    };
                    let needed = (i + 1..j).any(|k| alive[k] && depends_on(&logs[k], cl));
                    if needed {
                        continue;
                    }
                    alive[i] = false;
                    if logs[j].cmd.action() == Some(Action::Delete) {
                        alive[j] = false;
                    }
                    changed = true;
                }
                Some(Action::Delete) => {
                    let default_namespace =
                        cl.cmd.resource() == Some(Resource::Namespace) && cl.name == DEFAULT_NAMESPACE;
                    let orphan = !(0..i).any(|k| alive[k] && cl.same_target(&logs[k]));
                    if orphan && !default_namespace {
                        alive[i] = false;
                        changed = true;
                    }
                }
                None => {}
            }
        }
    }

    let mut seen = HashSet::new();
    logs.iter()
        .zip(alive)
        .filter(|(cl, keep)| !keep && seen.insert(cl.id.as_str()))
        .map(|(cl, _)| cl.clone())
        .collect()
}
