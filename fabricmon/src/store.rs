//! Mutex-guarded entity store, rebuilt incrementally from delta batches.
//!
//! The synchronizer worker is the only writer; everything else reads through
//! [`Topology::query`], which hands out clones so no reference escapes the
//! lock scope.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::entity::{Entity, EntityKind, parse_key_path};

/// Additions/removals pair describing how the store's view changed since
/// the last observation. Keys are full store key paths; addition values are
/// the raw `k=v` property bags.
#[derive(Debug, Default, Clone)]
pub struct DeltaBatch {
    pub additions: Vec<(String, String)>,
    pub removals: Vec<String>,
}

impl DeltaBatch {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// Locally-cached view of the logical topology.
pub struct Topology {
    inner: RwLock<HashMap<EntityKind, HashMap<String, Entity>>>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        for kind in EntityKind::ALL {
            map.insert(kind, HashMap::new());
        }
        Topology {
            inner: RwLock::new(map),
        }
    }

    /// Apply one delta batch under the exclusive lock: removals first
    /// (missing keys ignored), then upserts. Idempotent in both directions,
    /// so overlapping batches are safe to re-apply.
    pub fn apply_delta(&self, batch: &DeltaBatch) {
        let mut zoo = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for key_path in &batch.removals {
            let Some((kind, _, name)) = parse_key_path(key_path) else {
                continue;
            };
            if let Some(pool) = zoo.get_mut(&kind) {
                pool.remove(&name);
            }
        }
        for (key_path, value) in &batch.additions {
            match Entity::from_kv(key_path, value) {
                Ok(entity) => {
                    zoo.entry(entity.kind())
                        .or_default()
                        .insert(entity.name.clone(), entity);
                }
                Err(e) => {
                    debug!(key = %key_path, error = %e, "skipping non-entity key");
                }
            }
        }
    }

    /// Return clones of all `kind` entities matching `predicate`, under the
    /// shared lock. The sole read path used by the rest of the system.
    pub fn query<F>(&self, kind: EntityKind, predicate: F) -> Vec<Entity>
    where
        F: Fn(&Entity) -> bool,
    {
        let zoo = self.inner.read().unwrap_or_else(|e| e.into_inner());
        zoo.get(&kind)
            .map(|pool| pool.values().filter(|e| predicate(e)).cloned().collect())
            .unwrap_or_default()
    }

    /// Clone one entity by kind and key.
    pub fn get(&self, kind: EntityKind, name: &str) -> Option<Entity> {
        let zoo = self.inner.read().unwrap_or_else(|e| e.into_inner());
        zoo.get(&kind).and_then(|pool| pool.get(name)).cloned()
    }

    /// Entity count for one kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        let zoo = self.inner.read().unwrap_or_else(|e| e.into_inner());
        zoo.get(&kind).map(|pool| pool.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(additions: &[(&str, &str)], removals: &[&str]) -> DeltaBatch {
        DeltaBatch {
            additions: additions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            removals: removals.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_apply_delta_upsert_and_remove() {
        let topo = Topology::new();
        topo.apply_delta(&batch(
            &[
                ("/f/entity_view/LS/ls1", "id=1"),
                ("/f/entity_view/LS/ls1/lsp/p1", "ip=10.0.0.1,chassis=ch1"),
            ],
            &[],
        ));
        assert_eq!(topo.count(EntityKind::LogicalSwitch), 1);
        assert_eq!(topo.count(EntityKind::SwitchPort), 1);

        topo.apply_delta(&batch(&[], &["/f/entity_view/LS/ls1/lsp/p1"]));
        assert_eq!(topo.count(EntityKind::SwitchPort), 0);
    }

    #[test]
    fn test_apply_delta_idempotent() {
        let topo = Topology::new();
        let b = batch(
            &[
                ("/f/entity_view/LS/ls1", "id=1"),
                ("/f/entity_view/LR/lr1", "id=2"),
            ],
            &["/f/entity_view/chassis/gone"],
        );
        topo.apply_delta(&b);
        let once: Vec<_> = topo.query(EntityKind::LogicalSwitch, |_| true);
        topo.apply_delta(&b);
        let twice: Vec<_> = topo.query(EntityKind::LogicalSwitch, |_| true);
        assert_eq!(once.len(), twice.len());
        assert_eq!(topo.count(EntityKind::LogicalRouter), 1);
    }

    #[test]
    fn test_remove_missing_is_ignored() {
        let topo = Topology::new();
        topo.apply_delta(&batch(&[], &["/f/entity_view/LS/never-there"]));
        topo.apply_delta(&batch(&[], &["/f/not/an/entity"]));
        assert_eq!(topo.count(EntityKind::LogicalSwitch), 0);
    }

    #[test]
    fn test_addition_overwrites_by_key() {
        let topo = Topology::new();
        topo.apply_delta(&batch(&[("/f/entity_view/LS/ls1", "id=1")], &[]));
        topo.apply_delta(&batch(&[("/f/entity_view/LS/ls1", "id=9")], &[]));
        assert_eq!(topo.count(EntityKind::LogicalSwitch), 1);
        let ls = topo.get(EntityKind::LogicalSwitch, "ls1").unwrap();
        assert_eq!(ls.datapath_id(), Some(9));
    }

    #[test]
    fn test_query_filters_and_clones() {
        let topo = Topology::new();
        topo.apply_delta(&batch(
            &[
                ("/f/entity_view/LS/ls1/lsp/p1", "ip=10.0.0.1"),
                ("/f/entity_view/LS/ls1/lsp/p2", "ip=10.0.0.2"),
                ("/f/entity_view/LS/ls2/lsp/p3", "ip=10.0.0.3"),
            ],
            &[],
        ));
        let hits = topo.query(EntityKind::SwitchPort, |e| e.parent == "ls1");
        assert_eq!(hits.len(), 2);
    }
}
