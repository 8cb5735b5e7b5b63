//! The in-memory insert/delete overlay layered on top of the persistent
//! permutations.
//!
//! Writers swap a fresh immutable snapshot under a lock; queries grab an
//! `Arc` of the current snapshot once at start and keep it for their whole
//! lifetime, so a running scan never observes a half-applied update.

use std::collections::BTreeSet;
use std::ops::Sub;
use std::sync::{Arc, RwLock};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use super::permutation::Permutation;
use crate::{IdTriple, ValueId};

/// Observable size of the overlay. The counts are signed so differences
/// between two observations are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaTriplesCount {
    pub inserted: i64,
    pub deleted: i64,
}

impl DeltaTriplesCount {
    pub fn total(&self) -> i64 {
        self.inserted + self.deleted
    }
}

impl Sub for DeltaTriplesCount {
    type Output = DeltaTriplesCount;

    fn sub(self, rhs: DeltaTriplesCount) -> DeltaTriplesCount {
        DeltaTriplesCount {
            inserted: self.inserted - rhs.inserted,
            deleted: self.deleted - rhs.deleted,
        }
    }
}

impl Serialize for DeltaTriplesCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DeltaTriplesCount", 3)?;
        state.serialize_field("inserted", &self.inserted)?;
        state.serialize_field("deleted", &self.deleted)?;
        state.serialize_field("total", &self.total())?;
        state.end()
    }
}

/// One immutable observation of the overlay.
#[derive(Debug, Default, Clone)]
pub struct DeltaSnapshot {
    inserted: BTreeSet<IdTriple>,
    deleted: BTreeSet<IdTriple>,
}

impl DeltaSnapshot {
    pub fn count(&self) -> DeltaTriplesCount {
        DeltaTriplesCount {
            inserted: self.inserted.len() as i64,
            deleted: self.deleted.len() as i64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }

    pub fn is_deleted(&self, triple: &IdTriple) -> bool {
        self.deleted.contains(triple)
    }

    /// The inserted (resp. deleted) triples matching a scan's bound prefix,
    /// permuted into the scan's column order and sorted by it.
    pub fn triples_for_scan(
        &self,
        permutation: Permutation,
        col0: Option<ValueId>,
        col1: Option<ValueId>,
        deleted: bool,
    ) -> Vec<IdTriple> {
        let source = if deleted { &self.deleted } else { &self.inserted };
        let mut result: Vec<IdTriple> = source
            .iter()
            .map(|&triple| permutation.apply(triple))
            .filter(|permuted| {
                col0.map_or(true, |id| permuted[0] == id)
                    && col1.map_or(true, |id| permuted[1] == id)
            })
            .collect();
        result.sort_unstable();
        result
    }
}

/// Process-wide overlay state: one writer at a time, any number of readers.
#[derive(Debug, Default)]
pub struct DeltaTriples {
    state: RwLock<Arc<DeltaSnapshot>>,
}

impl DeltaTriples {
    pub fn new() -> DeltaTriples {
        DeltaTriples::default()
    }

    pub fn snapshot(&self) -> Arc<DeltaSnapshot> {
        self.state.read().unwrap().clone()
    }

    pub fn count(&self) -> DeltaTriplesCount {
        self.snapshot().count()
    }

    /// Inserting a triple revokes any earlier deletion of it.
    pub fn insert(&self, triples: &[IdTriple]) {
        self.update(|snapshot| {
            for triple in triples {
                snapshot.deleted.remove(triple);
                snapshot.inserted.insert(*triple);
            }
        });
    }

    /// Deleting a triple revokes any earlier insertion of it.
    pub fn delete(&self, triples: &[IdTriple]) {
        self.update(|snapshot| {
            for triple in triples {
                snapshot.inserted.remove(triple);
                snapshot.deleted.insert(*triple);
            }
        });
    }

    pub fn clear(&self) {
        self.update(|snapshot| *snapshot = DeltaSnapshot::default());
    }

    fn update(&self, apply: impl FnOnce(&mut DeltaSnapshot)) {
        let mut guard = self.state.write().unwrap();
        let mut next = DeltaSnapshot::clone(&guard);
        apply(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn triple(s: u64, p: u64, o: u64) -> IdTriple {
        [
            ValueId::from_vocab_index(s),
            ValueId::from_vocab_index(p),
            ValueId::from_vocab_index(o),
        ]
    }

    #[test]
    fn count_serialises_with_total() {
        let count = DeltaTriplesCount { inserted: 5, deleted: 3 };
        assert_eq!(
            serde_json::to_value(count).unwrap(),
            json!({ "inserted": 5, "deleted": 3, "total": 8 })
        );
    }

    #[test]
    fn count_arithmetic_is_component_wise() {
        let a = DeltaTriplesCount { inserted: 10, deleted: 5 };
        let b = DeltaTriplesCount { inserted: 3, deleted: 2 };
        assert_eq!(a - b, DeltaTriplesCount { inserted: 7, deleted: 3 });
        assert_eq!(b - a, DeltaTriplesCount { inserted: -7, deleted: -3 });
        assert_eq!((a - b).total(), a.total() - b.total());
    }

    #[test]
    fn insert_and_delete_cancel_each_other() {
        let delta = DeltaTriples::new();
        delta.insert(&[triple(1, 2, 3)]);
        assert_eq!(delta.count(), DeltaTriplesCount { inserted: 1, deleted: 0 });
        delta.delete(&[triple(1, 2, 3)]);
        assert_eq!(delta.count(), DeltaTriplesCount { inserted: 0, deleted: 1 });
        delta.insert(&[triple(1, 2, 3)]);
        assert_eq!(delta.count(), DeltaTriplesCount { inserted: 1, deleted: 0 });
    }

    #[test]
    fn snapshots_are_stable_across_updates() {
        let delta = DeltaTriples::new();
        delta.insert(&[triple(1, 2, 3)]);
        let snapshot = delta.snapshot();
        delta.insert(&[triple(4, 5, 6)]);
        assert_eq!(snapshot.count().inserted, 1);
        assert_eq!(delta.count().inserted, 2);
    }

    #[test]
    fn scan_triples_are_permuted_and_sorted() {
        let delta = DeltaTriples::new();
        delta.insert(&[triple(2, 7, 1), triple(1, 7, 2), triple(1, 8, 0)]);
        let snapshot = delta.snapshot();
        let pos = snapshot.triples_for_scan(
            Permutation::Pos,
            Some(ValueId::from_vocab_index(7)),
            None,
            false,
        );
        // Both predicate-7 triples, in (p, o, s) order.
        assert_eq!(
            pos,
            vec![
                Permutation::Pos.apply(triple(2, 7, 1)),
                Permutation::Pos.apply(triple(1, 7, 2)),
            ]
        );
    }
}
