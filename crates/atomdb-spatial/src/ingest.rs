//! Batched ingestion.
//!
//! A batch is deduplicated twice: identical items inside the batch collapse
//! to one write carrying their multiplicity, and that write then goes
//! through the store's insert-or-increment like a single put. The whole
//! batch commits in one transaction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use atomdb_core::error::{AtomError, Result};
use atomdb_core::types::{AtomRef, Fingerprint, Modality};
use atomdb_storage::{FingerprintStore, PutEntry};

/// One producer item: raw bytes, a modality tag and optionally a
/// precomputed embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchItem {
    pub content: Vec<u8>,
    pub modality: Modality,
    pub vector: Option<Vec<f32>>,
}

impl BatchItem {
    pub fn new(content: impl Into<Vec<u8>>, modality: Modality) -> Self {
        Self {
            content: content.into(),
            modality,
            vector: None,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }
}

/// Result of a batch put.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Final reference per distinct content.
    pub by_fingerprint: HashMap<Fingerprint, AtomRef>,
    /// One reference per input item, in input order. Repeated content gets
    /// the same id; only its first occurrence can be `is_new`, and
    /// `refcount` counts the references up to and including that item.
    pub items: Vec<AtomRef>,
}

impl BatchOutcome {
    pub fn created(&self) -> usize {
        self.items.iter().filter(|r| r.is_new).count()
    }
}

/// Distinct contents of a batch in first-seen order, with multiplicities.
struct Plan {
    fingerprints: Vec<Fingerprint>,
    unique: Vec<usize>,
    occurrences: Vec<u64>,
    /// Index into `unique` for every input item.
    slot_of: Vec<usize>,
}

fn plan(items: &[BatchItem]) -> Result<Plan> {
    let mut first_seen: HashMap<Fingerprint, usize> = HashMap::new();
    let mut plan = Plan {
        fingerprints: Vec::new(),
        unique: Vec::new(),
        occurrences: Vec::new(),
        slot_of: Vec::with_capacity(items.len()),
    };
    for (i, item) in items.iter().enumerate() {
        let fingerprint = Fingerprint::of(&item.content);
        let slot = match first_seen.get(&fingerprint) {
            Some(&slot) => {
                let first = &items[plan.unique[slot]];
                if first.modality != item.modality {
                    return Err(AtomError::Validation(format!(
                        "item {} repeats content {} with modality {}, first seen as {}",
                        i, fingerprint, item.modality, first.modality
                    )));
                }
                plan.occurrences[slot] += 1;
                slot
            }
            None => {
                let slot = plan.unique.len();
                first_seen.insert(fingerprint, slot);
                plan.fingerprints.push(fingerprint);
                plan.unique.push(i);
                plan.occurrences.push(1);
                slot
            }
        };
        plan.slot_of.push(slot);
    }
    Ok(plan)
}

pub struct BulkIngest<'a> {
    store: &'a FingerprintStore,
}

impl<'a> BulkIngest<'a> {
    pub fn new(store: &'a FingerprintStore) -> Self {
        Self { store }
    }

    /// Put every item's content under `tenant`. Vectors are not touched.
    pub fn put_batch(&self, tenant: &str, items: &[BatchItem]) -> Result<BatchOutcome> {
        if items.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let plan = plan(items)?;
        let entries: Vec<PutEntry<'_>> = plan
            .unique
            .iter()
            .zip(&plan.occurrences)
            .map(|(&i, &occurrences)| PutEntry {
                content: &items[i].content,
                modality: items[i].modality,
                occurrences,
            })
            .collect();

        let refs = self.store.put_many(tenant, &entries)?;

        let mut seen = vec![0u64; refs.len()];
        let items_out = plan
            .slot_of
            .iter()
            .map(|&slot| {
                seen[slot] += 1;
                let last = &refs[slot];
                AtomRef {
                    id: last.id,
                    is_new: last.is_new && seen[slot] == 1,
                    refcount: last.refcount - plan.occurrences[slot] + seen[slot],
                    fingerprint: last.fingerprint,
                }
            })
            .collect();

        debug!(
            tenant,
            items = items.len(),
            unique = refs.len(),
            "Batch ingested"
        );
        Ok(BatchOutcome {
            by_fingerprint: plan.fingerprints.into_iter().zip(refs).collect(),
            items: items_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use atomdb_core::config::StoreConfig;
    use atomdb_storage::Database;

    fn store() -> FingerprintStore {
        let db = Arc::new(Database::in_memory().unwrap());
        FingerprintStore::new(db, &StoreConfig::default())
    }

    fn text(s: &str) -> BatchItem {
        BatchItem::new(s.as_bytes().to_vec(), Modality::Text)
    }

    #[test]
    fn test_duplicates_inside_batch_share_one_atom() {
        let store = store();
        let items = vec![text("a"), text("b"), text("a"), text("a")];
        let outcome = BulkIngest::new(&store).put_batch("t", &items).unwrap();

        assert_eq!(outcome.by_fingerprint.len(), 2);
        assert_eq!(outcome.items.len(), 4);
        assert_eq!(outcome.items[0].id, outcome.items[2].id);
        assert_eq!(outcome.items[0].id, outcome.items[3].id);
        assert_ne!(outcome.items[0].id, outcome.items[1].id);

        let flags: Vec<bool> = outcome.items.iter().map(|r| r.is_new).collect();
        assert_eq!(flags, vec![true, true, false, false]);
        let counts: Vec<u64> = outcome.items.iter().map(|r| r.refcount).collect();
        assert_eq!(counts, vec![1, 1, 2, 3]);
        assert_eq!(outcome.created(), 2);

        let a = &outcome.by_fingerprint[&Fingerprint::of(b"a")];
        assert_eq!(a.refcount, 3);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_batch_dedupes_against_existing_atoms() {
        let store = store();
        let existing = store.put("t", b"a", Modality::Text).unwrap();

        let outcome = BulkIngest::new(&store)
            .put_batch("t", &[text("a"), text("a")])
            .unwrap();
        assert_eq!(outcome.items[0].id, existing.id);
        assert!(!outcome.items[0].is_new);
        assert_eq!(outcome.items[0].refcount, 2);
        assert_eq!(outcome.items[1].refcount, 3);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_overflow_items_in_batch() {
        let store = store();
        let big = vec![9u8; 300];
        let outcome = BulkIngest::new(&store)
            .put_batch("t", &[BatchItem::new(big.clone(), Modality::Binary), text("x")])
            .unwrap();
        assert_eq!(store.get(outcome.items[0].id).unwrap(), big);
    }

    #[test]
    fn test_conflicting_modality_rejected_before_writing() {
        let store = store();
        let items = vec![text("a"), BatchItem::new(b"a".to_vec(), Modality::Code)];
        assert!(BulkIngest::new(&store).put_batch("t", &items).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_empty_batch() {
        let store = store();
        let outcome = BulkIngest::new(&store).put_batch("t", &[]).unwrap();
        assert!(outcome.items.is_empty());
        assert!(outcome.by_fingerprint.is_empty());
    }
}
