use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::domain::{Dataset, IdentityKey, Record};
use crate::observability::metrics;

/// Survivors of a dedup pass plus the number of records removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub records: Vec<Record>,
    /// Duplicates collapsed inside the batch.
    pub dropped_in_batch: usize,
    /// Records whose identity is already committed in another partition.
    pub dropped_existing: usize,
}

impl DedupOutcome {
    pub fn dropped(&self) -> usize {
        self.dropped_in_batch + self.dropped_existing
    }

    pub fn identities(&self, dataset: &Dataset) -> Vec<IdentityKey> {
        self.records
            .iter()
            .map(|r| r.identity(&dataset.identity_key))
            .collect()
    }
}

/// Collapses records sharing an identity key to exactly one survivor.
///
/// Identity is the dataset's declared key, or the whole record when no key is
/// declared. Among duplicates the later arrival wins; when a tie-break field is
/// declared the highest value of it wins instead, and arrival order only
/// settles equal tie-break values. Survivors keep the arrival position of the
/// winning record.
pub struct Deduplicator;

impl Deduplicator {
    pub fn dedup(dataset: &Dataset, records: Vec<Record>, existing_keys: &HashSet<IdentityKey>) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();
        // identity -> index of the current winner in `slots`
        let mut winners: HashMap<IdentityKey, usize> = HashMap::new();
        let mut slots: Vec<Option<Record>> = Vec::with_capacity(records.len());

        for record in records {
            let key = record.identity(&dataset.identity_key);
            if existing_keys.contains(&key) {
                outcome.dropped_existing += 1;
                continue;
            }
            match winners.get(&key).copied() {
                None => {
                    winners.insert(key, slots.len());
                    slots.push(Some(record));
                }
                Some(current) => {
                    outcome.dropped_in_batch += 1;
                    let incumbent = slots[current].as_ref();
                    if incumbent.map_or(true, |inc| Self::challenger_wins(dataset, inc, &record)) {
                        slots[current] = None;
                        winners.insert(key, slots.len());
                        slots.push(Some(record));
                    }
                }
            }
        }

        outcome.records = slots.into_iter().flatten().collect();
        if outcome.dropped() > 0 {
            debug!(
                "{}: dropped {} in-batch and {} already-committed duplicates",
                dataset.name, outcome.dropped_in_batch, outcome.dropped_existing
            );
            metrics::dedup::records_dropped(&dataset.name, outcome.dropped());
        }
        outcome
    }

    /// A later record replaces the incumbent unless the tie-break says the incumbent is higher.
    fn challenger_wins(dataset: &Dataset, incumbent: &Record, challenger: &Record) -> bool {
        match &dataset.tie_break {
            None => true,
            Some(field) => {
                let ordering = challenger
                    .get_or_null(field)
                    .total_cmp(incumbent.get_or_null(field));
                ordering != Ordering::Less
            }
        }
    }
}
