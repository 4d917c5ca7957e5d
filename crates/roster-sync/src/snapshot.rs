//! Latest-row-per-key index over the source log.

use std::collections::HashMap;

use roster_core::SourceRecord;

/// Immutable map from a key to its most recent source record.
///
/// "Most recent" orders by `inserted_at` (unparseable instants first), then by
/// log position, so the later of two rows with equal timestamps wins.
#[derive(Debug, Clone, Default)]
pub struct LatestSnapshots<'a> {
    by_key: HashMap<&'a str, &'a SourceRecord>,
}

impl<'a> LatestSnapshots<'a> {
    pub fn build(records: &'a [SourceRecord], key_of: impl Fn(&'a SourceRecord) -> &'a str) -> Self {
        let mut by_key: HashMap<&'a str, &'a SourceRecord> = HashMap::new();
        for record in records {
            let key = key_of(record);
            if key.is_empty() {
                continue;
            }
            by_key
                .entry(key)
                .and_modify(|current| {
                    if (&record.inserted_at, record.position) >= (&current.inserted_at, current.position) {
                        *current = record;
                    }
                })
                .or_insert(record);
        }
        Self { by_key }
    }

    pub fn by_primary_key(records: &'a [SourceRecord]) -> Self {
        Self::build(records, |r| r.key.as_str())
    }

    pub fn by_secondary_key(records: &'a [SourceRecord]) -> Self {
        Self::build(records, |r| r.secondary_key.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&'a SourceRecord> {
        self.by_key.get(key.trim()).copied()
    }

    pub fn latest_tier(&self, key: &str) -> Option<u32> {
        self.get(key).map(|record| record.tier)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
