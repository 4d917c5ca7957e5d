//! Monthly retention clearing and tier-demotion eviction.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike};
use chrono_tz::Tz;
use roster_core::TemporalNormalizer;

use crate::snapshot::LatestSnapshots;

/// Blanks transient columns on rows last updated outside the current month.
pub struct RetentionSweeper<'a> {
    normalizer: &'a TemporalNormalizer,
    last_update_idx: usize,
    cleared_idx: Vec<usize>,
    year: i32,
    month: u32,
}

impl<'a> RetentionSweeper<'a> {
    pub fn new(
        normalizer: &'a TemporalNormalizer,
        now: DateTime<Tz>,
        last_update_idx: usize,
        cleared_idx: Vec<usize>,
    ) -> Self {
        Self {
            normalizer,
            last_update_idx,
            cleared_idx,
            year: now.year(),
            month: now.month(),
        }
    }

    pub fn is_stale(&self, row: &[String]) -> bool {
        row.get(self.last_update_idx)
            .and_then(|raw| self.normalizer.parse(raw))
            .is_some_and(|dt| (dt.year(), dt.month()) != (self.year, self.month))
    }

    /// Returns the number of rows that had at least one cell cleared.
    pub fn sweep(&self, rows: &mut [Vec<String>]) -> usize {
        let mut cleared_rows = 0usize;
        for row in rows.iter_mut() {
            if !self.is_stale(row) {
                continue;
            }
            let mut changed = false;
            for &idx in &self.cleared_idx {
                if let Some(cell) = row.get_mut(idx) {
                    if !cell.is_empty() {
                        cell.clear();
                        changed = true;
                    }
                }
            }
            if changed {
                cleared_rows += 1;
            }
        }
        cleared_rows
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
    pub rows_removed: usize,
    pub keys: BTreeSet<String>,
}

/// Drops rows whose key's latest tier is strictly above `ceiling`. Rows whose
/// key has no snapshot are kept.
pub fn evict_demoted(
    rows: &mut Vec<Vec<String>>,
    key_idx: usize,
    snapshots: &LatestSnapshots<'_>,
    ceiling: u32,
) -> Eviction {
    let mut eviction = Eviction::default();
    rows.retain(|row| {
        let key = row[key_idx].trim();
        match snapshots.latest_tier(key) {
            Some(tier) if tier > ceiling => {
                eviction.rows_removed += 1;
                eviction.keys.insert(key.to_string());
                false
            }
            _ => true,
        }
    });
    eviction
}
