//! Cell-level diff of target rows against the latest source snapshot.

use roster_core::{is_blank, numbers_equal, parse_number, TemporalNormalizer};
use serde::{Deserialize, Serialize};

use crate::snapshot::LatestSnapshots;

/// Equality rule applied when diffing a synchronized column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[default]
    Text,
    Numeric,
    Timestamp,
}

/// A source column whose latest value is pushed into the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncColumn {
    /// Source-side name; the target name comes from the rename map.
    pub source: String,
    #[serde(default)]
    pub kind: ColumnKind,
    /// Fail the run when the source lacks this column.
    #[serde(default)]
    pub required: bool,
}

impl SyncColumn {
    pub fn new(source: &str, kind: ColumnKind) -> Self {
        Self {
            source: source.to_string(),
            kind,
            required: false,
        }
    }
}

/// A sync column resolved against the live source and target headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub source_idx: usize,
    pub target_idx: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub rows_touched: usize,
    pub cells_touched: usize,
}

pub struct Reconciler<'a> {
    columns: &'a [BoundColumn],
    source: &'a TemporalNormalizer,
    target: &'a TemporalNormalizer,
}

impl<'a> Reconciler<'a> {
    /// `source` reads log timestamps, `target` reads values already stored in
    /// the working set. Stored values are local wall-clock time once
    /// canonicalized, so `target` should treat naive values as local.
    pub fn new(
        columns: &'a [BoundColumn],
        source: &'a TemporalNormalizer,
        target: &'a TemporalNormalizer,
    ) -> Self {
        Self {
            columns,
            source,
            target,
        }
    }

    /// The value to write, or `None` to keep the current cell.
    pub fn merge_cell(&self, kind: ColumnKind, current: &str, incoming: &str) -> Option<String> {
        match kind {
            ColumnKind::Text => {
                if is_blank(incoming) || current.trim() == incoming.trim() {
                    None
                } else {
                    Some(incoming.to_string())
                }
            }
            ColumnKind::Numeric => {
                parse_number(incoming)?;
                if numbers_equal(current, incoming) {
                    None
                } else {
                    Some(incoming.to_string())
                }
            }
            ColumnKind::Timestamp => {
                let incoming = self.source.canonical(incoming)?;
                match self.target.canonical(current) {
                    Some(existing) if existing == incoming => None,
                    _ => Some(incoming),
                }
            }
        }
    }

    /// Rewrites timestamp cells into canonical local form, reading them with
    /// `reader`. Cells that do not parse are left as they are.
    pub fn canonicalize_timestamps(&self, rows: &mut [Vec<String>], reader: &TemporalNormalizer) -> usize {
        let mut rewritten = 0usize;
        for column in self.columns.iter().filter(|c| c.kind == ColumnKind::Timestamp) {
            for row in rows.iter_mut() {
                let cell = &mut row[column.target_idx];
                if let Some(canonical) = reader.canonical(cell) {
                    if *cell != canonical {
                        *cell = canonical;
                        rewritten += 1;
                    }
                }
            }
        }
        rewritten
    }

    /// Diffs every row whose sync key has a snapshot. Blank source values never
    /// overwrite; the returned counts are informational.
    pub fn reconcile_rows(
        &self,
        rows: &mut [Vec<String>],
        sync_key_idx: usize,
        snapshots: &LatestSnapshots<'_>,
    ) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        for row in rows.iter_mut() {
            let Some(latest) = snapshots.get(&row[sync_key_idx]) else {
                continue;
            };
            let mut touched = 0usize;
            for column in self.columns {
                let incoming = latest
                    .values
                    .get(column.source_idx)
                    .map(String::as_str)
                    .unwrap_or("");
                if let Some(value) = self.merge_cell(column.kind, &row[column.target_idx], incoming) {
                    row[column.target_idx] = value;
                    touched += 1;
                }
            }
            if touched > 0 {
                stats.rows_touched += 1;
                stats.cells_touched += touched;
            }
        }
        stats
    }
}
