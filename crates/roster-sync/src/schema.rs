//! Target header reconciliation: renames, required columns, preferred order.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRule {
    pub from: String,
    pub to: String,
}

/// Declarative source→target schema migration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ColumnMapping {
    /// Applied in order; the first rule matching a source column wins.
    pub renames: Vec<RenameRule>,
    pub preferred_order: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPlan {
    pub header: Vec<String>,
    /// For every column of `header`, the stored position that feeds it.
    pub sources: Vec<Option<usize>>,
    /// The header differs from the stored one and must be written.
    pub changed: bool,
    /// A stored column moved position, so existing rows must be rewritten.
    pub layout_changed: bool,
}

impl ColumnMapping {
    pub fn target_name<'a>(&'a self, source: &'a str) -> &'a str {
        self.renames
            .iter()
            .find(|rule| rule.from == source)
            .map(|rule| rule.to.as_str())
            .unwrap_or(source)
    }

    pub fn rename_all(&self, source_columns: &[String]) -> Vec<String> {
        source_columns
            .iter()
            .map(|c| self.target_name(c).to_string())
            .collect()
    }

    /// Computes the target header from the stored header, the source columns
    /// (pre-rename), the columns downstream consumers require and any columns
    /// that only exist in the in-memory rows.
    ///
    /// Every stored position survives. The first stored column of each name
    /// takes part in the preferred ordering; blank and repeated stored columns
    /// keep their cells and follow in stored order.
    pub fn reconcile_header(
        &self,
        current: &[String],
        source_columns: &[String],
        required: &[String],
        live_columns: &[String],
    ) -> HeaderPlan {
        let mut named: Vec<(String, usize)> = Vec::with_capacity(current.len());
        let mut extra: Vec<usize> = Vec::new();
        for (idx, column) in current.iter().enumerate() {
            let name = column.trim();
            if name.is_empty() || named.iter().any(|(n, _)| n == name) {
                extra.push(idx);
            } else {
                named.push((name.to_string(), idx));
            }
        }

        let mut added: Vec<String> = Vec::new();
        for column in self.rename_all(source_columns).iter().chain(required) {
            let name = column.trim();
            if !name.is_empty()
                && !named.iter().any(|(n, _)| n == name)
                && !added.iter().any(|a| a == name)
            {
                added.push(name.to_string());
            }
        }

        let stored_idx = |name: &str| named.iter().find(|(n, _)| n == name).map(|(_, idx)| *idx);
        let mut header: Vec<String> = Vec::with_capacity(current.len() + added.len());
        let mut sources: Vec<Option<usize>> = Vec::with_capacity(header.capacity());
        for column in &self.preferred_order {
            if header.contains(column) {
                continue;
            }
            if let Some(idx) = stored_idx(column) {
                header.push(column.clone());
                sources.push(Some(idx));
            } else if added.contains(column) {
                header.push(column.clone());
                sources.push(None);
            }
        }
        for (idx, column) in current.iter().enumerate() {
            if sources.contains(&Some(idx)) {
                continue;
            }
            let column = if extra.contains(&idx) {
                column.clone()
            } else {
                column.trim().to_string()
            };
            header.push(column);
            sources.push(Some(idx));
        }
        for column in added.into_iter().chain(live_columns.iter().map(|c| c.trim().to_string())) {
            if !column.is_empty() && !header.contains(&column) {
                header.push(column);
                sources.push(None);
            }
        }

        let changed = header.as_slice() != current;
        let layout_changed = sources
            .iter()
            .take(current.len())
            .enumerate()
            .any(|(idx, source)| *source != Some(idx));
        HeaderPlan {
            header,
            sources,
            changed,
            layout_changed,
        }
    }
}

/// For every target column, the source column that feeds it on admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProjection {
    sources: Vec<Option<usize>>,
}

impl ColumnProjection {
    pub fn new(mapping: &ColumnMapping, source_header: &[String], target_header: &[String]) -> Self {
        let renamed = mapping.rename_all(source_header);
        let sources = target_header
            .iter()
            .map(|target| {
                if target.trim().is_empty() {
                    None
                } else {
                    renamed.iter().position(|r| r == target)
                }
            })
            .collect();
        Self { sources }
    }

    pub fn project(&self, values: &[String]) -> Vec<String> {
        self.sources
            .iter()
            .map(|idx| {
                idx.and_then(|i| values.get(i))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Re-lays stored rows out under a new header; `sources` holds the stored
/// position of each output column.
pub fn remap_rows(sources: &[Option<usize>], rows: &[Vec<String>]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| {
            sources
                .iter()
                .map(|pos| pos.and_then(|p| row.get(p)).cloned().unwrap_or_default())
                .collect()
        })
        .collect()
}
