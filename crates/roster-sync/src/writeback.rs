//! Turns the in-memory target frame into a minimal set of store writes.

use anyhow::{Context, Result};
use roster_storage::{TableRef, TabularStore, WriteOp};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WritePlan {
    pub ops: Vec<WriteOp>,
    /// Cells whose final value differs from the loaded snapshot, plus appended cells.
    pub cells_changed: usize,
}

impl WritePlan {
    /// `baseline` is the loaded body already laid out under `header`; it must
    /// have as many rows as `rows` unless `rewrite_body` is set.
    pub fn build(
        header: &[String],
        header_changed: bool,
        baseline: &[Vec<String>],
        rows: &[Vec<String>],
        rewrite_body: bool,
        appended: &[Vec<String>],
    ) -> Self {
        let mut plan = WritePlan::default();
        if header_changed {
            plan.ops.push(WriteOp::Header(header.to_vec()));
        }

        if rewrite_body || baseline.len() != rows.len() {
            plan.cells_changed += count_changed_cells(baseline, rows);
            plan.ops.push(WriteOp::Body {
                from_row: 0,
                rows: rows.to_vec(),
            });
        } else {
            for column in 0..header.len() {
                let changed: Vec<usize> = (0..rows.len())
                    .filter(|&i| cell(baseline, i, column) != cell(rows, i, column))
                    .collect();
                let (Some(&first), Some(&last)) = (changed.first(), changed.last()) else {
                    continue;
                };
                plan.cells_changed += changed.len();
                plan.ops.push(WriteOp::Range {
                    first_row: first,
                    last_row: last,
                    column,
                    values: (first..=last).map(|i| cell(rows, i, column).to_string()).collect(),
                });
            }
        }

        if !appended.is_empty() {
            plan.cells_changed += appended.iter().map(Vec::len).sum::<usize>();
            plan.ops.push(WriteOp::Append(appended.to_vec()));
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Issues the writes in order. The first failure aborts the run; later
    /// operations are not attempted.
    pub async fn execute(&self, store: &dyn TabularStore, table: &TableRef) -> Result<()> {
        for op in &self.ops {
            match op {
                WriteOp::Header(header) => store
                    .write_header(table, header)
                    .await
                    .with_context(|| format!("writing header of {table}"))?,
                WriteOp::Range {
                    first_row,
                    last_row,
                    column,
                    values,
                } => store
                    .write_range(table, *first_row, *last_row, *column, values)
                    .await
                    .with_context(|| format!("writing column {column} rows {first_row}..={last_row} of {table}"))?,
                WriteOp::Body { from_row, rows } => store
                    .write_body(table, *from_row, rows)
                    .await
                    .with_context(|| format!("rewriting body of {table}"))?,
                WriteOp::Append(rows) => store
                    .append_rows(table, rows)
                    .await
                    .with_context(|| format!("appending {} rows to {table}", rows.len()))?,
            }
        }
        Ok(())
    }
}

fn cell(rows: &[Vec<String>], row: usize, column: usize) -> &str {
    rows.get(row)
        .and_then(|r| r.get(column))
        .map(String::as_str)
        .unwrap_or("")
}

fn count_changed_cells(baseline: &[Vec<String>], rows: &[Vec<String>]) -> usize {
    let width = rows
        .iter()
        .chain(baseline)
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    (0..rows.len().max(baseline.len()))
        .map(|i| {
            (0..width)
                .filter(|&j| cell(baseline, i, j) != cell(rows, i, j))
                .count()
        })
        .sum()
}
