//! Core tabular model, source-log records and value normalizers for Roster.

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod numeric;
pub mod temporal;

pub use numeric::{numbers_equal, parse_number};
pub use temporal::TemporalNormalizer;

pub const CRATE_NAME: &str = "roster-core";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("missing column '{column}' in {table}")]
    MissingColumn { table: String, column: String },
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
}

/// Treats empty strings and the usual dataframe null spellings as "no value".
pub fn is_blank(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || ["nan", "none", "nat", "null"]
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

pub fn parse_timezone(name: &str) -> Result<Tz, CoreError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CoreError::InvalidTimezone(name.to_string()))
}

/// String grid snapshot: one header row plus data rows of equal width.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Trims header names and pads or truncates every row to the header width.
    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
        let width = header.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { header, rows }
    }

    /// Builds a table from a raw grid whose first row is the header.
    pub fn from_grid(mut grid: Vec<Vec<String>>) -> Self {
        if grid.is_empty() {
            return Self::default();
        }
        let header = grid.remove(0);
        Self::new(header, grid)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn require_column(&self, table: &str, name: &str) -> Result<usize, CoreError> {
        self.column_index(name).ok_or_else(|| CoreError::MissingColumn {
            table: table.to_string(),
            column: name.to_string(),
        })
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Names of the source columns that carry a semantic role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleColumns {
    pub key: String,
    pub secondary_key: Option<String>,
    pub agent: String,
    pub tier: String,
    pub inserted_at: String,
    pub activity_type: String,
    pub status: String,
}

impl Default for RoleColumns {
    fn default() -> Self {
        Self {
            key: "Referencia".to_string(),
            secondary_key: Some("Id deuda".to_string()),
            agent: "Negociador".to_string(),
            tier: "Bucket".to_string(),
            inserted_at: "inserted_at_ultima".to_string(),
            activity_type: "Tipo de Actividad".to_string(),
            status: "STATUS".to_string(),
        }
    }
}

/// One validated row of the source log.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Position in the log; doubles as first-seen order.
    pub position: usize,
    pub key: String,
    pub secondary_key: String,
    pub agent_id: String,
    pub tier: u32,
    pub inserted_at: Option<DateTime<Tz>>,
    pub activity_type: String,
    pub status: String,
    pub values: Vec<String>,
}

impl SourceRecord {
    pub fn activity_is(&self, expected: &str) -> bool {
        self.activity_type.trim().eq_ignore_ascii_case(expected.trim())
    }

    pub fn status_is(&self, expected: &str) -> bool {
        self.status.trim().eq_ignore_ascii_case(expected.trim())
    }
}

/// Source table projected onto its role columns.
#[derive(Debug, Clone)]
pub struct SourceLog {
    pub header: Vec<String>,
    pub records: Vec<SourceRecord>,
    /// Rows dropped for a blank key or an unparseable tier.
    pub rejected: usize,
}

impl SourceLog {
    pub const TABLE: &'static str = "source log";

    pub fn from_table(
        table: &Table,
        roles: &RoleColumns,
        normalizer: &TemporalNormalizer,
    ) -> Result<Self, CoreError> {
        let key_idx = table.require_column(Self::TABLE, &roles.key)?;
        let agent_idx = table.require_column(Self::TABLE, &roles.agent)?;
        let tier_idx = table.require_column(Self::TABLE, &roles.tier)?;
        let inserted_idx = table.require_column(Self::TABLE, &roles.inserted_at)?;
        let activity_idx = table.require_column(Self::TABLE, &roles.activity_type)?;
        let status_idx = table.require_column(Self::TABLE, &roles.status)?;
        let secondary_idx = match &roles.secondary_key {
            Some(name) => Some(table.require_column(Self::TABLE, name)?),
            None => None,
        };

        let raw_instants: Vec<&str> = table
            .rows
            .iter()
            .map(|row| row[inserted_idx].as_str())
            .collect();
        let instants = normalizer.parse_column(&raw_instants);

        let mut records = Vec::with_capacity(table.rows.len());
        let mut rejected = 0usize;
        for (position, (row, inserted_at)) in table.rows.iter().zip(instants).enumerate() {
            let key = row[key_idx].trim();
            let Some(tier) = parse_tier(&row[tier_idx]) else {
                rejected += 1;
                continue;
            };
            if key.is_empty() {
                rejected += 1;
                continue;
            }
            records.push(SourceRecord {
                position,
                key: key.to_string(),
                secondary_key: secondary_idx
                    .map(|idx| row[idx].trim().to_string())
                    .unwrap_or_default(),
                agent_id: row[agent_idx].trim().to_string(),
                tier,
                inserted_at,
                activity_type: row[activity_idx].clone(),
                status: row[status_idx].clone(),
                values: row.clone(),
            });
        }

        Ok(Self {
            header: table.header.clone(),
            records,
            rejected,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

/// Tiers are non-negative integers; fractional values truncate toward zero.
pub fn parse_tier(raw: &str) -> Option<u32> {
    let value = parse_number(raw)?;
    if value < 0.0 || value > f64::from(u32::MAX) {
        return None;
    }
    Some(value.trunc() as u32)
}
