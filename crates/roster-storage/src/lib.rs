//! Tabular store collaborator contract plus in-memory and JSON-file backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use roster_core::Table;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-storage";

/// Address of one table inside a store (spreadsheet id + tab name, file dir + file, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub store_id: String,
    pub table_name: String,
}

impl TableRef {
    pub fn new(store_id: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            table_name: table_name.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.store_id, self.table_name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid table document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("rows {first}..={last} out of range for {table} ({rows} data rows)")]
    RowOutOfRange {
        table: String,
        first: usize,
        last: usize,
        rows: usize,
    },
    #[error("column {column} out of range for {table} ({width} columns)")]
    ColumnOutOfRange {
        table: String,
        column: usize,
        width: usize,
    },
    #[error("expected {expected} values for {table}, got {actual}")]
    LengthMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },
}

/// String-typed table service. Row indices are 0-based data rows (the header
/// is not counted); ranges are inclusive.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn read_table(&self, table: &TableRef) -> Result<Table, StoreError>;

    async fn write_header(&self, table: &TableRef, header: &[String]) -> Result<(), StoreError>;

    async fn write_range(
        &self,
        table: &TableRef,
        first_row: usize,
        last_row: usize,
        column: usize,
        values: &[String],
    ) -> Result<(), StoreError>;

    /// Replaces every data row at and after `from_row`.
    async fn write_body(
        &self,
        table: &TableRef,
        from_row: usize,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError>;

    async fn append_rows(&self, table: &TableRef, rows: &[Vec<String>]) -> Result<(), StoreError>;
}

/// One mutation, as issued by a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Header(Vec<String>),
    Range {
        first_row: usize,
        last_row: usize,
        column: usize,
        values: Vec<String>,
    },
    Body {
        from_row: usize,
        rows: Vec<Vec<String>>,
    },
    Append(Vec<Vec<String>>),
}

impl WriteOp {
    /// Number of cells the operation overwrites or adds.
    pub fn cell_count(&self) -> usize {
        match self {
            WriteOp::Header(header) => header.len(),
            WriteOp::Range { values, .. } => values.len(),
            WriteOp::Body { rows, .. } | WriteOp::Append(rows) => rows.iter().map(Vec::len).sum(),
        }
    }

    /// Applies the operation to a raw (unpadded) table document.
    pub fn apply(&self, name: &str, doc: &mut Table) -> Result<(), StoreError> {
        match self {
            WriteOp::Header(header) => {
                doc.header = header.clone();
            }
            WriteOp::Range {
                first_row,
                last_row,
                column,
                values,
            } => {
                if first_row > last_row || *last_row >= doc.rows.len() {
                    return Err(StoreError::RowOutOfRange {
                        table: name.to_string(),
                        first: *first_row,
                        last: *last_row,
                        rows: doc.rows.len(),
                    });
                }
                if *column >= doc.header.len() {
                    return Err(StoreError::ColumnOutOfRange {
                        table: name.to_string(),
                        column: *column,
                        width: doc.header.len(),
                    });
                }
                let expected = last_row - first_row + 1;
                if values.len() != expected {
                    return Err(StoreError::LengthMismatch {
                        table: name.to_string(),
                        expected,
                        actual: values.len(),
                    });
                }
                for (row, value) in doc.rows[*first_row..=*last_row].iter_mut().zip(values) {
                    if row.len() <= *column {
                        row.resize(column + 1, String::new());
                    }
                    row[*column] = value.clone();
                }
            }
            WriteOp::Body { from_row, rows } => {
                if *from_row > doc.rows.len() {
                    return Err(StoreError::RowOutOfRange {
                        table: name.to_string(),
                        first: *from_row,
                        last: *from_row,
                        rows: doc.rows.len(),
                    });
                }
                doc.rows.truncate(*from_row);
                doc.rows.extend(rows.iter().cloned());
            }
            WriteOp::Append(rows) => {
                doc.rows.extend(rows.iter().cloned());
            }
        }
        Ok(())
    }
}

/// Process-local store; keeps a journal of every write for inspection.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<TableRef, Table>>,
    journal: Mutex<Vec<(TableRef, WriteOp)>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, table: TableRef, contents: Table) {
        self.tables.lock().await.insert(table, contents);
    }

    pub async fn snapshot(&self, table: &TableRef) -> Option<Table> {
        self.tables.lock().await.get(table).cloned()
    }

    pub async fn journal(&self) -> Vec<(TableRef, WriteOp)> {
        self.journal.lock().await.clone()
    }

    pub async fn clear_journal(&self) {
        self.journal.lock().await.clear();
    }

    async fn apply(&self, table: &TableRef, op: WriteOp) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let doc = tables.entry(table.clone()).or_default();
        op.apply(&table.to_string(), doc)?;
        self.journal.lock().await.push((table.clone(), op));
        Ok(())
    }
}

#[async_trait]
impl TabularStore for MemoryTableStore {
    async fn read_table(&self, table: &TableRef) -> Result<Table, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|doc| Table::new(doc.header.clone(), doc.rows.clone()))
            .unwrap_or_default())
    }

    async fn write_header(&self, table: &TableRef, header: &[String]) -> Result<(), StoreError> {
        self.apply(table, WriteOp::Header(header.to_vec())).await
    }

    async fn write_range(
        &self,
        table: &TableRef,
        first_row: usize,
        last_row: usize,
        column: usize,
        values: &[String],
    ) -> Result<(), StoreError> {
        self.apply(
            table,
            WriteOp::Range {
                first_row,
                last_row,
                column,
                values: values.to_vec(),
            },
        )
        .await
    }

    async fn write_body(
        &self,
        table: &TableRef,
        from_row: usize,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError> {
        self.apply(
            table,
            WriteOp::Body {
                from_row,
                rows: rows.to_vec(),
            },
        )
        .await
    }

    async fn append_rows(&self, table: &TableRef, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.apply(table, WriteOp::Append(rows.to_vec())).await
    }
}

/// Stores each table as `<root>/<store_id>/<table_name>.json`.
///
/// Every write is a read-modify-write that lands through a temp file and an
/// atomic rename, so readers never observe a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileTableStore {
    root: PathBuf,
}

impl JsonFileTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(sanitize_segment(&table.store_id))
            .join(format!("{}.json", sanitize_segment(&table.table_name)))
    }

    /// Content digest of the stored document, `None` when the table does not exist.
    pub async fn digest(&self, table: &TableRef) -> Result<Option<String>, StoreError> {
        let path = self.table_path(table);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Self::sha256_hex(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn load_document(&self, path: &Path) -> Result<Table, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Table::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn store_document(&self, path: &Path, doc: &Table) -> Result<(), StoreError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| StoreError::Io { path, source }
        };
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }

    async fn apply(&self, table: &TableRef, op: WriteOp) -> Result<(), StoreError> {
        let path = self.table_path(table);
        let mut doc = self.load_document(&path).await?;
        op.apply(&table.to_string(), &mut doc)?;
        self.store_document(&path, &doc).await?;
        debug!(table = %table, cells = op.cell_count(), path = %path.display(), "table write applied");
        Ok(())
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

#[async_trait]
impl TabularStore for JsonFileTableStore {
    async fn read_table(&self, table: &TableRef) -> Result<Table, StoreError> {
        let doc = self.load_document(&self.table_path(table)).await?;
        Ok(Table::new(doc.header, doc.rows))
    }

    async fn write_header(&self, table: &TableRef, header: &[String]) -> Result<(), StoreError> {
        self.apply(table, WriteOp::Header(header.to_vec())).await
    }

    async fn write_range(
        &self,
        table: &TableRef,
        first_row: usize,
        last_row: usize,
        column: usize,
        values: &[String],
    ) -> Result<(), StoreError> {
        self.apply(
            table,
            WriteOp::Range {
                first_row,
                last_row,
                column,
                values: values.to_vec(),
            },
        )
        .await
    }

    async fn write_body(
        &self,
        table: &TableRef,
        from_row: usize,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError> {
        self.apply(
            table,
            WriteOp::Body {
                from_row,
                rows: rows.to_vec(),
            },
        )
        .await
    }

    async fn append_rows(&self, table: &TableRef, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.apply(table, WriteOp::Append(rows.to_vec())).await
    }
}
