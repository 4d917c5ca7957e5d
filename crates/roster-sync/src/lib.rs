//! Run orchestration: loads both tables, applies the reconciliation stages in
//! order and writes back the minimal diff.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use roster_core::{parse_timezone, CoreError, SourceLog, TemporalNormalizer};
use roster_storage::{JsonFileTableStore, TableRef, TabularStore};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod policy;
pub mod quota;
pub mod reconcile;
pub mod retention;
pub mod schema;
pub mod snapshot;
pub mod writeback;

pub use policy::{AdmissionMarker, ReconcilePolicy};
pub use writeback::WritePlan;

use quota::{allocate, build_candidates, compute_quotas, tier_ceiling, ProcessingWindow};
use reconcile::Reconciler;
use retention::{evict_demoted, RetentionSweeper};
use schema::{remap_rows, ColumnProjection};
use snapshot::LatestSnapshots;

pub const CRATE_NAME: &str = "roster-sync";

#[derive(Debug, Clone)]
pub struct RosterConfig {
    pub data_dir: PathBuf,
    pub source: TableRef,
    pub target: TableRef,
    pub timezone: String,
    /// Treat zone-less timestamps already stored in the target as UTC.
    pub assume_target_utc: bool,
    pub policy_path: PathBuf,
}

impl RosterConfig {
    pub fn from_env() -> Self {
        let source_store = std::env::var("ROSTER_SOURCE_STORE").unwrap_or_else(|_| "funnel".to_string());
        let target_store = std::env::var("ROSTER_TARGET_STORE").unwrap_or_else(|_| "bucket".to_string());
        Self {
            data_dir: std::env::var("ROSTER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            source: TableRef::new(
                source_store,
                std::env::var("ROSTER_SOURCE_TABLE").unwrap_or_else(|_| "Funnel".to_string()),
            ),
            target: TableRef::new(
                target_store,
                std::env::var("ROSTER_TARGET_TABLE").unwrap_or_else(|_| "Bucket".to_string()),
            ),
            timezone: std::env::var("ROSTER_TZ").unwrap_or_else(|_| "America/Bogota".to_string()),
            assume_target_utc: std::env::var("ROSTER_ASSUME_TARGET_UTC")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            policy_path: std::env::var("ROSTER_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/roster.yaml")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Evict, refresh, admit and sweep.
    #[default]
    Full,
    /// Refresh and sweep existing rows; no admission or eviction.
    RefreshOnly,
    /// Admit new keys only.
    AdmitOnly,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::RefreshOnly => "refresh_only",
            RunMode::AdmitOnly => "admit_only",
        }
    }

    fn evicts(self) -> bool {
        self == RunMode::Full
    }

    fn refreshes(self) -> bool {
        matches!(self, RunMode::Full | RunMode::RefreshOnly)
    }

    fn admits(self) -> bool {
        matches!(self, RunMode::Full | RunMode::AdmitOnly)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Plan every write but issue none.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// The source log held no usable rows; nothing was read from or written to the target.
    NoSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub dry_run: bool,
    pub outcome: RunOutcome,
    pub source_rows: usize,
    pub source_rejected: usize,
    pub window_rows: usize,
    pub target_rows_before: usize,
    pub target_rows_after: usize,
    pub header_changed: bool,
    pub markers_cleared: usize,
    pub tier_ceiling: Option<u32>,
    pub rows_evicted: usize,
    pub timestamps_canonicalized: usize,
    pub rows_touched: usize,
    pub cells_touched: usize,
    pub rows_cleared: usize,
    pub quotas: BTreeMap<String, u64>,
    pub admitted_per_agent: BTreeMap<String, usize>,
    pub keys_admitted: usize,
    pub rows_admitted: usize,
    pub write_ops: usize,
    pub cells_written: usize,
}

impl SyncRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, options: RunOptions) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            mode: options.mode,
            dry_run: options.dry_run,
            outcome: RunOutcome::Completed,
            source_rows: 0,
            source_rejected: 0,
            window_rows: 0,
            target_rows_before: 0,
            target_rows_after: 0,
            header_changed: false,
            markers_cleared: 0,
            tier_ceiling: None,
            rows_evicted: 0,
            timestamps_canonicalized: 0,
            rows_touched: 0,
            cells_touched: 0,
            rows_cleared: 0,
            quotas: BTreeMap::new(),
            admitted_per_agent: BTreeMap::new(),
            keys_admitted: 0,
            rows_admitted: 0,
            write_ops: 0,
            cells_written: 0,
        }
    }
}

pub struct SyncPipeline {
    store: Arc<dyn TabularStore>,
    config: RosterConfig,
    policy: ReconcilePolicy,
    tz: Tz,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn TabularStore>, config: RosterConfig, policy: ReconcilePolicy) -> Result<Self> {
        let tz = parse_timezone(&config.timezone).context("resolving processing timezone")?;
        policy.validate().context("validating reconcile policy")?;
        Ok(Self {
            store,
            config,
            policy,
            tz,
        })
    }

    pub async fn run_once(&self, options: RunOptions) -> Result<SyncRunSummary> {
        self.run_at(Utc::now(), options).await
    }

    /// Runs with `now` as the processing instant; the window, the current
    /// month and the eviction ceiling all derive from it.
    pub async fn run_at(&self, now: DateTime<Utc>, options: RunOptions) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, mode = options.mode.as_str(), dry_run = options.dry_run);
        self.execute(run_id, now, options).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, now: DateTime<Utc>, options: RunOptions) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::new(run_id, Utc::now(), options);
        let policy = &self.policy;
        let local_now = now.with_timezone(&self.tz);
        let source_norm = TemporalNormalizer::new(self.tz, policy.source_timestamps_utc);
        // Stored values are local once canonicalized; the UTC assumption only
        // governs the one-pass correction of historical cells.
        let stored_norm = TemporalNormalizer::new(self.tz, false);
        let historical_norm = TemporalNormalizer::new(self.tz, self.config.assume_target_utc);

        let source_table = self
            .store
            .read_table(&self.config.source)
            .await
            .with_context(|| format!("reading source table {}", self.config.source))?;
        if source_table.header.is_empty() && source_table.rows.is_empty() {
            info!(table = %self.config.source, "source table is empty; nothing to do");
            summary.outcome = RunOutcome::NoSource;
            summary.finished_at = Utc::now();
            return Ok(summary);
        }
        let log = SourceLog::from_table(&source_table, &policy.roles, &source_norm)
            .with_context(|| format!("validating source table {}", self.config.source))?;
        policy
            .check_source_columns(&log.header)
            .with_context(|| format!("validating source table {}", self.config.source))?;
        summary.source_rows = log.records.len();
        summary.source_rejected = log.rejected;
        if log.is_empty() {
            info!(rejected = log.rejected, "source log has no usable rows; nothing to do");
            summary.outcome = RunOutcome::NoSource;
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let target_table = self
            .store
            .read_table(&self.config.target)
            .await
            .with_context(|| format!("reading target table {}", self.config.target))?;
        let key_column = policy.key_column();
        if !target_table.rows.is_empty() && target_table.column_index(&key_column).is_none() {
            return Err(anyhow::Error::new(CoreError::MissingColumn {
                table: self.config.target.to_string(),
                column: key_column,
            })
            .context("validating target table"));
        }
        summary.target_rows_before = target_table.rows.len();

        let required = policy.required_target_columns();
        let header_plan = policy
            .schema
            .reconcile_header(&target_table.header, &log.header, &required, &[]);
        let header = header_plan.header;
        let baseline = remap_rows(&header_plan.sources, &target_table.rows);
        let mut rows = baseline.clone();
        summary.header_changed = header_plan.changed;

        let key_idx = column_of(&header, &key_column)?;
        let sync_key_idx = column_of(&header, &policy.sync_key_column())?;
        let marker_idx = column_of(&header, &policy.admission_marker.column)?;
        let last_update_idx = column_of(&header, &policy.last_update_column())?;
        let retention_idx = policy
            .retention_columns
            .iter()
            .map(|c| column_of(&header, c))
            .collect::<Result<Vec<_>>>()?;

        summary.markers_cleared = clear_markers(&mut rows, marker_idx);

        let window = ProcessingWindow::new(local_now, policy.carry_over.clone());
        let window_rows = window.select(&log.records, &policy.weights);
        summary.window_rows = window_rows.len();
        let primary = LatestSnapshots::by_primary_key(&log.records);
        let by_sync_key = match policy.roles.secondary_key {
            Some(_) => LatestSnapshots::by_secondary_key(&log.records),
            None => primary.clone(),
        };
        info!(
            source_rows = log.records.len(),
            rejected = log.rejected,
            keys = primary.len(),
            window_rows = window_rows.len(),
            target_rows = rows.len(),
            "loaded tables"
        );

        let existing_keys: HashSet<String> = rows
            .iter()
            .map(|row| row[key_idx].trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();

        if options.mode.evicts() && !rows.is_empty() {
            match tier_ceiling(&window_rows) {
                Some(ceiling) => {
                    let eviction = evict_demoted(&mut rows, key_idx, &primary, ceiling);
                    info!(ceiling, rows = eviction.rows_removed, keys = eviction.keys.len(), "evicted demoted keys");
                    summary.tier_ceiling = Some(ceiling);
                    summary.rows_evicted = eviction.rows_removed;
                }
                None => info!("no activity in window; eviction skipped"),
            }
        }

        let bound = policy.bind_sync_columns(&log.header, &header);
        let reconciler = Reconciler::new(&bound, &source_norm, &stored_norm);
        let sweeper = RetentionSweeper::new(&stored_norm, local_now, last_update_idx, retention_idx);

        if options.mode.refreshes() && !rows.is_empty() {
            summary.timestamps_canonicalized = reconciler.canonicalize_timestamps(&mut rows, &historical_norm);
            let stats = reconciler.reconcile_rows(&mut rows, sync_key_idx, &by_sync_key);
            summary.rows_touched = stats.rows_touched;
            summary.cells_touched = stats.cells_touched;
            summary.rows_cleared = sweeper.sweep(&mut rows);
            info!(
                canonicalized = summary.timestamps_canonicalized,
                rows_touched = stats.rows_touched,
                cells_touched = stats.cells_touched,
                rows_cleared = summary.rows_cleared,
                "refreshed existing rows"
            );
        }

        let mut admitted: Vec<Vec<String>> = Vec::new();
        if options.mode.admits() {
            if window_rows.is_empty() {
                info!("no activity in window; admission skipped");
            } else {
                let quotas = compute_quotas(&window_rows, &policy.weights);
                let candidates = build_candidates(&log.records, &existing_keys);
                let allocation = allocate(&quotas, &candidates, policy.max_admission_tier);
                let selected: HashSet<&str> = allocation.selected.iter().map(String::as_str).collect();
                let projection = ColumnProjection::new(&policy.schema, &log.header, &header);
                admitted = log
                    .records
                    .iter()
                    .filter(|record| selected.contains(record.key.as_str()))
                    .map(|record| {
                        let mut row = projection.project(&record.values);
                        row[marker_idx] = policy.admission_marker.value.clone();
                        row
                    })
                    .collect();

                // Admitted rows carry raw source timestamps.
                reconciler.canonicalize_timestamps(&mut admitted, &source_norm);
                let stats = reconciler.reconcile_rows(&mut admitted, sync_key_idx, &by_sync_key);
                summary.cells_touched += stats.cells_touched;
                summary.rows_cleared += sweeper.sweep(&mut admitted);

                info!(
                    candidates = candidates.len(),
                    keys = allocation.selected.len(),
                    rows = admitted.len(),
                    "admitted new keys"
                );
                summary.keys_admitted = allocation.selected.len();
                summary.rows_admitted = admitted.len();
                summary.quotas = quotas;
                summary.admitted_per_agent = allocation.per_agent;
            }
        }

        let rewrite_body = header_plan.layout_changed || summary.rows_evicted > 0;
        let plan = WritePlan::build(&header, header_plan.changed, &baseline, &rows, rewrite_body, &admitted);
        summary.write_ops = plan.ops.len();
        summary.cells_written = plan.cells_changed;
        summary.target_rows_after = rows.len() + admitted.len();

        if options.dry_run {
            info!(ops = plan.ops.len(), cells = plan.cells_changed, "dry run; writes skipped");
        } else if plan.is_empty() {
            info!("target already up to date");
        } else {
            plan.execute(self.store.as_ref(), &self.config.target).await?;
            info!(ops = plan.ops.len(), cells = plan.cells_changed, "wrote target table");
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }
}

fn column_of(header: &[String], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| anyhow!("column '{name}' missing after header reconciliation"))
}

fn clear_markers(rows: &mut [Vec<String>], marker_idx: usize) -> usize {
    let mut cleared = 0usize;
    for row in rows.iter_mut() {
        if !row[marker_idx].is_empty() {
            row[marker_idx].clear();
            cleared += 1;
        }
    }
    cleared
}

/// One full run against the JSON-file store described by the environment.
pub async fn run_sync_once(config: RosterConfig, options: RunOptions) -> Result<SyncRunSummary> {
    let policy = ReconcilePolicy::load(&config.policy_path)?;
    let store = Arc::new(JsonFileTableStore::new(config.data_dir.clone()));
    let pipeline = SyncPipeline::new(store, config, policy)?;
    pipeline.run_once(options).await
}

pub async fn run_sync_once_from_env(options: RunOptions) -> Result<SyncRunSummary> {
    run_sync_once(RosterConfig::from_env(), options).await
}
