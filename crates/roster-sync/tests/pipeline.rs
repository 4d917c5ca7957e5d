use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use roster_core::{RoleColumns, Table};
use roster_storage::{JsonFileTableStore, MemoryTableStore, TableRef, TabularStore, WriteOp};
use roster_sync::quota::WeightPolicy;
use roster_sync::reconcile::{ColumnKind, SyncColumn};
use roster_sync::schema::{ColumnMapping, RenameRule};
use roster_sync::{
    AdmissionMarker, ReconcilePolicy, RosterConfig, RunMode, RunOptions, RunOutcome, SyncPipeline,
    SyncRunSummary,
};

const SOURCE_HEADER: [&str; 8] = ["ref", "agent", "tier", "seen", "activity", "status", "note", "amount"];
const TARGET_HEADER: [&str; 9] = [
    "ref",
    "agent",
    "tier",
    "Last Update",
    "activity",
    "status",
    "note",
    "amount",
    "New",
];

fn s(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// 2026-10-19 12:00 in Bogota.
fn now() -> DateTime<Utc> {
    "2026-10-19T17:00:00Z".parse().expect("now")
}

fn source_table() -> TableRef {
    TableRef::new("mem", "Funnel")
}

fn target_table() -> TableRef {
    TableRef::new("mem", "Bucket")
}

fn config() -> RosterConfig {
    RosterConfig {
        data_dir: ".".into(),
        source: source_table(),
        target: target_table(),
        timezone: "America/Bogota".to_string(),
        assume_target_utc: false,
        policy_path: "unused.yaml".into(),
    }
}

fn policy() -> ReconcilePolicy {
    ReconcilePolicy {
        roles: RoleColumns {
            key: "ref".to_string(),
            secondary_key: None,
            agent: "agent".to_string(),
            tier: "tier".to_string(),
            inserted_at: "seen".to_string(),
            activity_type: "activity".to_string(),
            status: "status".to_string(),
        },
        admission_marker: AdmissionMarker {
            column: "New".to_string(),
            value: "yes".to_string(),
        },
        weights: WeightPolicy::default(),
        carry_over: None,
        max_admission_tier: Some(5),
        schema: ColumnMapping {
            renames: vec![RenameRule {
                from: "seen".to_string(),
                to: "Last Update".to_string(),
            }],
            preferred_order: s(&["ref", "agent", "tier"]),
        },
        sync_columns: vec![
            SyncColumn::new("note", ColumnKind::Text),
            SyncColumn {
                source: "amount".to_string(),
                kind: ColumnKind::Numeric,
                required: true,
            },
            SyncColumn::new("seen", ColumnKind::Timestamp),
        ],
        retention_columns: s(&["note"]),
        source_timestamps_utc: false,
    }
}

/// ref, agent, tier, seen, activity, note, amount (status left blank).
fn src(key: &str, agent: &str, tier: &str, seen: &str, activity: &str, note: &str, amount: &str) -> Vec<String> {
    s(&[key, agent, tier, seen, activity, "", note, amount])
}

/// ref, agent, tier, last update, note, amount (activity, status and marker blank).
fn tgt(key: &str, agent: &str, tier: &str, updated: &str, note: &str, amount: &str) -> Vec<String> {
    s(&[key, agent, tier, updated, "", "", note, amount, ""])
}

struct Harness {
    store: Arc<MemoryTableStore>,
    pipeline: SyncPipeline,
}

impl Harness {
    async fn new(source_rows: Vec<Vec<String>>, target_rows: Option<Vec<Vec<String>>>) -> Self {
        Self::with_policy(policy(), s(&SOURCE_HEADER), source_rows, target_rows).await
    }

    async fn with_policy(
        policy: ReconcilePolicy,
        source_header: Vec<String>,
        source_rows: Vec<Vec<String>>,
        target_rows: Option<Vec<Vec<String>>>,
    ) -> Self {
        let store = Arc::new(MemoryTableStore::new());
        store.insert(source_table(), Table::new(source_header, source_rows)).await;
        if let Some(rows) = target_rows {
            store.insert(target_table(), Table::new(s(&TARGET_HEADER), rows)).await;
        }
        let pipeline = SyncPipeline::new(store.clone(), config(), policy).expect("pipeline");
        Self { store, pipeline }
    }

    async fn run(&self, mode: RunMode) -> SyncRunSummary {
        self.run_with(RunOptions { mode, dry_run: false }).await
    }

    async fn run_with(&self, options: RunOptions) -> SyncRunSummary {
        self.pipeline.run_at(now(), options).await.expect("run")
    }

    async fn target(&self) -> Table {
        self.store.snapshot(&target_table()).await.expect("target table")
    }

    async fn writes(&self) -> Vec<WriteOp> {
        self.store.journal().await.into_iter().map(|(_, op)| op).collect()
    }
}

fn keys(table: &Table) -> Vec<String> {
    table.rows.iter().map(|row| row[0].clone()).collect()
}

#[tokio::test]
async fn lowest_tiers_are_admitted_within_quota() {
    let h = Harness::new(
        vec![
            src("A", "X", "0", "2026-10-19 08:00:00", "EFECTIVA", "a", "10"),
            src("B", "X", "1", "2026-10-19 09:00:00", "EFECTIVA", "b", "20"),
            src("C", "Y", "2", "2026-10-18 09:00:00", "", "c", "30"),
        ],
        None,
    )
    .await;

    let summary = h.run(RunMode::Full).await;
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.quotas.get("X"), Some(&4));
    assert_eq!(summary.quotas.get("Y"), None);
    assert_eq!(summary.keys_admitted, 2);
    assert_eq!(summary.rows_admitted, 2);

    let target = h.target().await;
    assert_eq!(target.header, s(&TARGET_HEADER));
    assert_eq!(
        target.rows,
        vec![
            s(&["A", "X", "0", "2026-10-19 08:00:00", "EFECTIVA", "", "a", "10", "yes"]),
            s(&["B", "X", "1", "2026-10-19 09:00:00", "EFECTIVA", "", "b", "20", "yes"]),
        ]
    );
    let writes = h.writes().await;
    assert_eq!(writes.len(), 2);
    assert!(matches!(writes[0], WriteOp::Header(_)));
    assert!(matches!(writes[1], WriteOp::Append(_)));
}

#[tokio::test]
async fn repeated_runs_never_duplicate_keys_and_converge() {
    let h = Harness::new(
        vec![
            src("A", "X", "0", "2026-10-19 08:00:00", "EFECTIVA", "a", "10"),
            src("A", "X", "0", "2026-10-19 10:00:00", "", "a2", "11"),
            src("B", "X", "1", "2026-10-19 09:00:00", "EFECTIVA", "b", "20"),
        ],
        None,
    )
    .await;

    let first = h.run(RunMode::Full).await;
    assert_eq!(first.keys_admitted, 2);
    assert_eq!(first.rows_admitted, 3);
    let target = h.target().await;
    // Every admitted row of a key carries the latest synced values.
    assert!(target.rows[..2].iter().all(|row| row[6] == "a2" && row[7] == "11"));
    assert!(target.rows[..2].iter().all(|row| row[3] == "2026-10-19 10:00:00"));

    h.store.clear_journal().await;
    let second = h.run(RunMode::Full).await;
    assert_eq!(second.keys_admitted, 0);
    assert_eq!(second.markers_cleared, 3);
    assert_eq!(
        h.writes().await,
        vec![WriteOp::Range {
            first_row: 0,
            last_row: 2,
            column: 8,
            values: s(&["", "", ""]),
        }]
    );

    h.store.clear_journal().await;
    let third = h.run(RunMode::Full).await;
    assert_eq!(third.write_ops, 0);
    assert!(h.writes().await.is_empty());

    let target = h.target().await;
    assert_eq!(target.rows.len(), 3);
    let distinct: HashSet<(String, String)> = target
        .rows
        .iter()
        .map(|row| (row[0].clone(), row[3].clone()))
        .collect();
    assert_eq!(distinct.len(), 2);
}

#[tokio::test]
async fn admissions_never_exceed_agent_quota() {
    let h = Harness::new(
        vec![
            src("K1", "X", "1", "2026-10-15 08:00:00", "", "", "1"),
            src("K2", "X", "0", "2026-10-19 08:00:00", "", "", "1"),
            src("K3", "X", "0", "2026-10-17 08:00:00", "", "", "1"),
            src("Z1", "Z", "2", "2026-10-19 08:00:00", "EFECTIVA", "", "1"),
        ],
        None,
    )
    .await;

    let summary = h.run(RunMode::Full).await;
    assert_eq!(summary.quotas.get("X"), Some(&1));
    assert_eq!(summary.quotas.get("Z"), Some(&2));
    for (agent, admitted) in &summary.admitted_per_agent {
        assert!(*admitted as u64 <= summary.quotas[agent]);
    }
    assert_eq!(keys(&h.target().await), s(&["K3", "Z1"]));
}

#[tokio::test]
async fn blank_source_values_keep_manual_edits_and_equal_numbers_are_not_rewritten() {
    let h = Harness::new(
        vec![src("C", "X", "0", "2026-10-19 07:00:00", "", "", "1234.50")],
        Some(vec![tgt("C", "X", "0", "2026-10-19 07:00:00", "manual", "1.234,50")]),
    )
    .await;

    let summary = h.run(RunMode::RefreshOnly).await;
    assert_eq!(summary.cells_touched, 0);
    assert!(h.writes().await.is_empty());

    h.store
        .insert(
            source_table(),
            Table::new(
                s(&SOURCE_HEADER),
                vec![src("C", "X", "0", "2026-10-19 07:00:00", "", "", "1234.60")],
            ),
        )
        .await;
    let summary = h.run(RunMode::RefreshOnly).await;
    assert_eq!(summary.cells_touched, 1);
    assert_eq!(
        h.writes().await,
        vec![WriteOp::Range {
            first_row: 0,
            last_row: 0,
            column: 7,
            values: s(&["1234.60"]),
        }]
    );
    let target = h.target().await;
    assert_eq!(target.rows[0][6], "manual");
}

#[tokio::test]
async fn rows_demoted_past_the_window_ceiling_are_evicted() {
    let h = Harness::new(
        vec![
            src("P", "X", "1", "2026-10-19 08:00:00", "", "p", "1"),
            src("Q", "X", "0", "2026-10-10 08:00:00", "", "q", "2"),
            src("Q", "X", "3", "2026-10-18 08:00:00", "", "q", "2"),
        ],
        Some(vec![
            tgt("P", "X", "1", "2026-10-19 08:00:00", "p", "1"),
            tgt("Q", "X", "0", "2026-10-18 08:00:00", "q", "2"),
            tgt("R", "X", "0", "2026-10-05 08:00:00", "r", "3"),
        ]),
    )
    .await;

    let summary = h.run(RunMode::Full).await;
    assert_eq!(summary.tier_ceiling, Some(1));
    assert_eq!(summary.rows_evicted, 1);
    assert_eq!(summary.keys_admitted, 0);
    assert_eq!(keys(&h.target().await), s(&["P", "R"]));
    let writes = h.writes().await;
    assert_eq!(writes.len(), 1);
    assert!(matches!(writes[0], WriteOp::Body { from_row: 0, .. }));
}

#[tokio::test]
async fn refresh_only_neither_evicts_nor_admits() {
    let h = Harness::new(
        vec![
            src("P", "X", "0", "2026-10-19 08:00:00", "EFECTIVA", "p", "1"),
            src("Q", "X", "3", "2026-10-18 08:00:00", "", "q", "2"),
            src("N", "X", "0", "2026-10-19 09:00:00", "", "n", "3"),
        ],
        Some(vec![
            tgt("P", "X", "0", "2026-10-19 08:00:00", "p", "1"),
            tgt("Q", "X", "3", "2026-10-18 08:00:00", "q", "2"),
        ]),
    )
    .await;

    let summary = h.run(RunMode::RefreshOnly).await;
    assert_eq!(summary.rows_evicted, 0);
    assert_eq!(summary.keys_admitted, 0);
    assert_eq!(keys(&h.target().await), s(&["P", "Q"]));
}

#[tokio::test]
async fn admit_only_leaves_existing_rows_alone() {
    let h = Harness::new(
        vec![
            src("C", "X", "0", "2026-10-19 07:00:00", "EFECTIVA", "changed", "5"),
            src("N", "X", "0", "2026-10-19 09:00:00", "", "n", "3"),
        ],
        Some(vec![tgt("C", "X", "0", "2026-10-19 07:00:00", "manual", "5")]),
    )
    .await;

    let summary = h.run(RunMode::AdmitOnly).await;
    assert_eq!(summary.cells_touched, 0);
    assert_eq!(summary.keys_admitted, 1);
    let target = h.target().await;
    assert_eq!(target.rows[0][6], "manual");
    assert_eq!(keys(&target), s(&["C", "N"]));
    assert_eq!(target.rows[1][8], "yes");
}

#[tokio::test]
async fn stale_rows_lose_retention_columns_once() {
    let h = Harness::new(
        vec![
            src("S", "X", "0", "2026-09-30 10:00:00", "", "old note", "5"),
            src("T", "Y", "0", "2026-10-19 08:00:00", "", "t", "1"),
        ],
        Some(vec![tgt("S", "X", "0", "2026-09-30 10:00:00", "old note", "5")]),
    )
    .await;

    let summary = h.run(RunMode::RefreshOnly).await;
    assert_eq!(summary.rows_cleared, 1);
    let target = h.target().await;
    assert_eq!(target.rows[0], tgt("S", "X", "0", "2026-09-30 10:00:00", "", "5"));

    h.store.clear_journal().await;
    h.run(RunMode::RefreshOnly).await;
    assert!(h.writes().await.is_empty());
}

#[tokio::test]
async fn utc_stored_timestamps_are_corrected_once_and_not_swept() {
    let store = Arc::new(MemoryTableStore::new());
    store
        .insert(
            source_table(),
            Table::new(
                s(&SOURCE_HEADER),
                vec![src("S", "X", "0", "2026-10-01 02:00:00", "", "", "5")],
            ),
        )
        .await;
    store
        .insert(
            target_table(),
            Table::new(
                s(&TARGET_HEADER),
                vec![tgt("S", "X", "0", "2026-10-01 07:00:00", "keep me", "5")],
            ),
        )
        .await;
    let mut config = config();
    config.assume_target_utc = true;
    let pipeline = SyncPipeline::new(store.clone(), config, policy()).expect("pipeline");

    let summary = pipeline
        .run_at(
            now(),
            RunOptions {
                mode: RunMode::RefreshOnly,
                dry_run: false,
            },
        )
        .await
        .expect("run");
    assert_eq!(summary.timestamps_canonicalized, 1);
    assert_eq!(summary.cells_touched, 0);
    assert_eq!(summary.rows_cleared, 0);

    let target = store.snapshot(&target_table()).await.expect("target table");
    assert_eq!(target.rows[0], tgt("S", "X", "0", "2026-10-01 02:00:00", "keep me", "5"));
    let writes: Vec<WriteOp> = store.journal().await.into_iter().map(|(_, op)| op).collect();
    assert_eq!(
        writes,
        vec![WriteOp::Range {
            first_row: 0,
            last_row: 0,
            column: 3,
            values: s(&["2026-10-01 02:00:00"]),
        }]
    );
}

#[tokio::test]
async fn unnamed_and_repeated_target_columns_survive_a_run() {
    let mut header = s(&TARGET_HEADER);
    header.extend(s(&["", "note"]));
    let mut row = tgt("S", "X", "0", "2026-10-19 08:00:00", "kept", "5");
    row.extend(s(&["manual memo", "second note"]));

    let store = Arc::new(MemoryTableStore::new());
    store
        .insert(
            source_table(),
            Table::new(
                s(&SOURCE_HEADER),
                vec![src("S", "X", "0", "2026-10-19 08:00:00", "", "", "5")],
            ),
        )
        .await;
    store
        .insert(target_table(), Table::new(header.clone(), vec![row.clone()]))
        .await;
    let pipeline = SyncPipeline::new(store.clone(), config(), policy()).expect("pipeline");

    let summary = pipeline
        .run_at(
            now(),
            RunOptions {
                mode: RunMode::RefreshOnly,
                dry_run: false,
            },
        )
        .await
        .expect("run");
    assert!(!summary.header_changed);
    assert_eq!(summary.write_ops, 0);
    assert!(store.journal().await.is_empty());

    let target = store.snapshot(&target_table()).await.expect("target table");
    assert_eq!(target.header, header);
    assert_eq!(target.rows, vec![row]);
}

#[tokio::test]
async fn missing_required_source_column_fails_before_any_write() {
    let header = s(&["ref", "agent", "tier", "seen", "activity", "status", "note"]);
    let h = Harness::with_policy(
        policy(),
        header,
        vec![s(&["A", "X", "0", "2026-10-19 08:00:00", "", "", "a"])],
        Some(vec![tgt("Z", "X", "0", "2026-10-19 08:00:00", "z", "1")]),
    )
    .await;

    let err = h
        .pipeline
        .run_at(now(), RunOptions::default())
        .await
        .expect_err("missing column");
    assert!(format!("{err:#}").contains("amount"));
    assert!(h.writes().await.is_empty());
}

#[tokio::test]
async fn target_without_key_column_is_rejected() {
    let store = Arc::new(MemoryTableStore::new());
    store
        .insert(
            source_table(),
            Table::new(
                s(&SOURCE_HEADER),
                vec![src("A", "X", "0", "2026-10-19 08:00:00", "", "a", "1")],
            ),
        )
        .await;
    store
        .insert(target_table(), Table::new(s(&["name"]), vec![s(&["someone"])]))
        .await;
    let pipeline = SyncPipeline::new(store.clone(), config(), policy()).expect("pipeline");

    let err = pipeline
        .run_at(now(), RunOptions::default())
        .await
        .expect_err("missing key column");
    assert!(format!("{err:#}").contains("'ref'"));
    assert!(store.journal().await.is_empty());
}

#[tokio::test]
async fn empty_source_is_a_no_op() {
    let h = Harness::new(Vec::new(), None).await;
    let summary = h.run(RunMode::Full).await;
    assert_eq!(summary.outcome, RunOutcome::NoSource);
    assert!(h.writes().await.is_empty());
    assert!(h.store.snapshot(&target_table()).await.is_none());

    let rejected_only = Harness::new(
        vec![src("A", "X", "n/a", "2026-10-19 08:00:00", "", "a", "1")],
        None,
    )
    .await;
    let summary = rejected_only.run(RunMode::Full).await;
    assert_eq!(summary.outcome, RunOutcome::NoSource);
    assert_eq!(summary.source_rejected, 1);
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
    let h = Harness::new(
        vec![src("A", "X", "0", "2026-10-19 08:00:00", "EFECTIVA", "a", "10")],
        None,
    )
    .await;

    let summary = h
        .run_with(RunOptions {
            mode: RunMode::Full,
            dry_run: true,
        })
        .await;
    assert_eq!(summary.keys_admitted, 1);
    assert_eq!(summary.write_ops, 2);
    assert!(summary.cells_written > 0);
    assert!(h.writes().await.is_empty());
    assert!(h.store.snapshot(&target_table()).await.is_none());
}

#[tokio::test]
async fn default_policy_maps_funnel_columns_into_bucket_layout() {
    let header = s(&[
        "Referencia",
        "Id deuda",
        "Negociador",
        "Bucket",
        "inserted_at_ultima",
        "Tipo de Actividad",
        "STATUS",
        "Descuento",
        "Extra",
    ]);
    let h = Harness::with_policy(
        ReconcilePolicy::default(),
        header,
        vec![s(&[
            "R1",
            "D1",
            "ana",
            "0",
            "2026-10-19 13:00:00",
            "EFECTIVA",
            "",
            "0.3",
            "x",
        ])],
        None,
    )
    .await;

    let summary = h.run(RunMode::Full).await;
    assert_eq!(summary.keys_admitted, 1);
    let target = h.target().await;
    assert_eq!(target.header[..3], s(&["Referencia", "Id deuda", "Negociador"])[..]);
    assert_eq!(target.header.last().map(String::as_str), Some("Extra"));

    let column = |name: &str| {
        target
            .header
            .iter()
            .position(|h| h == name)
            .unwrap_or_else(|| panic!("column {name}"))
    };
    let row = &target.rows[0];
    assert_eq!(row[column("Fecha Actualizacion")], "2026-10-19 08:00:00");
    assert_eq!(row[column("Descuento Requerido")], "0.3");
    assert_eq!(row[column("Nuevo")], "Nuevo");
    assert_eq!(row[column("Observación")], "");
}

#[tokio::test]
async fn json_file_store_round_trips_a_full_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(JsonFileTableStore::new(dir.path()));
    store
        .write_header(&source_table(), &s(&SOURCE_HEADER))
        .await
        .expect("source header");
    store
        .append_rows(
            &source_table(),
            &[src("A", "X", "0", "2026-10-19T13:00:00Z", "EFECTIVA", "a", "10")],
        )
        .await
        .expect("source rows");

    let mut policy = policy();
    policy.source_timestamps_utc = true;
    let pipeline = SyncPipeline::new(store.clone(), config(), policy).expect("pipeline");
    let summary = pipeline.run_at(now(), RunOptions::default()).await.expect("run");
    assert_eq!(summary.keys_admitted, 1);

    let target = store.read_table(&target_table()).await.expect("target");
    assert_eq!(target.header, s(&TARGET_HEADER));
    assert_eq!(target.rows[0][3], "2026-10-19 08:00:00");
    assert!(store.table_path(&target_table()).exists());
}
