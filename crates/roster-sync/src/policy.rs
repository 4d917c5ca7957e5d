//! Reconciliation policy: role columns, weights, schema map, synced and
//! retention columns. Loaded from YAML; every field has a default.

use std::path::Path;

use anyhow::{bail, Context, Result};
use roster_core::{CoreError, RoleColumns};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::quota::{CarryOverRule, WeightPolicy};
use crate::reconcile::{BoundColumn, ColumnKind, SyncColumn};
use crate::schema::{ColumnMapping, RenameRule};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionMarker {
    pub column: String,
    pub value: String,
}

impl Default for AdmissionMarker {
    fn default() -> Self {
        Self {
            column: "Nuevo".to_string(),
            value: "Nuevo".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilePolicy {
    pub roles: RoleColumns,
    pub admission_marker: AdmissionMarker,
    pub weights: WeightPolicy,
    pub carry_over: Option<CarryOverRule>,
    /// Highest tier the allocator walks; `None` walks every tier present.
    pub max_admission_tier: Option<u32>,
    pub schema: ColumnMapping,
    pub sync_columns: Vec<SyncColumn>,
    pub retention_columns: Vec<String>,
    /// Whether source timestamps without a zone marker are UTC.
    pub source_timestamps_utc: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            roles: RoleColumns::default(),
            admission_marker: AdmissionMarker::default(),
            weights: WeightPolicy::default(),
            carry_over: None,
            max_admission_tier: Some(5),
            schema: default_mapping(),
            sync_columns: default_sync_columns(),
            retention_columns: strings(&[
                "Descuento_Actualizacion",
                "Fecha Actualizacion",
                "Actualizado Por",
                "Categoria Actualizacion",
                "Pago a Banco actualizacion",
                "Observación",
                "Tipo de Actividad",
            ]),
            source_timestamps_utc: true,
        }
    }
}

impl ReconcilePolicy {
    /// Reads a YAML policy file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "policy file not found; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let policy: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        policy
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.roles.key.trim().is_empty() {
            bail!("roles.key must name a source column");
        }
        if self.admission_marker.column.trim().is_empty() {
            bail!("admission_marker.column must not be empty");
        }
        let w = &self.weights;
        if [w.base, w.effective, w.settled]
            .iter()
            .any(|weight| !weight.is_finite() || *weight < 0.0)
        {
            bail!("weights must be finite and non-negative");
        }
        Ok(())
    }

    pub fn key_column(&self) -> String {
        self.schema.target_name(&self.roles.key).to_string()
    }

    /// Target column used to match rows to snapshots: the secondary key when
    /// one is configured, the primary key otherwise.
    pub fn sync_key_column(&self) -> String {
        let source = self.roles.secondary_key.as_deref().unwrap_or(&self.roles.key);
        self.schema.target_name(source).to_string()
    }

    pub fn last_update_column(&self) -> String {
        self.schema.target_name(&self.roles.inserted_at).to_string()
    }

    /// Columns the target header must always carry.
    pub fn required_target_columns(&self) -> Vec<String> {
        let mut columns = vec![self.key_column(), self.sync_key_column()];
        columns.extend(
            self.sync_columns
                .iter()
                .map(|c| self.schema.target_name(&c.source).to_string()),
        );
        columns.push(self.last_update_column());
        columns.extend(self.retention_columns.iter().cloned());
        columns.push(self.admission_marker.column.clone());
        columns
    }

    pub fn check_source_columns(&self, source_header: &[String]) -> Result<(), CoreError> {
        for column in self.sync_columns.iter().filter(|c| c.required) {
            if !source_header.iter().any(|h| *h == column.source) {
                return Err(CoreError::MissingColumn {
                    table: "source log".to_string(),
                    column: column.source.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolves sync columns against both headers. Optional columns the
    /// source lacks are skipped.
    pub fn bind_sync_columns(&self, source_header: &[String], target_header: &[String]) -> Vec<BoundColumn> {
        let mut bound = Vec::with_capacity(self.sync_columns.len());
        for column in &self.sync_columns {
            let name = self.schema.target_name(&column.source);
            let Some(source_idx) = source_header.iter().position(|h| *h == column.source) else {
                warn!(column = %column.source, "sync column absent from source; skipped");
                continue;
            };
            let Some(target_idx) = target_header.iter().position(|h| h == name) else {
                warn!(column = %name, "sync column absent from target header; skipped");
                continue;
            };
            bound.push(BoundColumn {
                name: name.to_string(),
                kind: column.kind,
                source_idx,
                target_idx,
            });
        }
        bound
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn default_mapping() -> ColumnMapping {
    let renames = [
        ("BANCOS_ESTANDAR", "Banco"),
        ("Descuento", "Descuento Requerido"),
        ("inserted_at_ultima", "Fecha Actualizacion"),
        ("end_ultima", "Actualizado Por"),
        ("CATEGORIA_PRED_ultima", "Categoria Actualizacion"),
        ("payment_to_bank_ultima", "Pago a Banco actualizacion"),
        ("observations_ultima", "Observación"),
    ]
    .into_iter()
    .map(|(from, to)| RenameRule {
        from: from.to_string(),
        to: to.to_string(),
    })
    .collect();

    ColumnMapping {
        renames,
        preferred_order: strings(&[
            "Referencia",
            "Id deuda",
            "Cedula",
            "Nombre del cliente",
            "Negociador",
            "Banco",
            "D_BRAVO",
            "CE",
            "Tipo de Liquidacion",
            "Ahorro total",
            "Por cobrar",
            "Meses en el Programa",
            "MORA",
            "Descuento Requerido",
            "Pago_banco_esperado",
            "Potencial",
            "Estructurable",
            "Potencial Credito",
            "Ingreso_esperado",
            "Descuento_Actualizacion",
            "Fecha Actualizacion",
            "Actualizado Por",
            "Categoria Actualizacion",
            "Pago a Banco actualizacion",
            "Observación",
            "Tipo de Actividad",
            "Mora_estructurado",
            "MORA_CREDITO",
            "ultimo contacto",
            "Bucket",
            "Nuevo",
            "FASE",
            "STATUS",
        ]),
    }
}

fn default_sync_columns() -> Vec<SyncColumn> {
    let mut columns = vec![SyncColumn {
        source: "Descuento".to_string(),
        kind: ColumnKind::Text,
        required: true,
    }];
    columns.extend(
        [
            ("Descuento_Actualizacion", ColumnKind::Text),
            ("inserted_at_ultima", ColumnKind::Timestamp),
            ("end_ultima", ColumnKind::Text),
            ("CATEGORIA_PRED_ultima", ColumnKind::Text),
            ("payment_to_bank_ultima", ColumnKind::Text),
            ("observations_ultima", ColumnKind::Text),
            ("Tipo de Actividad", ColumnKind::Text),
            ("CE", ColumnKind::Text),
            ("Ahorro total", ColumnKind::Numeric),
            ("Por cobrar", ColumnKind::Numeric),
        ]
        .into_iter()
        .map(|(source, kind)| SyncColumn::new(source, kind)),
    );
    columns
}
