//! Light-curve assembly with remote fallback.
//!
//! The history embedded in an alert is used when every magnitude is finite.
//! A single null or non-finite magnitude means the embedded copy cannot be
//! trusted, and the object's complete history is fetched from the broker.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::alert::{NewAlert, PrvCandidate};
use crate::error::BrokerQueryError;

/// Column namespace separator used by the broker (`i:magpsf`, `d:tag`).
pub const NAMESPACE_SEPARATOR: char = ':';

/// A tabular broker response: one JSON object per row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryTable {
    pub records: Vec<Map<String, Value>>,
}

impl HistoryTable {
    pub fn new(records: Vec<Map<String, Value>>) -> Self {
        Self { records }
    }

    pub fn columns(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|r| r.keys().cloned())
            .collect()
    }

    /// Renames every `prefix:column` key to `column`.
    pub fn strip_namespaces(self) -> Self {
        let records = self
            .records
            .into_iter()
            .map(|record| {
                record
                    .into_iter()
                    .map(|(key, value)| (bare_column(&key).to_string(), value))
                    .collect()
            })
            .collect();
        Self { records }
    }
}

pub fn bare_column(name: &str) -> &str {
    match name.rsplit_once(NAMESPACE_SEPARATOR) {
        Some((_, bare)) => bare,
        None => name,
    }
}

/// Source of an object's complete history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn object_history(&self, object_id: &str) -> Result<HistoryTable, BrokerQueryError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct LightcurveRow {
    pub jd: f64,
    pub fid: i32,
    pub magpsf: Option<f64>,
    pub sigmapsf: Option<f64>,
    pub diffmaglim: Option<f64>,
}

impl LightcurveRow {
    /// A genuine detection, as opposed to an upper-limit placeholder.
    pub fn is_finite(&self) -> bool {
        self.magpsf.is_some_and(f64::is_finite)
    }
}

impl From<&PrvCandidate> for LightcurveRow {
    fn from(prv: &PrvCandidate) -> Self {
        Self {
            jd: prv.jd,
            fid: prv.fid,
            magpsf: prv.magpsf,
            sigmapsf: prv.sigmapsf,
            diffmaglim: prv.diffmaglim,
        }
    }
}

impl From<&NewAlert> for LightcurveRow {
    fn from(alert: &NewAlert) -> Self {
        Self {
            jd: alert.jd,
            fid: alert.fid,
            magpsf: Some(alert.magpsf),
            sigmapsf: Some(alert.sigmapsf),
            diffmaglim: alert.diffmaglim,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryOrigin {
    Embedded,
    Remote,
}

/// Historical measurements of a single object.
#[derive(Clone, Debug, PartialEq)]
pub struct LightcurveView {
    pub object_id: String,
    pub origin: HistoryOrigin,
    columns: BTreeSet<String>,
    rows: Vec<LightcurveRow>,
}

const EMBEDDED_COLUMNS: [&str; 7] = [
    "jd",
    "fid",
    "magpsf",
    "sigmapsf",
    "diffmaglim",
    "candid",
    "isdiffpos",
];

impl LightcurveView {
    pub fn from_embedded(object_id: &str, history: &[PrvCandidate]) -> Self {
        Self {
            object_id: object_id.to_string(),
            origin: HistoryOrigin::Embedded,
            columns: EMBEDDED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: history.iter().map(LightcurveRow::from).collect(),
        }
    }

    /// Builds a view from an already normalized table. Rows without a usable
    /// `jd` or `fid` are dropped.
    pub fn from_table(object_id: &str, table: &HistoryTable) -> Self {
        let rows = table
            .records
            .iter()
            .filter_map(|record| {
                let jd = number(record, "jd")?;
                let fid = number(record, "fid")? as i32;
                Some(LightcurveRow {
                    jd,
                    fid,
                    magpsf: number(record, "magpsf"),
                    sigmapsf: number(record, "sigmapsf"),
                    diffmaglim: number(record, "diffmaglim"),
                })
            })
            .collect::<Vec<_>>();
        if rows.len() < table.records.len() {
            tracing::debug!(
                object_id = %object_id,
                dropped = table.records.len() - rows.len(),
                "dropped history rows without jd/fid"
            );
        }
        Self {
            object_id: object_id.to_string(),
            origin: HistoryOrigin::Remote,
            columns: table.columns(),
            rows,
        }
    }

    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    pub fn rows(&self) -> &[LightcurveRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows that are limits or otherwise lack a finite magnitude.
    pub fn non_finite_count(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_finite()).count()
    }

    pub fn push(&mut self, row: LightcurveRow) {
        self.rows.push(row);
    }
}

fn number(record: &Map<String, Value>, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Whether the triggering candidate is appended to the light curve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AppendPolicy {
    /// Keep the history exactly as found. This reproduces the long-standing
    /// behaviour where the append was computed and then discarded.
    #[default]
    Skip,
    Append,
}

impl AppendPolicy {
    pub fn from_flag(append: bool) -> Self {
        if append {
            AppendPolicy::Append
        } else {
            AppendPolicy::Skip
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Enrichment {
    /// The alert carried no prior candidates: below threshold, not an error.
    NoHistory,
    Lightcurve(LightcurveView),
}

pub struct LightcurveEnricher {
    history: Arc<dyn HistorySource>,
    append: AppendPolicy,
}

impl LightcurveEnricher {
    pub fn new(history: Arc<dyn HistorySource>, append: AppendPolicy) -> Self {
        Self { history, append }
    }

    pub fn needs_remote_fetch(history: &[PrvCandidate]) -> bool {
        history.iter().any(|prv| !prv.has_finite_magnitude())
    }

    #[tracing::instrument(skip_all, fields(object_id = %new_alert.object_id))]
    pub async fn enrich(
        &self,
        new_alert: &NewAlert,
        embedded: &[PrvCandidate],
    ) -> Result<Enrichment, BrokerQueryError> {
        if embedded.is_empty() {
            return Ok(Enrichment::NoHistory);
        }

        let mut view = if Self::needs_remote_fetch(embedded) {
            tracing::info!(
                name = "enrich.remote_fetch",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "Embedded history has non-finite magnitudes, launching history query",
                object_id = %new_alert.object_id,
            );
            let table = self
                .history
                .object_history(&new_alert.object_id)
                .await?
                .strip_namespaces();
            LightcurveView::from_table(&new_alert.object_id, &table)
        } else {
            LightcurveView::from_embedded(&new_alert.object_id, embedded)
        };

        if self.append == AppendPolicy::Append {
            view.push(LightcurveRow::from(new_alert));
        }
        Ok(Enrichment::Lightcurve(view))
    }
}
