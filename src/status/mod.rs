//! Outcome of a backup run and best-effort telemetry about it.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cloud::gce::GceClient;
use crate::errors::{BackupError, Result};

const METRIC_PREFIX: &str = "workload.googleapis.com/sap/hanadiskbackup";
pub const STATUS_METRIC: &str = "status";
pub const TOTAL_TIME_METRIC: &str = "totaltime";
pub const FREEZE_TIME_METRIC: &str = "freezetime";

pub type MetricLabels = BTreeMap<String, String>;

#[async_trait]
pub trait MetricsEmitter: Send + Sync {
    async fn emit_bool(&self, metric: &str, labels: &MetricLabels, value: bool) -> Result<()>;
    async fn emit_double(&self, metric: &str, labels: &MetricLabels, value: f64) -> Result<()>;
}

/// Produced once at the end of a run.
#[derive(Debug)]
pub struct BackupOutcome {
    pub success: bool,
    pub sid: String,
    pub disks: Vec<String>,
    pub snapshot_names: Vec<String>,
    pub group_name: Option<String>,
    pub total: Duration,
    pub freeze_window: Option<Duration>,
    pub error: Option<BackupError>,
    pub cleanup_errors: Vec<BackupError>,
}

impl BackupOutcome {
    /// A run that stopped before the workflow could start.
    pub fn failed(sid: &str, total: Duration, error: BackupError) -> Self {
        Self {
            success: false,
            sid: sid.to_string(),
            disks: Vec::new(),
            snapshot_names: Vec::new(),
            group_name: None,
            total,
            freeze_window: None,
            error: Some(error),
            cleanup_errors: Vec::new(),
        }
    }

    /// The name the run is known by: the group if any, else the snapshot(s).
    pub fn display_name(&self) -> String {
        match &self.group_name {
            Some(group) => group.clone(),
            None if self.snapshot_names.is_empty() => "<unnamed>".to_string(),
            None => self.snapshot_names.join(", "),
        }
    }

    /// Single terminal message for the user.
    pub fn message(&self) -> String {
        let kind = if self.group_name.is_some() { "Group snapshot" } else { "Snapshot" };
        match &self.error {
            None => format!(
                "{kind} {} of SID {} completed in {:.1}s",
                self.display_name(),
                self.sid,
                self.total.as_secs_f64()
            ),
            Some(error) => {
                let mut message = format!("{kind} {} of SID {} failed: {error}", self.display_name(), self.sid);
                if !self.cleanup_errors.is_empty() {
                    message.push_str(&format!(" ({} cleanup step(s) also failed)", self.cleanup_errors.len()));
                }
                message
            }
        }
    }

    pub fn labels(&self) -> MetricLabels {
        metric_labels(&self.sid, &self.disks, &self.display_name())
    }
}

pub fn metric_labels(sid: &str, disks: &[String], snapshot: &str) -> MetricLabels {
    BTreeMap::from([
        ("sid".to_string(), sid.to_string()),
        ("disk".to_string(), disks.join(",")),
        ("snapshot".to_string(), snapshot.to_string()),
    ])
}

/// Reports status and durations. Never fails the run.
pub struct StatusReporter<'a> {
    emitter: Option<&'a dyn MetricsEmitter>,
}

impl<'a> StatusReporter<'a> {
    pub fn new(emitter: Option<&'a dyn MetricsEmitter>) -> Self {
        Self { emitter }
    }

    pub async fn report_freeze(&self, labels: &MetricLabels, window: Duration) {
        info!(freeze_seconds = window.as_secs_f64(), "Filesystem write-blocked window");
        if let Some(emitter) = self.emitter {
            if let Err(e) = emitter.emit_double(FREEZE_TIME_METRIC, labels, window.as_secs_f64()).await {
                warn!(error = %e, metric = FREEZE_TIME_METRIC, "Failed to send metric");
            }
        }
    }

    pub async fn report(&self, outcome: &BackupOutcome) {
        info!(
            success = outcome.success,
            total_seconds = outcome.total.as_secs_f64(),
            freeze_seconds = outcome.freeze_window.map(|w| w.as_secs_f64()),
            cleanup_failures = outcome.cleanup_errors.len(),
            snapshot = %outcome.display_name(),
            "Backup finished"
        );
        let Some(emitter) = self.emitter else {
            return;
        };
        let labels = outcome.labels();
        if let Err(e) = emitter.emit_bool(STATUS_METRIC, &labels, outcome.success).await {
            warn!(error = %e, metric = STATUS_METRIC, "Failed to send metric");
        }
        if let Err(e) = emitter
            .emit_double(TOTAL_TIME_METRIC, &labels, outcome.total.as_secs_f64())
            .await
        {
            warn!(error = %e, metric = TOTAL_TIME_METRIC, "Failed to send metric");
        }
    }
}

/// Custom metrics in Cloud Monitoring, one point per call.
pub struct CloudMonitoringEmitter {
    client: Arc<GceClient>,
    project: String,
    instance_labels: MetricLabels,
}

impl CloudMonitoringEmitter {
    pub fn new(client: Arc<GceClient>, project: String, instance_id: String, zone: String) -> Self {
        Self {
            client,
            instance_labels: BTreeMap::from([
                ("project_id".to_string(), project.clone()),
                ("instance_id".to_string(), instance_id),
                ("zone".to_string(), zone),
            ]),
            project,
        }
    }

    fn series(&self, metric: &str, labels: &MetricLabels, value: Value) -> Value {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        json!({
            "metric": { "type": format!("{METRIC_PREFIX}/{metric}"), "labels": labels },
            "resource": { "type": "gce_instance", "labels": self.instance_labels },
            "points": [{ "interval": { "endTime": now }, "value": value }],
        })
    }
}

#[async_trait]
impl MetricsEmitter for CloudMonitoringEmitter {
    async fn emit_bool(&self, metric: &str, labels: &MetricLabels, value: bool) -> Result<()> {
        let series = self.series(metric, labels, json!({ "boolValue": value }));
        self.client.create_time_series(&self.project, vec![series]).await
    }

    async fn emit_double(&self, metric: &str, labels: &MetricLabels, value: f64) -> Result<()> {
        let series = self.series(metric, labels, json!({ "doubleValue": value }));
        self.client.create_time_series(&self.project, vec![series]).await
    }
}
