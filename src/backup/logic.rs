// hanadiskbackup/src/backup/logic.rs
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cloud::group::{GroupSnapshotClient, consistency_group};
use crate::cloud::keys::{key_for_disk, load_key_file};
use crate::cloud::snapshot::DiskSnapshotClient;
use crate::cloud::{
    DiskDescriptor, DiskService, EncryptionKey, GroupService, InstanceContext, InstanceService, SnapshotMetadata,
    SnapshotRequest,
};
use crate::config::{BackupMode, BackupRequest, DiskSelection};
use crate::database::{DatabaseConnector, DatabaseOpener, DbSnapshotController, DbSnapshotToken};
use crate::discovery::DiskDiscovery;
use crate::errors::{BackupError, Result};
use crate::filesystem::{FilesystemControl, FreezeController};
use crate::status::{BackupOutcome, MetricLabels, MetricsEmitter, StatusReporter, metric_labels};
use crate::utils::backoff::cancellable;
use crate::utils::name_timestamp;

/// Abandon and thaw are each tried this many times during cleanup.
const CLEANUP_ATTEMPTS: u32 = 2;
const MAX_RESOURCE_NAME: usize = 63;
const MAX_ABANDON_REASON: usize = 200;

/// Everything the workflow talks to.
pub struct BackupServices<'a> {
    pub database: &'a dyn DatabaseOpener,
    pub disks: &'a dyn DiskService,
    pub groups: &'a dyn GroupService,
    pub instances: &'a dyn InstanceService,
    pub discovery: &'a dyn DiskDiscovery,
    /// Required only when the request freezes the filesystem.
    pub filesystem: Option<&'a dyn FilesystemControl>,
    pub metrics: Option<&'a dyn MetricsEmitter>,
}

/// State of one invocation. Owned by `run` and passed by reference to
/// every step.
pub(crate) struct WorkflowContext<'a> {
    started: Instant,
    project: String,
    zone: String,
    disks: Vec<String>,
    descriptors: Vec<DiskDescriptor>,
    encryption_key: Option<EncryptionKey>,
    snapshot_names: Vec<String>,
    group_name: Option<String>,
    db: Option<Box<dyn DatabaseConnector>>,
    /// CREATE SNAPSHOT was sent, whether or not the token came back.
    db_create_issued: bool,
    token: Option<DbSnapshotToken>,
    /// The token was confirmed or abandoned.
    token_closed: bool,
    freeze: Option<FreezeController<'a>>,
    freeze_window: Option<Duration>,
    cleanup_errors: Vec<BackupError>,
}

impl WorkflowContext<'_> {
    fn display_name(&self) -> String {
        match &self.group_name {
            Some(group) => group.clone(),
            None => self.snapshot_names.join(", "),
        }
    }

    fn labels(&self, sid: &str) -> MetricLabels {
        metric_labels(sid, &self.disks, &self.display_name())
    }
}

/// `snapshot-<disk>-<timestamp>`, shortening the disk part so the result is
/// still a valid resource name.
pub(crate) fn default_snapshot_name(disk: &str, timestamp: &str) -> String {
    let room = MAX_RESOURCE_NAME - "snapshot-".len() - timestamp.len() - 1;
    let disk: String = disk.chars().take(room).collect();
    format!("snapshot-{}-{timestamp}", disk.trim_end_matches('-'))
}

/// Disk snapshots of a mounted volume are only coordinated on Linux.
pub fn check_supported_os() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(BackupError::Precondition(
            "disk snapshot backups are only supported on Linux".to_string(),
        ));
    }
    Ok(())
}

fn abandon_reason(cause: &BackupError) -> String {
    let reason = format!("backup failed: {cause}");
    reason.chars().take(MAX_ABANDON_REASON).collect()
}

/// Drives one backup: database token, freeze, cloud snapshot, thaw,
/// completion polling, confirmation. Cleanup and reporting run on every
/// exit path.
pub struct BackupOrchestrator<'a> {
    request: &'a BackupRequest,
    instance: InstanceContext,
    services: BackupServices<'a>,
    cancel: CancellationToken,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(
        request: &'a BackupRequest,
        instance: InstanceContext,
        services: BackupServices<'a>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            instance,
            services,
            cancel,
        }
    }

    fn reporter(&self) -> StatusReporter<'a> {
        let emitter = if self.request.send_status_to_monitoring {
            self.services.metrics
        } else {
            None
        };
        StatusReporter::new(emitter)
    }

    pub async fn run(&self) -> BackupOutcome {
        let mut ctx = WorkflowContext {
            started: Instant::now(),
            project: self.request.project.clone().unwrap_or_else(|| self.instance.project.clone()),
            zone: self.request.disk_zone.clone().unwrap_or_else(|| self.instance.zone.clone()),
            disks: Vec::new(),
            descriptors: Vec::new(),
            encryption_key: None,
            snapshot_names: Vec::new(),
            group_name: None,
            db: None,
            db_create_issued: false,
            token: None,
            token_closed: false,
            freeze: None,
            freeze_window: None,
            cleanup_errors: Vec::new(),
        };
        info!(sid = %self.request.sid, mode = ?self.request.mode(), "Starting disk snapshot backup");

        let result = self.execute(&mut ctx).await;
        if let Err(e) = &result {
            if e.is_cancelled() {
                warn!(sid = %self.request.sid, error = %e, "Backup cancelled, releasing held resources");
            } else {
                error!(sid = %self.request.sid, error = %e, "Backup failed");
            }
            self.cleanup(&mut ctx, e).await;
        }

        let outcome = BackupOutcome {
            success: result.is_ok(),
            sid: self.request.sid.clone(),
            snapshot_names: ctx.snapshot_names.clone(),
            group_name: ctx.group_name.clone(),
            total: ctx.started.elapsed(),
            freeze_window: ctx.freeze_window,
            error: result.err(),
            cleanup_errors: std::mem::take(&mut ctx.cleanup_errors),
            disks: ctx.disks,
        };
        self.reporter().report(&outcome).await;
        outcome
    }

    async fn execute(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        let mode = self.request.mode();
        self.check_preconditions()?;
        self.resolve_disks(ctx, mode).await?;
        self.resolve_names(ctx, mode);

        if mode != BackupMode::ChangeDiskType {
            let db = cancellable(&self.cancel, "database connect", self.services.database.open(self.request)).await?;
            ctx.db = Some(db);
            self.verify_attached(ctx).await?;
        }
        self.describe_disks(ctx, mode).await?;
        self.create_db_snapshot(ctx).await?;

        if let Some(control) = self.services.filesystem.filter(|_| self.request.freeze_file_system) {
            ctx.freeze = Some(FreezeController::new(
                control,
                &self.request.data_mount,
                self.request.polling.freeze_timeout,
            ));
        }

        match mode {
            BackupMode::GroupSnapshot => self.snapshot_group(ctx).await,
            BackupMode::Standard | BackupMode::ChangeDiskType => self.snapshot_disk(ctx).await,
        }
    }

    fn check_preconditions(&self) -> Result<()> {
        check_supported_os()?;
        if self.request.freeze_file_system && self.services.filesystem.is_none() {
            return Err(BackupError::Precondition(
                "filesystem freeze requested but fsfreeze is not available".to_string(),
            ));
        }
        if self.request.group_snapshot && self.request.source_disk_key_file.is_some() {
            return Err(BackupError::Usage(
                "source_disk_key_file is not supported with group snapshots".to_string(),
            ));
        }
        let snapshot = &self.request.snapshot;
        if self.request.group_snapshot && (!snapshot.labels.is_empty() || snapshot.storage_location.is_some()) {
            return Err(BackupError::Usage(
                "labels and storage_location are not supported with group snapshots".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_disks(&self, ctx: &mut WorkflowContext<'a>, mode: BackupMode) -> Result<()> {
        let disks = match &self.request.disks {
            DiskSelection::Explicit(disks) => disks.clone(),
            DiskSelection::Discover => {
                cancellable(
                    &self.cancel,
                    "disk discovery",
                    self.services.discovery.data_disks(&self.instance),
                )
                .await?
            }
        };
        if disks.is_empty() {
            return Err(BackupError::Precondition(format!(
                "no disk backs {}",
                self.request.data_mount.display()
            )));
        }
        if mode != BackupMode::GroupSnapshot && disks.len() > 1 {
            return Err(BackupError::Precondition(format!(
                "{} spans {} disks ({}); striped volumes need group_snapshot",
                self.request.data_mount.display(),
                disks.len(),
                disks.join(", ")
            )));
        }
        ctx.disks = disks;
        Ok(())
    }

    fn resolve_names(&self, ctx: &mut WorkflowContext<'a>, mode: BackupMode) {
        let timestamp = name_timestamp(Utc::now());
        let spec = &self.request.snapshot;
        if mode == BackupMode::GroupSnapshot {
            let group = spec
                .group_name
                .clone()
                .unwrap_or_else(|| format!("{}-group-{timestamp}", self.request.sid.to_lowercase()));
            // Placeholders until the service reports the member names.
            ctx.snapshot_names = ctx.disks.iter().map(|d| format!("{group}-{d}")).collect();
            ctx.group_name = Some(group);
        } else {
            let disk = ctx.disks.first().map(String::as_str).unwrap_or_default();
            ctx.snapshot_names = vec![
                spec.name
                    .clone()
                    .unwrap_or_else(|| default_snapshot_name(disk, &timestamp)),
            ];
        }
    }

    /// Guards against snapshotting a disk named by stale parameters.
    async fn verify_attached(&self, ctx: &WorkflowContext<'a>) -> Result<()> {
        let attached = cancellable(
            &self.cancel,
            "list attached disks",
            self.services.instances.attached_disks(&self.instance),
        )
        .await?;
        for disk in &ctx.disks {
            if !attached.iter().any(|a| &a.disk_name == disk) {
                return Err(BackupError::Precondition(format!(
                    "disk {disk} is not attached to instance {}",
                    self.instance.instance_name
                )));
            }
        }
        Ok(())
    }

    async fn describe_disks(&self, ctx: &mut WorkflowContext<'a>, mode: BackupMode) -> Result<()> {
        let client = DiskSnapshotClient::new(self.services.disks, &self.request.polling, &self.cancel);
        for name in &ctx.disks {
            let disk = client.describe_disk(&ctx.project, &ctx.zone, name).await?;
            info!(
                disk = %disk.name,
                disk_type = %disk.disk_type,
                provisioned_iops = ?disk.provisioned_iops,
                provisioned_throughput = ?disk.provisioned_throughput,
                "Source disk"
            );
            ctx.descriptors.push(disk);
        }
        if mode == BackupMode::GroupSnapshot {
            consistency_group(&ctx.descriptors)?;
            return Ok(());
        }
        if let Some(disk) = ctx.descriptors.first() {
            ctx.encryption_key = self.encryption_key(disk)?;
        }
        Ok(())
    }

    /// A customer-supplied key from the key file wins over the disk's own
    /// managed key.
    fn encryption_key(&self, disk: &DiskDescriptor) -> Result<Option<EncryptionKey>> {
        let Some(path) = &self.request.source_disk_key_file else {
            return Ok(disk.encryption_key.clone());
        };
        let entries = load_key_file(path).map_err(|e| BackupError::Usage(format!("{e:#}")))?;
        let key = key_for_disk(&entries, &disk.self_link, &disk.name).map_err(|e| BackupError::Usage(format!("{e:#}")))?;
        if key.is_none() {
            warn!(disk = %disk.name, key_file = %path.display(), "No entry for disk in key file");
        }
        Ok(key.or_else(|| disk.encryption_key.clone()))
    }

    async fn create_db_snapshot(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        let Some(db) = ctx.db.as_deref() else {
            return Ok(());
        };
        let controller = DbSnapshotController::new(db, self.request.polling.db_query_timeout);
        cancellable(
            &self.cancel,
            "check prepared snapshots",
            controller.clear_prepared(self.request.abandon_prepared),
        )
        .await?;

        let comment = ctx.display_name();
        ctx.db_create_issued = true;
        let token = cancellable(&self.cancel, "create data snapshot", controller.create_snapshot(&comment)).await?;
        ctx.token = Some(token);
        Ok(())
    }

    async fn confirm_db_snapshot(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        let (Some(db), Some(token)) = (ctx.db.as_deref(), ctx.token.as_ref()) else {
            return Ok(());
        };
        let external_id = ctx.display_name();
        let controller = DbSnapshotController::new(db, self.request.polling.db_query_timeout);
        cancellable(&self.cancel, "confirm data snapshot", controller.confirm(token, &external_id)).await?;
        ctx.token_closed = true;
        Ok(())
    }

    async fn freeze(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        match ctx.freeze.as_mut() {
            Some(freeze) => freeze.freeze().await,
            None => Ok(()),
        }
    }

    /// Unfreezes right after the create call is accepted.
    async fn thaw(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        let window = match ctx.freeze.as_mut() {
            Some(freeze) => freeze.unfreeze().await?,
            None => None,
        };
        if let Some(window) = window {
            ctx.freeze_window = Some(window);
            self.reporter().report_freeze(&ctx.labels(&self.request.sid), window).await;
        }
        Ok(())
    }

    async fn snapshot_disk(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        let client = DiskSnapshotClient::new(self.services.disks, &self.request.polling, &self.cancel);
        let (Some(source_disk), Some(name)) = (ctx.descriptors.first().cloned(), ctx.snapshot_names.first().cloned())
        else {
            return Err(BackupError::Precondition("no disk to snapshot".to_string()));
        };
        let project = source_disk.project.clone();
        let request = SnapshotRequest {
            name,
            source_disk,
            metadata: self.metadata(),
            encryption_key: ctx.encryption_key.clone(),
        };

        self.freeze(ctx).await?;
        let handle = cancellable(&self.cancel, "create snapshot", client.create(&request)).await?;
        self.thaw(ctx).await?;

        client.wait_for_creation(&handle).await?;
        if self.request.confirm_after_create {
            self.confirm_db_snapshot(ctx).await?;
            client.wait_for_upload(&project, &handle).await?;
        } else {
            client.wait_for_upload(&project, &handle).await?;
            self.confirm_db_snapshot(ctx).await?;
        }
        Ok(())
    }

    async fn snapshot_group(&self, ctx: &mut WorkflowContext<'a>) -> Result<()> {
        let client = GroupSnapshotClient::new(self.services.groups, &self.request.polling, &self.cancel);
        let name = ctx.display_name();
        let disks = ctx.descriptors.clone();

        self.freeze(ctx).await?;
        let mut handle = cancellable(
            &self.cancel,
            "create group snapshot",
            client.create(&name, &disks, self.metadata()),
        )
        .await?;
        self.thaw(ctx).await?;

        client.wait_for_creation(&mut handle).await?;
        ctx.snapshot_names = handle.members.iter().map(|m| m.name.clone()).collect();
        if self.request.confirm_after_create {
            self.confirm_db_snapshot(ctx).await?;
            client.wait_for_upload(&handle).await?;
        } else {
            client.wait_for_upload(&handle).await?;
            self.confirm_db_snapshot(ctx).await?;
        }
        Ok(())
    }

    fn metadata(&self) -> SnapshotMetadata {
        let spec = &self.request.snapshot;
        SnapshotMetadata {
            description: spec.description.clone(),
            storage_location: spec.storage_location.clone(),
            labels: spec.labels.clone(),
            snapshot_type: spec.snapshot_type,
        }
    }

    /// Releases what the run still holds: thaw first, then the token. The
    /// two are independent and neither is raced against cancellation.
    async fn cleanup(&self, ctx: &mut WorkflowContext<'a>, cause: &BackupError) {
        if let Some(freeze) = ctx.freeze.as_mut() {
            let mut attempt = 0;
            while freeze.is_frozen() && attempt < CLEANUP_ATTEMPTS {
                attempt += 1;
                match freeze.unfreeze().await {
                    Ok(window) => ctx.freeze_window = window.or(ctx.freeze_window),
                    Err(e) if attempt == CLEANUP_ATTEMPTS => {
                        error!(cleanup = true, mount = %freeze.mount().display(), error = %e, "Filesystem left frozen");
                        ctx.cleanup_errors.push(BackupError::Cleanup(format!(
                            "filesystem {} is still frozen: {e}",
                            freeze.mount().display()
                        )));
                    }
                    Err(e) => warn!(cleanup = true, attempt, error = %e, "Unfreeze failed, retrying"),
                }
            }
        }

        if ctx.token_closed {
            return;
        }
        let Some(db) = ctx.db.as_deref() else {
            return;
        };
        let controller = DbSnapshotController::new(db, self.request.polling.db_query_timeout);
        let token = match ctx.token.clone() {
            Some(token) => token,
            // CREATE may have run without the token reaching us.
            None if ctx.db_create_issued => match controller.prepared_snapshot().await {
                Ok(Some(token)) => token,
                Ok(None) => return,
                Err(e) => {
                    error!(cleanup = true, error = %e, "Cannot look up prepared data snapshot");
                    ctx.cleanup_errors.push(BackupError::Cleanup(format!(
                        "could not look up the prepared data snapshot: {e}"
                    )));
                    return;
                }
            },
            None => return,
        };
        match abandon_with_retry(&controller, &token, &abandon_reason(cause)).await {
            Ok(()) => ctx.token_closed = true,
            Err(e) => ctx.cleanup_errors.push(e),
        }
    }
}

/// At most `CLEANUP_ATTEMPTS` abandon calls; exhaustion is a cleanup error.
pub(crate) async fn abandon_with_retry(
    controller: &DbSnapshotController<'_>,
    token: &DbSnapshotToken,
    reason: &str,
) -> Result<()> {
    let mut last_error = None;
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match controller.abandon(token, reason).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(cleanup = true, attempt, backup_id = token.backup_id(), error = %e, "Abandon failed");
                last_error = Some(e);
            }
        }
    }
    let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
    error!(cleanup = true, backup_id = token.backup_id(), "Data snapshot left prepared");
    Err(BackupError::Cleanup(format!(
        "could not abandon data snapshot {}: {detail}",
        token.backup_id()
    )))
}
