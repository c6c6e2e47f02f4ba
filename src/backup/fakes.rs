// hanadiskbackup/src/backup/fakes.rs
//! Recording fakes of every collaborator, sharing one ordered event log.

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cloud::{
    AttachedDisk, DiskDescriptor, DiskService, GroupMember, GroupService, GroupSnapshotRequest, InstanceContext,
    InstanceService, OperationRef, OperationScope, OperationStatus, SnapshotRequest, SnapshotState,
};
use crate::config::{BackupRequest, PollingConfig};
use crate::database::{DatabaseConnector, DatabaseOpener};
use crate::discovery::DiskDiscovery;
use crate::errors::{BackupError, Result, Service};
use crate::filesystem::FilesystemControl;
use crate::status::{MetricLabels, MetricsEmitter};
use crate::utils::backoff::BackoffConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        lock(&self.0).push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    pub fn count(&self, needle: &str) -> usize {
        lock(&self.0).iter().filter(|e| e.contains(needle)).count()
    }

    /// Index of the first event containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e.contains(needle))
    }
}

pub fn fast_polling() -> PollingConfig {
    let quick = |max_attempts| BackoffConfig {
        initial_interval_ms: 1,
        multiplier: 1.0,
        max_interval_ms: 1,
        max_attempts,
    };
    PollingConfig {
        creation: quick(5),
        upload: quick(5),
        call: quick(3),
        db_query_timeout: Duration::from_secs(5),
        api_call_timeout: Duration::from_secs(5),
        freeze_timeout: Duration::from_secs(5),
        deadline: None,
    }
}

pub fn sample_disk(name: &str) -> DiskDescriptor {
    DiskDescriptor {
        name: name.to_string(),
        zone: "zone-a".to_string(),
        project: "proj".to_string(),
        self_link: format!("https://www.googleapis.com/compute/v1/projects/proj/zones/zone-a/disks/{name}"),
        disk_type: "pd-balanced".to_string(),
        encryption_key: None,
        provisioned_iops: None,
        provisioned_throughput: None,
        resource_policies: vec!["projects/proj/regions/r/resourcePolicies/cg".to_string()],
    }
}

#[derive(Default)]
struct CloudState {
    disks: Vec<DiskDescriptor>,
    attached: Option<Vec<AttachedDisk>>,
    snapshots: Vec<SnapshotRequest>,
    groups: Vec<GroupSnapshotRequest>,
    operation_script: VecDeque<OperationStatus>,
    upload_script: VecDeque<SnapshotState>,
    failing_status_calls: usize,
    failed_members: BTreeSet<String>,
    insert_failure: Option<String>,
    cancel_on_upload_poll: Option<CancellationToken>,
    operations: usize,
}

/// Disk, group and instance services in one. Operations finish and
/// snapshots become READY once their scripts run out.
pub struct FakeCloud {
    log: EventLog,
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new(disks: Vec<DiskDescriptor>) -> Self {
        Self {
            log: EventLog::default(),
            state: Mutex::new(CloudState {
                disks,
                ..CloudState::default()
            }),
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    pub fn inserted_snapshots(&self) -> Vec<SnapshotRequest> {
        lock(&self.state).snapshots.clone()
    }

    pub fn inserted_groups(&self) -> Vec<GroupSnapshotRequest> {
        lock(&self.state).groups.clone()
    }

    pub fn script_operation(&self, statuses: Vec<OperationStatus>) {
        lock(&self.state).operation_script = statuses.into();
    }

    pub fn script_upload(&self, states: Vec<SnapshotState>) {
        lock(&self.state).upload_script = states.into();
    }

    /// The next `n` status reads fail transiently.
    pub fn fail_status_calls(&self, n: usize) {
        lock(&self.state).failing_status_calls = n;
    }

    pub fn fail_group_member(&self, disk: &str) {
        lock(&self.state).failed_members.insert(disk.to_string());
    }

    pub fn fail_insert(&self, message: &str) {
        lock(&self.state).insert_failure = Some(message.to_string());
    }

    pub fn set_attached(&self, attached: Vec<AttachedDisk>) {
        lock(&self.state).attached = Some(attached);
    }

    pub fn cancel_on_upload_poll(&self, cancel: CancellationToken) {
        lock(&self.state).cancel_on_upload_poll = Some(cancel);
    }

    fn transient_failure(&self, service: Service) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing_status_calls > 0 {
            state.failing_status_calls -= 1;
            return Err(BackupError::transient(service, "503 backend unavailable"));
        }
        Ok(())
    }

    fn next_operation_status(&self, service: Service) -> Result<OperationStatus> {
        self.log.push("cloud.operation_status");
        self.transient_failure(service)?;
        Ok(lock(&self.state)
            .operation_script
            .pop_front()
            .unwrap_or(OperationStatus::Done))
    }

    fn next_upload_state(&self) -> SnapshotState {
        let mut state = lock(&self.state);
        if let Some(cancel) = state.cancel_on_upload_poll.take() {
            cancel.cancel();
        }
        state.upload_script.pop_front().unwrap_or(SnapshotState::Ready)
    }

    fn next_operation(&self, project: &str, scope: OperationScope) -> OperationRef {
        let mut state = lock(&self.state);
        state.operations += 1;
        OperationRef {
            project: project.to_string(),
            name: format!("operation-{}", state.operations),
            scope,
        }
    }
}

#[async_trait]
impl DiskService for FakeCloud {
    async fn get_disk(&self, _project: &str, _zone: &str, name: &str) -> Result<DiskDescriptor> {
        self.log.push(format!("cloud.get_disk:{name}"));
        lock(&self.state)
            .disks
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| BackupError::external(Service::DiskSnapshot, format!("disk {name} was not found")))
    }

    async fn insert_snapshot(&self, project: &str, request: &SnapshotRequest) -> Result<OperationRef> {
        self.log.push(format!("cloud.insert_snapshot:{}", request.name));
        if let Some(message) = lock(&self.state).insert_failure.clone() {
            return Err(BackupError::external(Service::DiskSnapshot, message));
        }
        lock(&self.state).snapshots.push(request.clone());
        Ok(self.next_operation(project, OperationScope::Global))
    }

    async fn operation_status(&self, _operation: &OperationRef) -> Result<OperationStatus> {
        self.next_operation_status(Service::DiskSnapshot)
    }

    async fn snapshot_state(&self, _project: &str, _name: &str) -> Result<SnapshotState> {
        self.log.push("cloud.snapshot_state");
        self.transient_failure(Service::DiskSnapshot)?;
        Ok(self.next_upload_state())
    }
}

#[async_trait]
impl GroupService for FakeCloud {
    async fn insert_group(&self, project: &str, request: &GroupSnapshotRequest) -> Result<OperationRef> {
        self.log.push(format!("cloud.insert_group:{}", request.name));
        if let Some(message) = lock(&self.state).insert_failure.clone() {
            return Err(BackupError::external(Service::GroupSnapshot, message));
        }
        lock(&self.state).groups.push(request.clone());
        Ok(self.next_operation(project, OperationScope::Zone(request.zone.clone())))
    }

    async fn operation_status(&self, _operation: &OperationRef) -> Result<OperationStatus> {
        self.next_operation_status(Service::GroupSnapshot)
    }

    async fn group_members(&self, _project: &str, _zone: &str, group: &str) -> Result<Vec<GroupMember>> {
        self.log.push("cloud.group_members");
        let request = lock(&self.state)
            .groups
            .iter()
            .find(|g| g.name == group)
            .cloned()
            .ok_or_else(|| BackupError::external(Service::GroupSnapshot, format!("group {group} was not found")))?;
        let upload_state = self.next_upload_state();
        let failed = lock(&self.state).failed_members.clone();
        Ok(request
            .disks
            .iter()
            .map(|disk| GroupMember {
                name: format!("{group}-{disk}"),
                source_disk: disk.clone(),
                state: if failed.contains(disk) {
                    SnapshotState::Failed
                } else {
                    upload_state.clone()
                },
            })
            .collect())
    }
}

#[async_trait]
impl InstanceService for FakeCloud {
    async fn attached_disks(&self, _instance: &InstanceContext) -> Result<Vec<AttachedDisk>> {
        self.log.push("instance.attached_disks");
        let state = lock(&self.state);
        Ok(match &state.attached {
            Some(attached) => attached.clone(),
            None => state
                .disks
                .iter()
                .map(|d| AttachedDisk {
                    device_name: d.name.clone(),
                    disk_name: d.name.clone(),
                })
                .collect(),
        })
    }
}

struct FailRule {
    pattern: String,
    skip: usize,
    remaining: Option<usize>,
}

struct DbState {
    prepared: Option<String>,
    next_id: u64,
    rules: Vec<FailRule>,
    fail_open: bool,
}

/// In-memory backup catalog holding at most one prepared snapshot.
#[derive(Clone)]
pub struct FakeDb {
    log: EventLog,
    state: Arc<Mutex<DbState>>,
}

impl FakeDb {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            state: Arc::new(Mutex::new(DbState {
                prepared: None,
                next_id: 1001,
                rules: Vec::new(),
                fail_open: false,
            })),
        }
    }

    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    pub fn set_prepared(&self, backup_id: Option<&str>) {
        lock(&self.state).prepared = backup_id.map(String::from);
    }

    pub fn fail_statements_containing(&self, pattern: &str) {
        self.fail_statement(pattern, 0, None);
    }

    /// Fails matching statements after letting `skip` of them through;
    /// `times` of `None` keeps failing.
    pub fn fail_statement(&self, pattern: &str, skip: usize, times: Option<usize>) {
        lock(&self.state).rules.push(FailRule {
            pattern: pattern.to_string(),
            skip,
            remaining: times,
        });
    }

    pub fn fail_open(&self) {
        lock(&self.state).fail_open = true;
    }

    fn check_rules(&self, statement: &str) -> Result<()> {
        let mut state = lock(&self.state);
        for rule in state.rules.iter_mut().filter(|r| statement.contains(&r.pattern)) {
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            match rule.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(BackupError::external(
                Service::Database,
                format!("SQL error executing '{statement}'"),
            ));
        }
        Ok(())
    }
}

fn closed_backup_id(statement: &str) -> Option<String> {
    let rest = statement.split("BACKUP_ID ").nth(1)?;
    rest.split_whitespace().next().map(String::from)
}

#[async_trait]
impl DatabaseConnector for FakeDb {
    async fn query_scalar(&self, statement: &str) -> Result<Option<String>> {
        self.log.push(format!("db.query:{statement}"));
        self.check_rules(statement)?;
        if statement.contains("M_BACKUP_CATALOG") {
            return Ok(lock(&self.state).prepared.clone());
        }
        Ok(Some("1".to_string()))
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        self.log.push(format!("db.execute:{statement}"));
        self.check_rules(statement)?;
        let mut state = lock(&self.state);
        if statement.contains("CREATE SNAPSHOT") {
            if let Some(existing) = &state.prepared {
                return Err(BackupError::external(
                    Service::Database,
                    format!("snapshot {existing} is already prepared"),
                ));
            }
            state.prepared = Some(state.next_id.to_string());
            state.next_id += 1;
        } else if statement.contains("CLOSE SNAPSHOT") {
            let id = closed_backup_id(statement);
            if id.is_none() || id != state.prepared {
                return Err(BackupError::external(
                    Service::Database,
                    format!("backup id {} is not a prepared data snapshot", id.unwrap_or_default()),
                ));
            }
            state.prepared = None;
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseOpener for FakeDb {
    async fn open(&self, request: &BackupRequest) -> Result<Box<dyn DatabaseConnector>> {
        self.log.push(format!("db.connect:{}", request.sid));
        if lock(&self.state).fail_open {
            return Err(BackupError::external(Service::Database, "authentication failed"));
        }
        Ok(Box::new(self.clone()))
    }
}

#[derive(Default)]
struct FsState {
    failing_freezes: usize,
    failing_unfreezes: usize,
    stall: Option<Duration>,
    frozen: bool,
}

pub struct FakeFilesystem {
    log: EventLog,
    state: Mutex<FsState>,
}

impl FakeFilesystem {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            state: Mutex::new(FsState::default()),
        }
    }

    pub fn fail_freezes(&self, n: usize) {
        lock(&self.state).failing_freezes = n;
    }

    pub fn fail_unfreezes(&self, n: usize) {
        lock(&self.state).failing_unfreezes = n;
    }

    /// Freezes take effect at once but the call only returns after `delay`.
    pub fn stall_freezes(&self, delay: Duration) {
        lock(&self.state).stall = Some(delay);
    }

    pub fn is_frozen(&self) -> bool {
        lock(&self.state).frozen
    }
}

#[async_trait]
impl FilesystemControl for FakeFilesystem {
    async fn freeze(&self, mount: &Path) -> Result<()> {
        self.log.push(format!("fs.freeze:{}", mount.display()));
        let stall = {
            let mut state = lock(&self.state);
            if state.failing_freezes > 0 {
                state.failing_freezes -= 1;
                return Err(BackupError::external(Service::Filesystem, "fsfreeze: Operation not supported"));
            }
            state.frozen = true;
            state.stall
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn unfreeze(&self, mount: &Path) -> Result<()> {
        self.log.push(format!("fs.unfreeze:{}", mount.display()));
        let mut state = lock(&self.state);
        if state.failing_unfreezes > 0 {
            state.failing_unfreezes -= 1;
            return Err(BackupError::external(Service::Filesystem, "fsfreeze: Device or resource busy"));
        }
        state.frozen = false;
        Ok(())
    }
}

pub struct FakeMetrics {
    log: EventLog,
    fail: Mutex<bool>,
    sent: Mutex<Vec<(String, MetricLabels)>>,
}

impl FakeMetrics {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_all(&self) {
        *lock(&self.fail) = true;
    }

    /// Labels of the last point written for `metric`.
    pub fn labels_of(&self, metric: &str) -> MetricLabels {
        lock(&self.sent)
            .iter()
            .rev()
            .find(|(name, _)| name == metric)
            .map(|(_, labels)| labels.clone())
            .unwrap_or_default()
    }

    fn record(&self, metric: &str, labels: &MetricLabels, value: String) -> Result<()> {
        self.log.push(format!("metrics.{metric}={value}"));
        lock(&self.sent).push((metric.to_string(), labels.clone()));
        if *lock(&self.fail) {
            return Err(BackupError::external(Service::Monitoring, "permission denied"));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsEmitter for FakeMetrics {
    async fn emit_bool(&self, metric: &str, labels: &MetricLabels, value: bool) -> Result<()> {
        self.record(metric, labels, value.to_string())
    }

    async fn emit_double(&self, metric: &str, labels: &MetricLabels, value: f64) -> Result<()> {
        self.record(metric, labels, format!("{value:.3}"))
    }
}

pub struct FakeDiscovery {
    log: EventLog,
    disks: Vec<String>,
}

impl FakeDiscovery {
    pub fn new(log: EventLog, disks: &[&str]) -> Self {
        Self {
            log,
            disks: disks.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[async_trait]
impl DiskDiscovery for FakeDiscovery {
    async fn data_disks(&self, _instance: &InstanceContext) -> Result<Vec<String>> {
        self.log.push("discovery.data_disks");
        Ok(self.disks.clone())
    }
}
