//! Cloud block-storage domain: disks, snapshots, snapshot groups and the
//! service interfaces the backup workflow drives.

pub mod gce;
pub mod group;
pub mod keys;
pub mod metadata;
pub mod snapshot;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::SnapshotType;
use crate::errors::Result;

/// Where the current process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceContext {
    pub project: String,
    pub zone: String,
    pub instance_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionKey {
    /// Customer-managed key held in the key management service.
    Kms(String),
    /// Customer-supplied raw AES-256 key, base64.
    Raw(String),
    /// Customer-supplied key wrapped with the platform RSA key, base64.
    RsaWrapped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub name: String,
    pub zone: String,
    pub project: String,
    pub self_link: String,
    pub disk_type: String,
    pub encryption_key: Option<EncryptionKey>,
    pub provisioned_iops: Option<i64>,
    pub provisioned_throughput: Option<i64>,
    pub resource_policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDisk {
    pub device_name: String,
    pub disk_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationScope {
    Global,
    Zone(String),
}

/// Reference to an asynchronous cloud operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRef {
    pub project: String,
    pub name: String,
    pub scope: OperationScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    Failed(String),
}

/// Lifecycle of the snapshot object itself, independent of the operation
/// that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    Creating,
    Uploading,
    Ready,
    Failed,
    Deleting,
    Unknown(String),
}

impl SnapshotState {
    pub fn from_api(status: &str) -> Self {
        match status {
            "CREATING" => SnapshotState::Creating,
            "UPLOADING" => SnapshotState::Uploading,
            "READY" => SnapshotState::Ready,
            "FAILED" | "INVALID" => SnapshotState::Failed,
            "DELETING" => SnapshotState::Deleting,
            other => SnapshotState::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotState::Creating => f.write_str("CREATING"),
            SnapshotState::Uploading => f.write_str("UPLOADING"),
            SnapshotState::Ready => f.write_str("READY"),
            SnapshotState::Failed => f.write_str("FAILED"),
            SnapshotState::Deleting => f.write_str("DELETING"),
            SnapshotState::Unknown(s) => f.write_str(s),
        }
    }
}

/// Metadata sent with a snapshot or group create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub description: String,
    pub storage_location: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub snapshot_type: SnapshotType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub name: String,
    pub source_disk: DiskDescriptor,
    pub metadata: SnapshotMetadata,
    pub encryption_key: Option<EncryptionKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshotRequest {
    pub name: String,
    pub zone: String,
    pub consistency_group: String,
    pub disks: Vec<String>,
    pub metadata: SnapshotMetadata,
}

/// An in-flight or completed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub name: String,
    pub source_disk: String,
    pub operation: Option<OperationRef>,
}

/// A group snapshot and the member snapshot per disk it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHandle {
    pub name: String,
    pub project: String,
    pub zone: String,
    pub operation: OperationRef,
    pub members: Vec<SnapshotHandle>,
}

/// One member snapshot of a group as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub name: String,
    pub source_disk: String,
    pub state: SnapshotState,
}

#[async_trait]
pub trait InstanceService: Send + Sync {
    async fn attached_disks(&self, instance: &InstanceContext) -> Result<Vec<AttachedDisk>>;
}

#[async_trait]
pub trait DiskService: Send + Sync {
    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> Result<DiskDescriptor>;
    async fn insert_snapshot(&self, project: &str, request: &SnapshotRequest) -> Result<OperationRef>;
    async fn operation_status(&self, operation: &OperationRef) -> Result<OperationStatus>;
    async fn snapshot_state(&self, project: &str, name: &str) -> Result<SnapshotState>;
}

#[async_trait]
pub trait GroupService: Send + Sync {
    async fn insert_group(&self, project: &str, request: &GroupSnapshotRequest) -> Result<OperationRef>;
    async fn operation_status(&self, operation: &OperationRef) -> Result<OperationStatus>;
    async fn group_members(&self, project: &str, zone: &str, group: &str) -> Result<Vec<GroupMember>>;
}
