// hanadiskbackup/src/cloud/group.rs
use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    DiskDescriptor, GroupHandle, GroupMember, GroupService, GroupSnapshotRequest, OperationStatus,
    SnapshotHandle, SnapshotMetadata, SnapshotState,
};
use crate::config::PollingConfig;
use crate::errors::{BackupError, Result, Service};
use crate::utils::backoff::{PollStatus, poll_until, retry_call, with_timeout};

/// The single resource policy shared by every disk of the set. Disks that
/// do not share exactly one policy cannot be snapshotted as one group.
pub fn consistency_group(disks: &[DiskDescriptor]) -> Result<String> {
    let Some((first, rest)) = disks.split_first() else {
        return Err(BackupError::Precondition("group snapshot needs at least one disk".to_string()));
    };
    let mut shared: BTreeSet<&String> = first.resource_policies.iter().collect();
    for disk in rest {
        let policies: BTreeSet<&String> = disk.resource_policies.iter().collect();
        shared = shared.intersection(&policies).copied().collect();
    }
    match shared.len() {
        1 => Ok(shared.into_iter().next().cloned().unwrap_or_default()),
        0 => Err(BackupError::Precondition(format!(
            "disks {} are not members of a common consistency group",
            names(disks)
        ))),
        _ => Err(BackupError::Precondition(format!(
            "disks {} share more than one resource policy; cannot tell which is the consistency group",
            names(disks)
        ))),
    }
}

fn names(disks: &[DiskDescriptor]) -> String {
    disks.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
}

/// Multi-disk snapshot as one consistency group. Any member failure fails
/// the whole group.
pub struct GroupSnapshotClient<'a> {
    service: &'a dyn GroupService,
    polling: &'a PollingConfig,
    cancel: &'a CancellationToken,
}

impl<'a> GroupSnapshotClient<'a> {
    pub fn new(service: &'a dyn GroupService, polling: &'a PollingConfig, cancel: &'a CancellationToken) -> Self {
        Self { service, polling, cancel }
    }

    /// One call naming the full disk set.
    pub async fn create(
        &self,
        name: &str,
        disks: &[DiskDescriptor],
        metadata: SnapshotMetadata,
    ) -> Result<GroupHandle> {
        let consistency_group = consistency_group(disks)?;
        let (project, zone) = match disks.first() {
            Some(d) => (d.project.clone(), d.zone.clone()),
            None => return Err(BackupError::Precondition("group snapshot needs at least one disk".to_string())),
        };
        let request = GroupSnapshotRequest {
            name: name.to_string(),
            zone: zone.clone(),
            consistency_group,
            disks: disks.iter().map(|d| d.name.clone()).collect(),
            metadata,
        };
        info!(group = %name, disks = %names(disks), "Requesting group snapshot");
        let operation = with_timeout(
            Service::GroupSnapshot,
            self.polling.api_call_timeout,
            "create group snapshot",
            self.service.insert_group(&project, &request),
        )
        .await?;
        Ok(GroupHandle {
            name: name.to_string(),
            project,
            zone,
            operation,
            members: disks
                .iter()
                .map(|d| SnapshotHandle {
                    name: format!("{name}-{}", d.name),
                    source_disk: d.name.clone(),
                    operation: None,
                })
                .collect(),
        })
    }

    async fn members(&self, handle: &GroupHandle) -> Result<Vec<GroupMember>> {
        let limit = self.polling.api_call_timeout;
        retry_call("list group members", &self.polling.call, self.cancel, || {
            with_timeout(
                Service::GroupSnapshot,
                limit,
                "list group members",
                self.service.group_members(&handle.project, &handle.zone, &handle.name),
            )
        })
        .await
    }

    /// Waits for the group operation, then records the member names the
    /// service assigned. The member set must match the requested disks.
    pub async fn wait_for_creation(&self, handle: &mut GroupHandle) -> Result<()> {
        let limit = self.polling.api_call_timeout;
        let what = format!("creation of group snapshot {}", handle.name);
        let operation = handle.operation.clone();
        poll_until(&what, Service::GroupSnapshot, &self.polling.creation, self.cancel, || async {
            let status = retry_call("get group operation", &self.polling.call, self.cancel, || {
                with_timeout(
                    Service::GroupSnapshot,
                    limit,
                    "get group operation",
                    self.service.operation_status(&operation),
                )
            })
            .await?;
            Ok(match status {
                OperationStatus::Done => PollStatus::Done(()),
                OperationStatus::Failed(reason) => PollStatus::Failed(reason),
                OperationStatus::Pending => PollStatus::Pending("PENDING".to_string()),
                OperationStatus::Running => PollStatus::Pending("RUNNING".to_string()),
            })
        })
        .await?;

        let members = self.members(handle).await?;
        let expected: BTreeSet<&str> = handle.members.iter().map(|m| m.source_disk.as_str()).collect();
        let actual: BTreeSet<&str> = members.iter().map(|m| m.source_disk.as_str()).collect();
        if expected != actual {
            return Err(BackupError::external(
                Service::GroupSnapshot,
                format!(
                    "group snapshot {} has members for {:?}, expected {:?}",
                    handle.name, actual, expected
                ),
            ));
        }
        if let Some(failed) = members.iter().find(|m| m.state == SnapshotState::Failed) {
            return Err(BackupError::external(
                Service::GroupSnapshot,
                format!("member {} of group {} failed", failed.name, handle.name),
            ));
        }
        for member in &mut handle.members {
            if let Some(found) = members.iter().find(|m| m.source_disk == member.source_disk) {
                member.name = found.name.clone();
            }
        }
        info!(group = %handle.name, members = handle.members.len(), "Group snapshot creation completed");
        Ok(())
    }

    /// Done only once every member is READY.
    pub async fn wait_for_upload(&self, handle: &GroupHandle) -> Result<()> {
        let what = format!("upload of group snapshot {}", handle.name);
        poll_until(&what, Service::GroupSnapshot, &self.polling.upload, self.cancel, || async {
            let members = self.members(handle).await?;
            Ok(group_progress(handle, &members))
        })
        .await?;
        info!(group = %handle.name, "Group snapshot upload completed");
        Ok(())
    }
}

pub(crate) fn group_progress(handle: &GroupHandle, members: &[GroupMember]) -> PollStatus<()> {
    let mut pending = Vec::new();
    for expected in &handle.members {
        match members.iter().find(|m| m.source_disk == expected.source_disk) {
            None => {
                warn!(group = %handle.name, disk = %expected.source_disk, "Group member not reported");
                pending.push(format!("{}:MISSING", expected.source_disk));
            }
            Some(m) if m.state == SnapshotState::Ready => {}
            Some(m) if matches!(m.state, SnapshotState::Failed | SnapshotState::Deleting) => {
                return PollStatus::Failed(format!("member {} is {}", m.name, m.state));
            }
            Some(m) => pending.push(format!("{}:{}", m.source_disk, m.state)),
        }
    }
    if pending.is_empty() {
        PollStatus::Done(())
    } else {
        PollStatus::Pending(pending.join(","))
    }
}
