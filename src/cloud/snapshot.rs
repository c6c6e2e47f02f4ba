// hanadiskbackup/src/cloud/snapshot.rs
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{DiskDescriptor, DiskService, OperationStatus, SnapshotHandle, SnapshotRequest, SnapshotState};
use crate::config::PollingConfig;
use crate::errors::{Result, Service};
use crate::utils::backoff::{PollStatus, poll_until, retry_call, with_timeout};

/// Single-disk snapshot lifecycle: create, wait for the creating operation,
/// then wait for the snapshot object to finish uploading.
pub struct DiskSnapshotClient<'a> {
    service: &'a dyn DiskService,
    polling: &'a PollingConfig,
    cancel: &'a CancellationToken,
}

impl<'a> DiskSnapshotClient<'a> {
    pub fn new(service: &'a dyn DiskService, polling: &'a PollingConfig, cancel: &'a CancellationToken) -> Self {
        Self { service, polling, cancel }
    }

    pub async fn describe_disk(&self, project: &str, zone: &str, name: &str) -> Result<DiskDescriptor> {
        let limit = self.polling.api_call_timeout;
        retry_call("get disk", &self.polling.call, self.cancel, || {
            with_timeout(Service::DiskSnapshot, limit, "get disk", self.service.get_disk(project, zone, name))
        })
        .await
    }

    /// Submits the snapshot. Returns as soon as the service accepts the
    /// request; materialisation and upload continue asynchronously.
    /// Not retried: a resubmitted insert could race the first one.
    pub async fn create(&self, request: &SnapshotRequest) -> Result<SnapshotHandle> {
        info!(
            snapshot = %request.name,
            disk = %request.source_disk.name,
            encrypted = request.encryption_key.is_some(),
            "Requesting disk snapshot"
        );
        let operation = with_timeout(
            Service::DiskSnapshot,
            self.polling.api_call_timeout,
            "create snapshot",
            self.service.insert_snapshot(&request.source_disk.project, request),
        )
        .await?;
        Ok(SnapshotHandle {
            name: request.name.clone(),
            source_disk: request.source_disk.name.clone(),
            operation: Some(operation),
        })
    }

    pub async fn wait_for_creation(&self, handle: &SnapshotHandle) -> Result<()> {
        let Some(operation) = handle.operation.as_ref() else {
            return Ok(());
        };
        let limit = self.polling.api_call_timeout;
        let what = format!("creation of snapshot {}", handle.name);
        poll_until(&what, Service::DiskSnapshot, &self.polling.creation, self.cancel, || async {
            let status = retry_call("get operation", &self.polling.call, self.cancel, || {
                with_timeout(
                    Service::DiskSnapshot,
                    limit,
                    "get operation",
                    self.service.operation_status(operation),
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
        info!(snapshot = %handle.name, "Snapshot creation completed");
        Ok(())
    }

    /// Polls the snapshot object's own status until it is READY.
    pub async fn wait_for_upload(&self, project: &str, handle: &SnapshotHandle) -> Result<()> {
        let limit = self.polling.api_call_timeout;
        let what = format!("upload of snapshot {}", handle.name);
        poll_until(&what, Service::DiskSnapshot, &self.polling.upload, self.cancel, || async {
            let state = retry_call("get snapshot", &self.polling.call, self.cancel, || {
                with_timeout(
                    Service::DiskSnapshot,
                    limit,
                    "get snapshot",
                    self.service.snapshot_state(project, &handle.name),
                )
            })
            .await?;
            Ok(upload_progress(state))
        })
        .await?;
        info!(snapshot = %handle.name, "Snapshot upload completed");
        Ok(())
    }
}

pub(crate) fn upload_progress(state: SnapshotState) -> PollStatus<()> {
    match state {
        SnapshotState::Ready => PollStatus::Done(()),
        SnapshotState::Failed | SnapshotState::Deleting => PollStatus::Failed(format!("snapshot is {state}")),
        other => PollStatus::Pending(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fakes::{FakeCloud, fast_polling, sample_disk};
    use crate::cloud::SnapshotMetadata;
    use crate::config::SnapshotType;
    use crate::errors::BackupError;
    use std::collections::BTreeMap;

    fn request(disk: DiskDescriptor) -> SnapshotRequest {
        SnapshotRequest {
            name: "snapshot-d1-20240101-000000".to_string(),
            source_disk: disk,
            metadata: SnapshotMetadata {
                description: "test".to_string(),
                storage_location: None,
                labels: BTreeMap::new(),
                snapshot_type: SnapshotType::Standard,
            },
            encryption_key: None,
        }
    }

    #[tokio::test]
    async fn test_create_returns_handle_with_operation() -> anyhow::Result<()> {
        let cloud = FakeCloud::new(vec![sample_disk("d1")]);
        let polling = fast_polling();
        let cancel = CancellationToken::new();
        let client = DiskSnapshotClient::new(&cloud, &polling, &cancel);

        let handle = client.create(&request(sample_disk("d1"))).await?;
        assert_eq!(handle.name, "snapshot-d1-20240101-000000");
        assert_eq!(handle.source_disk, "d1");
        assert!(handle.operation.is_some());
        assert_eq!(cloud.inserted_snapshots().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_creation_polls_until_done() -> anyhow::Result<()> {
        let cloud = FakeCloud::new(vec![sample_disk("d1")]);
        cloud.script_operation(vec![OperationStatus::Pending, OperationStatus::Running]);
        let polling = fast_polling();
        let cancel = CancellationToken::new();
        let client = DiskSnapshotClient::new(&cloud, &polling, &cancel);

        let handle = client.create(&request(sample_disk("d1"))).await?;
        client.wait_for_creation(&handle).await?;
        assert_eq!(cloud.log().count("cloud.operation_status"), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_creation_surfaces_operation_failure() -> anyhow::Result<()> {
        let cloud = FakeCloud::new(vec![sample_disk("d1")]);
        cloud.script_operation(vec![OperationStatus::Failed("QUOTA_EXCEEDED".to_string())]);
        let polling = fast_polling();
        let cancel = CancellationToken::new();
        let client = DiskSnapshotClient::new(&cloud, &polling, &cancel);

        let handle = client.create(&request(sample_disk("d1"))).await?;
        let err = client.wait_for_creation(&handle).await.unwrap_err();
        assert!(matches!(err, BackupError::ExternalService { .. }));
        assert!(err.to_string().contains("QUOTA_EXCEEDED"));
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_upload_tracks_snapshot_object_status() -> anyhow::Result<()> {
        let cloud = FakeCloud::new(vec![sample_disk("d1")]);
        cloud.script_upload(vec![SnapshotState::Creating, SnapshotState::Uploading]);
        let polling = fast_polling();
        let cancel = CancellationToken::new();
        let client = DiskSnapshotClient::new(&cloud, &polling, &cancel);

        let handle = client.create(&request(sample_disk("d1"))).await?;
        client.wait_for_upload("proj", &handle).await?;
        assert_eq!(cloud.log().count("cloud.snapshot_state"), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_status_errors_are_retried() -> anyhow::Result<()> {
        let cloud = FakeCloud::new(vec![sample_disk("d1")]);
        cloud.fail_status_calls(2);
        let polling = fast_polling();
        let cancel = CancellationToken::new();
        let client = DiskSnapshotClient::new(&cloud, &polling, &cancel);

        let handle = client.create(&request(sample_disk("d1"))).await?;
        client.wait_for_creation(&handle).await?;
        Ok(())
    }

    #[test]
    fn test_upload_progress_mapping() {
        assert_eq!(upload_progress(SnapshotState::Ready), PollStatus::Done(()));
        assert!(matches!(upload_progress(SnapshotState::Failed), PollStatus::Failed(_)));
        assert_eq!(
            upload_progress(SnapshotState::Uploading),
            PollStatus::Pending("UPLOADING".to_string())
        );
    }
}
